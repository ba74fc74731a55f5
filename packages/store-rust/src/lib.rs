//! confdb store: the cached index of networks and members, the
//! `ConfigStore` contract and its backends, and mirroring across backends.

pub mod backends;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod index;
pub mod lifecycle;
pub mod listener;
pub mod mirror;
pub mod presence;
pub mod store;
pub mod telemetry;

pub use config::{
    BackendConfig, ChangefeedConfig, FilesystemConfig, LedgerConfig, MirrorConfig, PollingConfig,
    RelationalConfig, RetryPolicy, StoreConfig,
};
pub use error::StoreError;
pub use events::{StoreEvent, StoreId};
pub use factory::{controller_config, open_backend, open_store};
pub use index::CachedIndex;
pub use lifecycle::StoreState;
pub use listener::ChangeListener;
pub use mirror::MirrorSet;
pub use store::{ConfigStore, StoreCore};
