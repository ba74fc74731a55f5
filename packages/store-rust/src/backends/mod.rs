//! [`ConfigStore`](crate::store::ConfigStore) implementations.

pub mod changefeed;
pub mod filesystem;
pub mod ledger;
pub mod memory;
pub mod relational;

pub use changefeed::ChangefeedStore;
pub use filesystem::FilesystemStore;
pub use ledger::LedgerStore;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use relational::RelationalStore;
