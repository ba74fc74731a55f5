//! Opens fully-wired stores from configuration.
//!
//! A single configured backend is returned as is; several are combined in
//! a [`MirrorSet`].

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::backends::{FilesystemStore, LedgerStore, MemoryStore};
use crate::config::{BackendConfig, LedgerConfig, StoreConfig};
use crate::error::StoreError;
use crate::mirror::MirrorSet;
use crate::store::ConfigStore;

/// Builds the store configuration a controller uses: the backend selected
/// by its database path, mirrored with a ledger when the service
/// `local.conf` enables one.
///
/// # Errors
///
/// Propagates [`BackendConfig::from_path`] errors.
pub fn controller_config(
    path: &str,
    controller_id: &str,
    local_conf: Option<&Value>,
) -> Result<StoreConfig, StoreError> {
    let mut backends = vec![BackendConfig::from_path(path, controller_id)?];
    if let Some(ledger) = local_conf.and_then(|conf| LedgerConfig::from_local_conf(conf, controller_id)) {
        backends.push(BackendConfig::Ledger(ledger));
    }
    Ok(StoreConfig {
        backends,
        ..StoreConfig::default()
    })
}

/// Opens one backend.
///
/// # Errors
///
/// Returns the backend's open error.
pub async fn open_backend(config: BackendConfig) -> Result<Arc<dyn ConfigStore>, StoreError> {
    let store: Arc<dyn ConfigStore> = match config {
        BackendConfig::Filesystem(fs) => Arc::new(FilesystemStore::open(fs).await?),
        #[cfg(feature = "postgres")]
        BackendConfig::Relational(rel) => {
            Arc::new(crate::backends::RelationalStore::open(rel).await?)
        }
        BackendConfig::Ledger(ledger) => Arc::new(LedgerStore::open(ledger)?),
        BackendConfig::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

/// Opens every configured backend, mirroring them when there is more than
/// one. Must be called inside a tokio runtime.
///
/// # Errors
///
/// Fails when no backend is configured or any backend fails to open. Stores
/// opened before the failure are shut down.
pub async fn open_store(config: StoreConfig) -> Result<Arc<dyn ConfigStore>, StoreError> {
    if config.backends.is_empty() {
        return Err(StoreError::InvalidConfig("no backend configured".into()));
    }
    let mut stores = Vec::with_capacity(config.backends.len());
    for backend in config.backends {
        match open_backend(backend).await {
            Ok(store) => {
                info!(backend = store.kind(), id = %store.id(), "backend opened");
                stores.push(store);
            }
            Err(err) => {
                for store in &stores {
                    store.shutdown().await;
                }
                return Err(err);
            }
        }
    }
    if stores.len() == 1 {
        return Ok(stores.remove(0));
    }
    Ok(Arc::new(MirrorSet::new(stores, &config.mirror)?))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use confdb_core::{NetworkId, NetworkRecord};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::{FilesystemConfig, MirrorConfig};

    #[tokio::test]
    async fn single_backend_is_not_wrapped() {
        let store = open_store(StoreConfig {
            backends: vec![BackendConfig::Memory],
            ..StoreConfig::default()
        })
        .await
        .unwrap();
        assert_eq!(store.kind(), "memory");
        assert!(store.wait_for_ready().await);
    }

    #[tokio::test]
    async fn several_backends_are_mirrored() {
        let dir = TempDir::new().unwrap();
        let store = open_store(StoreConfig {
            backends: vec![
                BackendConfig::Memory,
                BackendConfig::Filesystem(FilesystemConfig {
                    path: dir.path().to_path_buf(),
                    ..FilesystemConfig::default()
                }),
            ],
            mirror: MirrorConfig { sync: None },
        })
        .await
        .unwrap();
        assert_eq!(store.kind(), "mirror");

        let mut events = store.subscribe();
        let id = NetworkId::new(0xabc).unwrap();
        assert!(store.save(NetworkRecord::new(id).into(), true).await);
        events.recv().await.unwrap();
        assert!(dir.path().join("0000000000000abc.json").exists());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn nothing_configured_is_an_error() {
        assert!(matches!(
            open_store(StoreConfig::default()).await,
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn failed_backend_aborts_open() {
        let ledger = BackendConfig::Ledger(LedgerConfig::default());
        let result = open_store(StoreConfig {
            backends: vec![BackendConfig::Memory, ledger],
            ..StoreConfig::default()
        })
        .await;
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn local_conf_adds_ledger_mirror() {
        let conf = json!({
            "settings": {"controllerDb": {"type": "lf", "host": "10.0.0.2", "port": 9980, "owner": "o"}}
        });
        let config = controller_config("/var/lib/ctl/controller.d", "abcdef0123", Some(&conf)).unwrap();
        assert_eq!(config.backends.len(), 2);
        match &config.backends[1] {
            BackendConfig::Ledger(ledger) => assert_eq!(ledger.url, "http://10.0.0.2:9980"),
            other => panic!("unexpected backend {other:?}"),
        }
        match &config.backends[0] {
            BackendConfig::Filesystem(fs) => {
                assert_eq!(fs.path, PathBuf::from("/var/lib/ctl/controller.d"));
            }
            other => panic!("unexpected backend {other:?}"),
        }

        let plain = controller_config("/tmp/ctl", "abcdef0123", None).unwrap();
        assert_eq!(plain.backends.len(), 1);
    }
}
