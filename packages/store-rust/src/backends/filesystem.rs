//! Directory-tree backend.
//!
//! Layout under the base directory:
//!
//! ```text
//! <nwid>.json               network record
//! <nwid>/<memberid>.json    one file per member
//! <nwid>-online.json        presence snapshot, rewritten on a timer
//! ```
//!
//! Every `save` is a synchronous write-then-rename of one file; there is no
//! cross-file transaction. Writes touching one network (its record, its
//! members, its online snapshot, its erasure) are serialized by a
//! per-network lock held from change detection to cache commit. Files that
//! fail to parse during the bootstrap scan are logged and skipped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Write as _};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use confdb_core::{
    ClockSource, MemberId, MemberRecord, NetworkId, NetworkRecord, NetworkSummary, Record,
    RecordKey, SystemClock,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::FilesystemConfig;
use crate::error::StoreError;
use crate::events::{StoreEvent, StoreId};
use crate::presence::{PresenceBuffer, PresenceUpdate};
use crate::store::{ConfigStore, StoreCore};

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

fn network_path(base: &Path, network_id: NetworkId) -> PathBuf {
    base.join(format!("{network_id}.json"))
}

fn member_dir(base: &Path, network_id: NetworkId) -> PathBuf {
    base.join(network_id.to_hex())
}

fn member_path(base: &Path, network_id: NetworkId, member_id: MemberId) -> PathBuf {
    member_dir(base, network_id).join(format!("{member_id}.json"))
}

fn online_path(base: &Path, network_id: NetworkId) -> PathBuf {
    base.join(format!("{network_id}-online.json"))
}

/// Writes `bytes` to a uniquely named sibling temp file, syncs it, and
/// renames it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn remove_if_present(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn blocking<T, F>(task: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(io::Error::other)?
}

// ---------------------------------------------------------------------------
// Bootstrap scan
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ScanResult {
    networks: Vec<NetworkRecord>,
    members: Vec<MemberRecord>,
    online: Vec<(NetworkId, OnlineSnapshot)>,
    skipped: usize,
}

fn scan(base: &Path) -> io::Result<ScanResult> {
    let mut result = ScanResult::default();
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            if let Ok(network_id) = name.parse::<NetworkId>() {
                scan_members(&path, network_id, &mut result);
            }
        } else if let Some(stem) = name.strip_suffix("-online.json") {
            if let Ok(network_id) = stem.parse::<NetworkId>() {
                match read_online(&path) {
                    Ok(snapshot) => result.online.push((network_id, snapshot)),
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable online snapshot"),
                }
            }
        } else if let Some(stem) = name.strip_suffix(".json") {
            let Ok(network_id) = stem.parse::<NetworkId>() else {
                continue;
            };
            match std::fs::read(&path).map_err(StoreError::from).and_then(|bytes| {
                NetworkRecord::from_slice(&bytes).map_err(StoreError::from)
            }) {
                Ok(network) if network.id == network_id => result.networks.push(network),
                Ok(network) => {
                    warn!(path = %path.display(), id = %network.id, "network file id mismatch, skipping");
                    result.skipped += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping corrupt network file");
                    result.skipped += 1;
                }
            }
        }
    }
    Ok(result)
}

fn scan_members(dir: &Path, network_id: NetworkId, result: &mut ScanResult) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "skipping unreadable member directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(member_id) = name
            .strip_suffix(".json")
            .and_then(|stem| stem.parse::<MemberId>().ok())
        else {
            continue;
        };
        let parsed = std::fs::read(&path)
            .map_err(StoreError::from)
            .and_then(|bytes| MemberRecord::from_slice(&bytes).map_err(StoreError::from));
        match parsed {
            Ok(member) if member.id == member_id && member.network_id == network_id => {
                result.members.push(member);
            }
            Ok(_) => {
                warn!(path = %path.display(), "member file id mismatch, skipping");
                result.skipped += 1;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping corrupt member file");
                result.skipped += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Online snapshots
// ---------------------------------------------------------------------------

/// Member hex id -> `(timestamp, address)` pairs, newest first.
type OnlineSnapshot = BTreeMap<String, Vec<(u64, String)>>;

fn read_online(path: &Path) -> Result<OnlineSnapshot, StoreError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Retained presence history, owned by the flush path.
#[derive(Debug, Default)]
struct OnlineHistory {
    networks: HashMap<NetworkId, OnlineSnapshot>,
    dirty: HashSet<NetworkId>,
}

impl OnlineHistory {
    fn merge(&mut self, update: &PresenceUpdate, limit: usize) {
        let entries = self
            .networks
            .entry(update.network_id)
            .or_default()
            .entry(update.member_id.to_hex())
            .or_default();
        let address = update.address_string();
        match entries.iter_mut().find(|(_, addr)| *addr == address) {
            Some(existing) => existing.0 = existing.0.max(update.timestamp),
            None => entries.push((update.timestamp, address)),
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.truncate(limit.max(1));
        self.dirty.insert(update.network_id);
    }

    /// Serialized snapshots for every dirty network; clears the dirty set.
    fn take_dirty(&mut self) -> Result<Vec<(NetworkId, Vec<u8>)>, serde_json::Error> {
        let dirty: Vec<NetworkId> = self.dirty.drain().collect();
        let mut out = Vec::with_capacity(dirty.len());
        for network_id in dirty {
            if let Some(snapshot) = self.networks.get(&network_id) {
                out.push((network_id, serde_json::to_vec_pretty(snapshot)?));
            }
        }
        Ok(out)
    }

    fn forget(&mut self, network_id: NetworkId) {
        self.networks.remove(&network_id);
        self.dirty.remove(&network_id);
    }
}

// ---------------------------------------------------------------------------
// FilesystemStore
// ---------------------------------------------------------------------------

struct Shared {
    base: PathBuf,
    presence: PresenceBuffer,
    history: Mutex<OnlineHistory>,
    history_limit: usize,
    write_locks: DashMap<NetworkId, Arc<AsyncMutex<()>>>,
}

impl Shared {
    async fn lock_network(&self, network_id: NetworkId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&*self.write_locks.entry(network_id).or_default());
        lock.lock_owned().await
    }

    async fn flush_presence(&self) -> Result<usize, StoreError> {
        let updates = self.presence.drain();
        let files = {
            let mut history = self.history.lock();
            for update in &updates {
                history.merge(update, self.history_limit);
            }
            history.take_dirty()?
        };
        let mut written = 0;
        let mut failed = Vec::new();
        let mut last_error = None;
        for (network_id, bytes) in files {
            let _guard = self.lock_network(network_id).await;
            // Erased while this flush was pending.
            if !self.history.lock().networks.contains_key(&network_id) {
                continue;
            }
            let path = online_path(&self.base, network_id);
            match blocking(move || write_atomic(&path, &bytes)).await {
                Ok(()) => written += 1,
                Err(err) => {
                    failed.push(network_id);
                    last_error = Some(err);
                }
            }
        }
        if let Some(err) = last_error {
            self.history.lock().dirty.extend(failed);
            return Err(err.into());
        }
        if written > 0 {
            metrics::counter!("confdb_presence_flush_total", "backend" => "filesystem")
                .increment(1);
        }
        Ok(written)
    }
}

/// Store backed by one JSON file per record.
pub struct FilesystemStore {
    core: StoreCore,
    shared: Arc<Shared>,
}

impl FilesystemStore {
    /// Opens (creating if needed) the directory and loads every record.
    ///
    /// # Errors
    ///
    /// Fails when the base directory cannot be created or listed.
    pub async fn open(config: FilesystemConfig) -> Result<Self, StoreError> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn open_with_clock(
        config: FilesystemConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, StoreError> {
        let base = config.path.clone();
        let scan_base = base.clone();
        let scanned = blocking(move || {
            std::fs::create_dir_all(&scan_base)?;
            scan(&scan_base)
        })
        .await?;

        let core = StoreCore::new("filesystem", clock);
        for network in scanned.networks {
            core.ingest(Record::Network(network), false);
        }
        for member in scanned.members {
            core.ingest(Record::Member(member), false);
        }
        let mut history = OnlineHistory::default();
        history.networks.extend(scanned.online);

        info!(
            path = %base.display(),
            networks = core.index().networks().len(),
            members = core.index().member_count(),
            skipped = scanned.skipped,
            "filesystem store loaded"
        );
        core.record_gauges();
        core.lifecycle().set_ready();

        let shared = Arc::new(Shared {
            base,
            presence: PresenceBuffer::new(),
            history: Mutex::new(history),
            history_limit: config.online_history_limit,
            write_locks: DashMap::new(),
        });

        let flusher = Arc::clone(&shared);
        let mut stop = core.lifecycle().stop_signal();
        let cadence = config.online_flush;
        core.lifecycle().spawn(async move {
            while stop.sleep(cadence.next_delay()).await {
                if let Err(err) = flusher.flush_presence().await {
                    warn!(error = %err, "online snapshot flush failed");
                }
            }
            debug!("online snapshot flusher stopped");
        });

        Ok(Self { core, shared })
    }

    /// Writes pending presence to the online snapshots now. Returns the
    /// number of snapshot files rewritten.
    ///
    /// # Errors
    ///
    /// Fails when a snapshot file cannot be written; the affected networks
    /// are retried on the next flush.
    pub async fn flush_presence(&self) -> Result<usize, StoreError> {
        self.shared.flush_presence().await
    }

    async fn persist(&self, record: &Record) -> Result<(), StoreError> {
        let path = match record.key() {
            RecordKey::Network(id) => network_path(&self.shared.base, id),
            RecordKey::Member(nid, mid) => member_path(&self.shared.base, nid, mid),
        };
        let bytes = serde_json::to_vec_pretty(&record.to_value()?)?;
        blocking(move || write_atomic(&path, &bytes)).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FilesystemStore {
    fn id(&self) -> StoreId {
        self.core.id()
    }

    fn kind(&self) -> &'static str {
        self.core.kind()
    }

    fn network(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        self.core.index().network(network_id)
    }

    fn member(&self, network_id: NetworkId, member_id: MemberId) -> Option<MemberRecord> {
        self.core.index().member(network_id, member_id)
    }

    fn members(&self, network_id: NetworkId) -> Vec<MemberRecord> {
        self.core.index().members(network_id)
    }

    fn summary(&self, network_id: NetworkId) -> Option<NetworkSummary> {
        self.core.index().summary(network_id)
    }

    fn networks(&self) -> Vec<NetworkId> {
        self.core.index().networks()
    }

    async fn save(&self, record: Record, notify_listeners: bool) -> bool {
        let key = record.key();
        let _guard = self.shared.lock_network(key.network_id()).await;
        let Some(write) = self.core.prepare_write(record) else {
            return false;
        };
        match self.persist(&write.new).await {
            Ok(()) => {
                self.core.commit(write, notify_listeners);
                true
            }
            Err(err) => {
                self.core.record_failed_save(key, &err);
                false
            }
        }
    }

    async fn erase_network(&self, network_id: NetworkId, notify_listeners: bool) {
        let _guard = self.shared.lock_network(network_id).await;
        let base = self.shared.base.clone();
        let result = blocking(move || {
            remove_if_present(std::fs::remove_file(network_path(&base, network_id)))?;
            remove_if_present(std::fs::remove_dir_all(member_dir(&base, network_id)))?;
            remove_if_present(std::fs::remove_file(online_path(&base, network_id)))
        })
        .await;
        match result {
            Ok(()) => {
                self.shared.history.lock().forget(network_id);
                self.shared.presence.forget_network(network_id);
                self.core.remove_network(network_id, notify_listeners);
                self.core.record_gauges();
            }
            Err(err) => warn!(%network_id, error = %err, "erase network failed"),
        }
    }

    async fn erase_member(&self, network_id: NetworkId, member_id: MemberId, notify_listeners: bool) {
        let _guard = self.shared.lock_network(network_id).await;
        let path = member_path(&self.shared.base, network_id, member_id);
        match blocking(move || remove_if_present(std::fs::remove_file(path))).await {
            Ok(()) => {
                self.core.remove_member(network_id, member_id, notify_listeners);
            }
            Err(err) => warn!(%network_id, %member_id, error = %err, "erase member failed"),
        }
    }

    fn node_is_online(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        address: Option<SocketAddr>,
    ) {
        if !self.core.index().contains_network(network_id) {
            return;
        }
        self.shared
            .presence
            .record(network_id, member_id, self.core.now(), address);
    }

    fn is_ready(&self) -> bool {
        self.core.lifecycle().is_ready()
    }

    async fn wait_for_ready(&self) -> bool {
        self.core.lifecycle().wait_for_ready().await
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.core.events().subscribe()
    }

    async fn shutdown(&self) {
        self.core.lifecycle().shutdown().await;
        if let Err(err) = self.shared.flush_presence().await {
            warn!(error = %err, "final online snapshot flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use confdb_core::ManualClock;
    use tempfile::TempDir;

    use super::*;
    use crate::config::PollingConfig;

    fn nwid() -> NetworkId {
        NetworkId::new(0x1234_5678_90ab_cdef).unwrap()
    }

    fn mid() -> MemberId {
        MemberId::new(0x01_0203_0405).unwrap()
    }

    fn config(dir: &TempDir) -> FilesystemConfig {
        FilesystemConfig {
            path: dir.path().to_path_buf(),
            online_flush: PollingConfig::every(3_600_000),
            online_history_limit: 2,
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FilesystemStore::open(config(&dir)).await.unwrap();
            assert!(store.is_ready());
            assert!(store.save(NetworkRecord::new(nwid()).into(), true).await);
            let mut m = MemberRecord::new(nwid(), mid());
            m.authorized = true;
            m.ip_assignments = vec!["10.1.0.5".into()];
            assert!(store.save(m.into(), true).await);
            store.shutdown().await;
        }
        assert!(dir.path().join("1234567890abcdef.json").is_file());
        assert!(dir.path().join("1234567890abcdef/0102030405.json").is_file());

        let store = FilesystemStore::open(config(&dir)).await.unwrap();
        assert_eq!(store.networks(), vec![nwid()]);
        let s = store.summary(nwid()).unwrap();
        assert_eq!(s.authorized_member_count, 1);
        assert_eq!(s.allocated_ips.len(), 1);
        assert_eq!(store.network(nwid()).unwrap().revision, 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("1234567890abcdef.json"), b"{ not json").unwrap();
        std::fs::write(
            dir.path().join("00000000000000aa.json"),
            br#"{"id": "00000000000000aa", "name": "ok"}"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("00000000000000aa")).unwrap();
        std::fs::write(dir.path().join("00000000000000aa/0000000001.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("README.txt"), b"ignored").unwrap();

        let store = FilesystemStore::open(config(&dir)).await.unwrap();
        let ok = NetworkId::new(0xaa).unwrap();
        assert_eq!(store.networks(), vec![ok]);
        assert_eq!(store.network(ok).unwrap().name, "ok");
        assert_eq!(store.network(ok).unwrap().multicast_limit, 32);
        assert!(store.members(ok).is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn unchanged_save_does_not_touch_disk_or_revision() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(config(&dir)).await.unwrap();
        let mut rx = store.subscribe();
        assert!(store.save(NetworkRecord::new(nwid()).into(), true).await);
        let current = store.network(nwid()).unwrap();
        assert!(!store.save(current.into(), true).await);
        assert_eq!(store.network(nwid()).unwrap().revision, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn erase_network_removes_files_and_cache() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(config(&dir)).await.unwrap();
        store.save(NetworkRecord::new(nwid()).into(), true).await;
        store.save(MemberRecord::new(nwid(), mid()).into(), true).await;
        store.erase_network(nwid(), true).await;
        assert!(store.network(nwid()).is_none());
        assert!(store.networks().is_empty());
        assert!(!dir.path().join("1234567890abcdef.json").exists());
        assert!(!dir.path().join("1234567890abcdef").exists());

        store.save(NetworkRecord::new(nwid()).into(), true).await;
        store.save(MemberRecord::new(nwid(), mid()).into(), true).await;
        store.erase_member(nwid(), mid(), true).await;
        assert!(store.member(nwid(), mid()).is_none());
        assert!(!dir.path().join("1234567890abcdef/0102030405.json").exists());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn presence_coalesces_and_keeps_recent_distinct_addresses() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let store = FilesystemStore::open_with_clock(config(&dir), clock.clone())
            .await
            .unwrap();
        assert!(store.save(NetworkRecord::new(nwid()).into(), false).await);
        for (t, addr) in [(100, "10.0.0.1:9993"), (200, "10.0.0.2:9993"), (300, "10.0.0.3:9993")] {
            clock.set(t);
            store.node_is_online(nwid(), mid(), Some(addr.parse().unwrap()));
        }
        assert_eq!(store.flush_presence().await.unwrap(), 1);
        let snapshot = read_online(&dir.path().join("1234567890abcdef-online.json")).unwrap();
        assert_eq!(
            snapshot["0102030405"],
            vec![(300, "10.0.0.3:9993".to_string())]
        );

        for (t, addr) in [(400, "10.0.0.4:9993"), (500, "10.0.0.5:9993")] {
            clock.set(t);
            store.node_is_online(nwid(), mid(), Some(addr.parse().unwrap()));
            store.flush_presence().await.unwrap();
        }
        clock.set(600);
        store.node_is_online(nwid(), mid(), Some("10.0.0.4:9993".parse().unwrap()));
        store.flush_presence().await.unwrap();
        let snapshot = read_online(&dir.path().join("1234567890abcdef-online.json")).unwrap();
        assert_eq!(
            snapshot["0102030405"],
            vec![
                (600, "10.0.0.4:9993".to_string()),
                (500, "10.0.0.5:9993".to_string())
            ]
        );
        assert_eq!(store.flush_presence().await.unwrap(), 0);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn reads_are_served_while_a_flush_waits_on_the_disk() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemStore::open(config(&dir)).await.unwrap());
        store.save(NetworkRecord::new(nwid()).into(), true).await;
        store.node_is_online(nwid(), mid(), None);

        let held = store.shared.lock_network(nwid()).await;
        let flusher = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.flush_presence().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!flusher.is_finished());
        assert!(store.network(nwid()).is_some());

        drop(held);
        assert_eq!(flusher.await.unwrap().unwrap(), 1);
        store.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_of_one_record_stay_consistent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemStore::open(config(&dir)).await.unwrap());
        for round in 0..20 {
            let saves: Vec<_> = (0..8)
                .map(|i| {
                    let store = Arc::clone(&store);
                    let mut network = NetworkRecord::new(nwid());
                    network.name = format!("round-{round}-writer-{i}");
                    tokio::spawn(async move { store.save(network.into(), true).await })
                })
                .collect();
            for save in saves {
                assert!(save.await.unwrap());
            }
            let bytes = std::fs::read(dir.path().join("1234567890abcdef.json")).unwrap();
            let on_disk = NetworkRecord::from_slice(&bytes).unwrap();
            assert_eq!(Some(on_disk), store.network(nwid()));
        }
        assert_eq!(store.network(nwid()).unwrap().revision, 160);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| !e.file_name().to_string_lossy().ends_with(".json"))
            .collect();
        assert!(leftovers.is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn erase_discards_pending_presence() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(config(&dir)).await.unwrap();
        store.save(NetworkRecord::new(nwid()).into(), true).await;
        store.save(MemberRecord::new(nwid(), mid()).into(), true).await;
        store.node_is_online(nwid(), mid(), Some("10.0.0.1:9993".parse().unwrap()));
        store.erase_network(nwid(), true).await;
        assert_eq!(store.flush_presence().await.unwrap(), 0);
        assert!(!dir.path().join("1234567890abcdef-online.json").exists());

        store.node_is_online(nwid(), mid(), None);
        assert_eq!(store.flush_presence().await.unwrap(), 0);
        assert!(!dir.path().join("1234567890abcdef-online.json").exists());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn unusable_base_path_is_fatal() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        let cfg = FilesystemConfig {
            path: file,
            ..FilesystemConfig::default()
        };
        assert!(FilesystemStore::open(cfg).await.is_err());
    }
}
