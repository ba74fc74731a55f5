//! Append-only ledger backend.
//!
//! Records are written as ledger entries tagged with searchable selectors
//! (network id, and member id for members) and read back by a poller that
//! asks "what changed in `[last start - safety margin, now]`". Local saves
//! apply to the cache at once and are queued as dirty until the ledger
//! accepts them; the queue is retried on every poll cycle. Erasure writes a
//! tombstone entry so other controllers drop the record too.

pub mod client;
mod memory;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use confdb_core::{
    ClockSource, MemberId, MemberRecord, NetworkId, NetworkRecord, NetworkSummary, Record,
    RecordKey, SystemClock,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use client::{HttpLedgerClient, LedgerClient};
pub use memory::MemoryLedger;

use self::client::{LedgerQuery, MakeRecord, Selector, SelectorRange};
use crate::config::LedgerConfig;
use crate::error::StoreError;
use crate::events::{StoreEvent, StoreId};
use crate::lifecycle::{Probe, StopSignal};
use crate::presence::{PresenceBuffer, PresenceUpdate};
use crate::store::{ConfigStore, StoreCore};

/// Stored entry value.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    objtype: String,
    #[serde(default)]
    deleted: bool,
    record: Value,
}

fn encode(record: &Record, deleted: bool) -> Result<String, serde_json::Error> {
    let objtype = match record {
        Record::Network(_) => "network",
        Record::Member(_) => "member",
    };
    serde_json::to_string(&Envelope {
        objtype: objtype.to_string(),
        deleted,
        record: record.to_value()?,
    })
}

/// Decodes an entry value. Presence entries and unknown kinds decode to
/// `None`.
fn decode(value: &str) -> Result<Option<(Record, bool)>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(value)?;
    let record = match envelope.objtype.as_str() {
        "network" => Record::Network(NetworkRecord::from_value(envelope.record)?),
        "member" => Record::Member(MemberRecord::from_value(envelope.record)?),
        _ => return Ok(None),
    };
    Ok(Some((record, envelope.deleted)))
}

/// A local write the ledger has not accepted yet.
#[derive(Debug, Clone)]
struct DirtyWrite {
    record: Record,
    deleted: bool,
}

impl DirtyWrite {
    fn same_as(&self, other: &Self) -> bool {
        self.deleted == other.deleted && self.record.revision() == other.record.revision()
    }
}

struct Inner {
    core: StoreCore,
    client: Arc<dyn LedgerClient>,
    config: LedgerConfig,
    dirty: Mutex<BTreeMap<RecordKey, DirtyWrite>>,
    presence: PresenceBuffer,
}

/// Ledger backend.
pub struct LedgerStore {
    inner: Arc<Inner>,
}

impl LedgerStore {
    /// Connects to the ledger node named in `config` and starts polling.
    ///
    /// # Errors
    ///
    /// Fails when the url, owner or controller id is missing, or the HTTP
    /// client cannot be built.
    pub fn open(config: LedgerConfig) -> Result<Self, StoreError> {
        if config.url.is_empty() || config.owner_key.is_empty() || config.controller_id.is_empty()
        {
            return Err(StoreError::InvalidConfig(
                "ledger backend needs a url, an owner and a controller id".into(),
            ));
        }
        let client = HttpLedgerClient::new(
            config.url.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self::open_with_client(config, Arc::new(client), Arc::new(SystemClock)))
    }

    /// Starts a store over an explicit client. Becomes ready after the first
    /// complete poll round.
    #[must_use]
    pub fn open_with_client(
        config: LedgerConfig,
        client: Arc<dyn LedgerClient>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let inner = Arc::new(Inner {
            core: StoreCore::new("ledger", clock),
            client,
            config,
            dirty: Mutex::new(BTreeMap::new()),
            presence: PresenceBuffer::new(),
        });
        let lifecycle = inner.core.lifecycle();
        lifecycle.spawn(poll_loop(Arc::clone(&inner), lifecycle.stop_signal()));
        Self { inner }
    }

    /// Local writes not yet accepted by the ledger.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.inner.dirty.lock().len()
    }

    fn tombstone(&self, record: Record) {
        let mut record = record;
        record.set_revision(record.revision() + 1);
        self.inner.dirty.lock().insert(
            record.key(),
            DirtyWrite {
                record,
                deleted: true,
            },
        );
    }
}

impl Drop for LedgerStore {
    fn drop(&mut self) {
        self.inner.core.lifecycle().request_stop();
    }
}

impl Inner {
    fn network_selector(&self, network_id: NetworkId) -> Selector {
        Selector {
            name: format!("{}:network", self.config.controller_id),
            ordinal: network_id.as_u64(),
        }
    }

    fn member_selector(&self, member_id: MemberId) -> Selector {
        Selector {
            name: format!("{}:member", self.config.controller_id),
            ordinal: member_id.as_u64(),
        }
    }

    fn selectors(&self, key: RecordKey) -> Vec<Selector> {
        match key {
            RecordKey::Network(network_id) => vec![self.network_selector(network_id)],
            RecordKey::Member(network_id, member_id) => vec![
                self.network_selector(network_id),
                self.member_selector(member_id),
            ],
        }
    }

    fn presence_selectors(&self, update: &PresenceUpdate) -> Vec<Selector> {
        vec![
            Selector {
                name: format!("{}:online", self.config.controller_id),
                ordinal: update.network_id.as_u64(),
            },
            self.member_selector(update.member_id),
        ]
    }

    fn request(&self, selectors: Vec<Selector>, value: String, pulse: bool) -> MakeRecord {
        MakeRecord {
            selectors,
            value,
            owner_private: self.config.owner_key.clone(),
            masking_key: self.config.masking_key.clone(),
            timestamp: self.core.now() / 1_000,
            pulse_if_unchanged: pulse,
        }
    }

    /// Submits every dirty write. Stops at the first rejection; whatever is
    /// left is retried next cycle.
    async fn flush_dirty(&self) {
        let batch: Vec<(RecordKey, DirtyWrite)> = self
            .dirty
            .lock()
            .iter()
            .map(|(k, w)| (*k, w.clone()))
            .collect();
        for (key, write) in batch {
            let value = match encode(&write.record, write.deleted) {
                Ok(value) => value,
                Err(err) => {
                    self.core.record_failed_save(key, &err);
                    self.dirty.lock().remove(&key);
                    continue;
                }
            };
            let request = self.request(self.selectors(key), value, false);
            match self.client.make_record(&request).await {
                Ok(()) => {
                    let mut dirty = self.dirty.lock();
                    if dirty.get(&key).is_some_and(|w| w.same_as(&write)) {
                        dirty.remove(&key);
                    }
                    drop(dirty);
                    self.core.lifecycle().report(Probe::Writes, true);
                }
                Err(err) => {
                    let remaining = self.dirty.lock().len();
                    warn!(network_id = %key.network_id(), remaining, error = %err, "ledger write failed, will retry");
                    self.core.lifecycle().report(Probe::Writes, false);
                    return;
                }
            }
        }
    }

    async fn flush_presence(&self) {
        let updates = self.presence.drain();
        let mut unsent = Vec::new();
        for update in updates {
            let value = json!({
                "objtype": "presence",
                "nwid": update.network_id.to_hex(),
                "id": update.member_id.to_hex(),
                "address": update.address_string(),
            })
            .to_string();
            let request = self.request(self.presence_selectors(&update), value, true);
            if !unsent.is_empty() || self.client.make_record(&request).await.is_err() {
                unsent.push(update);
            }
        }
        if unsent.is_empty() {
            metrics::counter!("confdb_presence_flush_total", "backend" => "ledger").increment(1);
        } else {
            debug!(deferred = unsent.len(), "presence not accepted, deferred");
            self.presence.restore(unsent);
        }
    }

    /// One poll round over `[window_start_ms, now]`.
    async fn poll_once(&self, window_start_ms: u64, notify_listeners: bool) -> anyhow::Result<()> {
        self.flush_dirty().await;
        if self.config.store_online_state {
            self.flush_presence().await;
        }

        let time_range = [window_start_ms / 1_000, self.core.now() / 1_000 + 1];
        let networks = format!("{}:network", self.config.controller_id);
        let members = format!("{}:member", self.config.controller_id);
        let mut found = Vec::new();
        for ranges in [
            vec![SelectorRange::all(&networks)],
            vec![SelectorRange::all(&networks), SelectorRange::all(&members)],
        ] {
            let query = LedgerQuery {
                ranges,
                time_range,
                masking_key: self.config.masking_key.clone(),
                owners: vec![self.config.owner_key.clone()],
            };
            for candidates in self.client.query(&query).await? {
                let Some(best) = candidates.first() else { continue };
                match decode(&best.value) {
                    Ok(Some(entry)) => found.push(entry),
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "skipping undecodable ledger entry"),
                }
            }
        }

        found.sort_by_key(|(record, _)| (record.revision(), matches!(record, Record::Member(_))));
        for (record, deleted) in found {
            self.apply_remote(record, deleted, notify_listeners);
        }
        Ok(())
    }

    fn apply_remote(&self, record: Record, deleted: bool, notify_listeners: bool) {
        let key = record.key();
        if self.dirty.lock().contains_key(&key) {
            return;
        }
        if !deleted {
            self.core.ingest(record, notify_listeners);
        } else if self
            .core
            .current(key)
            .is_some_and(|current| current.revision() <= record.revision())
        {
            self.core.ingest_removal(key, notify_listeners);
        }
    }
}

async fn poll_loop(inner: Arc<Inner>, mut stop: StopSignal) {
    let cadence = inner.config.poll;
    let margin = inner.config.safety_margin_ms;
    let mut window_start = 0u64;
    let mut loaded = false;
    loop {
        let started = inner.core.now();
        match inner.poll_once(window_start, loaded).await {
            Ok(()) => {
                window_start = started.saturating_sub(margin);
                inner.core.lifecycle().report(Probe::Poll, true);
                if !loaded {
                    loaded = true;
                    info!(
                        networks = inner.core.index().networks().len(),
                        members = inner.core.index().member_count(),
                        "ledger store loaded"
                    );
                    inner.core.lifecycle().set_ready();
                }
                inner.core.record_gauges();
            }
            Err(err) => {
                warn!(error = %err, "ledger poll failed");
                inner.core.lifecycle().report(Probe::Poll, false);
            }
        }
        if !stop.sleep(cadence.next_delay()).await {
            break;
        }
    }
    debug!("ledger poller stopped");
}

#[async_trait]
impl ConfigStore for LedgerStore {
    fn id(&self) -> StoreId {
        self.inner.core.id()
    }

    fn kind(&self) -> &'static str {
        self.inner.core.kind()
    }

    fn network(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        self.inner.core.index().network(network_id)
    }

    fn member(&self, network_id: NetworkId, member_id: MemberId) -> Option<MemberRecord> {
        self.inner.core.index().member(network_id, member_id)
    }

    fn members(&self, network_id: NetworkId) -> Vec<MemberRecord> {
        self.inner.core.index().members(network_id)
    }

    fn summary(&self, network_id: NetworkId) -> Option<NetworkSummary> {
        self.inner.core.index().summary(network_id)
    }

    fn networks(&self) -> Vec<NetworkId> {
        self.inner.core.index().networks()
    }

    async fn save(&self, record: Record, notify_listeners: bool) -> bool {
        let core = &self.inner.core;
        let key = record.key();
        let Some(write) = core.prepare_write(record) else {
            return false;
        };
        self.inner.dirty.lock().insert(
            key,
            DirtyWrite {
                record: write.new.clone(),
                deleted: false,
            },
        );
        core.commit(write, notify_listeners);
        true
    }

    async fn erase_network(&self, network_id: NetworkId, notify_listeners: bool) {
        let core = &self.inner.core;
        for member in core.index().members(network_id) {
            self.tombstone(Record::Member(member));
        }
        let network = core
            .index()
            .network(network_id)
            .unwrap_or_else(|| NetworkRecord::new(network_id));
        self.tombstone(Record::Network(network));
        core.remove_network(network_id, notify_listeners);
        core.record_gauges();
    }

    async fn erase_member(&self, network_id: NetworkId, member_id: MemberId, notify_listeners: bool) {
        let core = &self.inner.core;
        let member = core
            .index()
            .member(network_id, member_id)
            .unwrap_or_else(|| MemberRecord::new(network_id, member_id));
        self.tombstone(Record::Member(member));
        core.remove_member(network_id, member_id, notify_listeners);
    }

    fn node_is_online(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        address: Option<SocketAddr>,
    ) {
        if self.inner.config.store_online_state {
            self.inner
                .presence
                .record(network_id, member_id, self.inner.core.now(), address);
        }
    }

    fn is_ready(&self) -> bool {
        self.inner.core.lifecycle().is_ready()
    }

    async fn wait_for_ready(&self) -> bool {
        self.inner.core.lifecycle().wait_for_ready().await
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.inner.core.events().subscribe()
    }

    async fn shutdown(&self) {
        self.inner.core.lifecycle().shutdown().await;
        self.inner.flush_dirty().await;
        let unsent = self.inner.dirty.lock().len();
        if unsent > 0 {
            warn!(unsent, "ledger writes still pending at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use confdb_core::ManualClock;

    use super::*;
    use crate::config::PollingConfig;

    fn nwid() -> NetworkId {
        NetworkId::new(0x1234_5678_90ab_cdef).unwrap()
    }

    fn mid() -> MemberId {
        MemberId::new(0x01_0203_0405).unwrap()
    }

    fn config() -> LedgerConfig {
        LedgerConfig {
            url: "http://ledger.invalid".into(),
            owner_key: "owner".into(),
            masking_key: "ctl".into(),
            controller_id: "ctl".into(),
            poll: PollingConfig::every(1_000),
            ..LedgerConfig::default()
        }
    }

    fn open(ledger: &Arc<MemoryLedger>, clock: &Arc<ManualClock>, config: LedgerConfig) -> LedgerStore {
        LedgerStore::open_with_client(config, ledger.clone(), clock.clone())
    }

    async fn cycle() {
        tokio::time::sleep(Duration::from_millis(1_100)).await;
    }

    #[test]
    fn envelopes_carry_kind_and_tombstone_flag() {
        let record = Record::Member(MemberRecord::new(nwid(), mid()));
        let (decoded, deleted) = decode(&encode(&record, true).unwrap()).unwrap().unwrap();
        assert!(deleted);
        assert_eq!(decoded, record);
        assert!(decode(r#"{"objtype": "presence", "record": {}}"#).unwrap().is_none());
        assert!(decode("nope").is_err());
    }

    #[test]
    fn open_requires_owner() {
        let config = LedgerConfig {
            owner_key: String::new(),
            ..config()
        };
        assert!(matches!(LedgerStore::open(config), Err(StoreError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn saves_reach_other_controllers() {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let a = open(&ledger, &clock, config());
        let b = open(&ledger, &clock, config());
        assert!(a.wait_for_ready().await);
        assert!(b.wait_for_ready().await);
        let mut events = b.subscribe();

        assert!(a.save(NetworkRecord::new(nwid()).into(), true).await);
        assert_eq!(a.network(nwid()).unwrap().revision, 1);
        assert_eq!(a.dirty_count(), 1);
        cycle().await;
        cycle().await;

        assert_eq!(a.dirty_count(), 0);
        assert_eq!(b.network(nwid()).unwrap().revision, 1);
        assert!(matches!(
            events.try_recv(),
            Ok(StoreEvent::NetworkChanged { network: Some(_), .. })
        ));
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_bootstraps_from_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let first = open(&ledger, &clock, config());
        assert!(first.wait_for_ready().await);
        first.save(NetworkRecord::new(nwid()).into(), true).await;
        first.save(MemberRecord::new(nwid(), mid()).into(), true).await;
        first.shutdown().await;
        drop(first);

        clock.advance(3_600_000);
        let second = open(&ledger, &clock, config());
        let mut events = second.subscribe();
        assert!(second.wait_for_ready().await);
        assert_eq!(second.summary(nwid()).unwrap().total_member_count, 1);
        assert!(events.try_recv().is_err());
        second.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_writes_survive_outage() {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = open(&ledger, &clock, config());
        assert!(store.wait_for_ready().await);

        ledger.set_offline(true);
        assert!(store.save(NetworkRecord::new(nwid()).into(), true).await);
        assert!(store.network(nwid()).is_some());
        cycle().await;
        assert_eq!(store.dirty_count(), 1);
        assert!(!store.is_ready());

        ledger.set_offline(false);
        cycle().await;
        assert_eq!(store.dirty_count(), 0);
        assert!(store.is_ready());
        assert_eq!(ledger.entry_count(), 1);
        store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tombstones_remove_records_everywhere() {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let a = open(&ledger, &clock, config());
        let b = open(&ledger, &clock, config());
        assert!(a.wait_for_ready().await && b.wait_for_ready().await);
        a.save(NetworkRecord::new(nwid()).into(), true).await;
        a.save(MemberRecord::new(nwid(), mid()).into(), true).await;
        cycle().await;
        cycle().await;
        assert!(b.member(nwid(), mid()).is_some());

        a.erase_network(nwid(), true).await;
        assert!(a.network(nwid()).is_none());
        cycle().await;
        cycle().await;
        assert!(b.network(nwid()).is_none());
        assert!(b.member(nwid(), mid()).is_none());
        assert!(a.network(nwid()).is_none());
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn presence_pulses_when_enabled() {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = LedgerConfig {
            store_online_state: true,
            ..config()
        };
        let store = open(&ledger, &clock, config);
        assert!(store.wait_for_ready().await);
        let addr: SocketAddr = "192.0.2.4:9993".parse().unwrap();

        store.node_is_online(nwid(), mid(), Some(addr));
        cycle().await;
        clock.advance(5_000);
        store.node_is_online(nwid(), mid(), Some(addr));
        cycle().await;

        assert_eq!(ledger.entry_count(), 1);
        assert!(ledger.submissions() >= 2);
        store.shutdown().await;
    }
}
