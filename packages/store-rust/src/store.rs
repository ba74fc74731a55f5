//! The [`ConfigStore`] contract and the [`StoreCore`] every backend embeds.
//!
//! `StoreCore` owns the pieces the contract needs regardless of where
//! records are persisted: the [`CachedIndex`], the [`EventBus`], the
//! [`Lifecycle`], and the clock. Backends hold one and call it explicitly:
//! [`prepare_write`](StoreCore::prepare_write) before persisting,
//! [`commit`](StoreCore::commit) after a successful write, and
//! [`ingest`](StoreCore::ingest) for records arriving from the backing
//! store.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use confdb_core::{
    ClockSource, MemberId, MemberRecord, NetworkId, NetworkRecord, NetworkSummary, Record,
    RecordKey,
};
use tokio::sync::mpsc;

use crate::events::{EventBus, StoreEvent, StoreId};
use crate::index::CachedIndex;
use crate::lifecycle::Lifecycle;

/// Configuration-of-record store.
///
/// Reads are served from memory and never block on backend I/O. Writes go
/// through [`save`](ConfigStore::save), which bumps the revision only when
/// the content actually changed.
///
/// Used as `Arc<dyn ConfigStore>`.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Instance identity, used for echo suppression when mirroring.
    fn id(&self) -> StoreId;

    /// Short backend name for logs and metrics.
    fn kind(&self) -> &'static str;

    fn network(&self, network_id: NetworkId) -> Option<NetworkRecord>;

    fn member(&self, network_id: NetworkId, member_id: MemberId) -> Option<MemberRecord>;

    fn members(&self, network_id: NetworkId) -> Vec<MemberRecord>;

    fn summary(&self, network_id: NetworkId) -> Option<NetworkSummary>;

    /// Ids of every known network, sorted.
    fn networks(&self) -> Vec<NetworkId>;

    /// Persists `record` if it differs from the stored value.
    ///
    /// Returns `true` when the record changed and was accepted. A `false`
    /// return means either "unchanged" or "failed"; failures are logged and
    /// leave the cache untouched. With `notify_listeners == false` the
    /// change is applied silently (used for mirror propagation).
    ///
    /// Most backends apply an accepted write to the cache before returning,
    /// so an immediate read sees it. The changefeed backend only queues the
    /// write: `true` means accepted for commit, and reads reflect the record
    /// once the feed delivers it back.
    async fn save(&self, record: Record, notify_listeners: bool) -> bool;

    /// Removes a network and all of its members.
    async fn erase_network(&self, network_id: NetworkId, notify_listeners: bool);

    async fn erase_member(&self, network_id: NetworkId, member_id: MemberId, notify_listeners: bool);

    /// Best-effort presence signal. Buffered and flushed periodically.
    fn node_is_online(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        address: Option<SocketAddr>,
    );

    fn is_ready(&self) -> bool;

    /// Waits until the store is ready. Returns `false` if it stopped first.
    async fn wait_for_ready(&self) -> bool;

    /// Subscribes to change events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent>;

    /// Stops background work, joins it, and releases backend resources.
    async fn shutdown(&self);
}

/// A save that passed change detection, with its revision assigned.
#[derive(Debug, Clone)]
pub struct PreparedWrite {
    pub old: Option<Record>,
    pub new: Record,
}

/// Shared state and save-contract logic embedded in every backend.
pub struct StoreCore {
    id: StoreId,
    kind: &'static str,
    index: CachedIndex,
    events: EventBus,
    lifecycle: Lifecycle,
    clock: Arc<dyn ClockSource>,
}

impl StoreCore {
    #[must_use]
    pub fn new(kind: &'static str, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            id: StoreId::next(),
            kind,
            index: CachedIndex::new(),
            events: EventBus::new(),
            lifecycle: Lifecycle::new(),
            clock,
        }
    }

    #[must_use]
    pub fn id(&self) -> StoreId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[must_use]
    pub fn index(&self) -> &CachedIndex {
        &self.index
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Current cached value for `key`.
    #[must_use]
    pub fn current(&self, key: RecordKey) -> Option<Record> {
        match key {
            RecordKey::Network(id) => self.index.network(id).map(Record::Network),
            RecordKey::Member(nid, mid) => self.index.member(nid, mid).map(Record::Member),
        }
    }

    // -----------------------------------------------------------------------
    // Save contract
    // -----------------------------------------------------------------------

    /// Compares `record` against the cached value. Returns `None` when the
    /// content is unchanged; otherwise assigns the next revision and the
    /// timestamps and returns the write to persist.
    #[must_use]
    pub fn prepare_write(&self, record: Record) -> Option<PreparedWrite> {
        let old = self.current(record.key());
        self.prepare_against(old, record)
    }

    /// Like [`prepare_write`](Self::prepare_write) but against an explicit
    /// prior value, for backends tracking writes not yet visible in the cache.
    #[must_use]
    pub fn prepare_against(&self, old: Option<Record>, mut record: Record) -> Option<PreparedWrite> {
        let now = self.now();
        if record.creation_time() == 0 {
            let created = old.as_ref().map_or(now, Record::creation_time);
            record.set_creation_time(if created == 0 { now } else { created });
        }
        if let Some(old) = &old {
            if old.same_content(&record) {
                return None;
            }
        }
        let next = old.as_ref().map_or(0, Record::revision) + 1;
        record.set_revision(next.max(record.revision()));
        if let Record::Network(network) = &mut record {
            network.last_modified = now;
        }
        Some(PreparedWrite { old, new: record })
    }

    /// Applies a persisted write to the cache and notifies.
    pub fn commit(&self, write: PreparedWrite, notify_listeners: bool) {
        self.apply(write.old.as_ref(), write.new, notify_listeners);
        metrics::counter!("confdb_save_total", "backend" => self.kind, "outcome" => "applied")
            .increment(1);
    }

    /// Records a failed save attempt.
    pub fn record_failed_save(&self, key: RecordKey, error: &dyn std::fmt::Display) {
        tracing::warn!(
            backend = self.kind,
            network_id = %key.network_id(),
            error = %error,
            "save failed, cache left unchanged"
        );
        metrics::counter!("confdb_save_total", "backend" => self.kind, "outcome" => "failed")
            .increment(1);
    }

    fn apply(&self, old: Option<&Record>, new: Record, notify_listeners: bool) {
        match new {
            Record::Network(network) => {
                let old = match old {
                    Some(Record::Network(n)) => Some(n),
                    _ => None,
                };
                let event = notify_listeners.then(|| StoreEvent::NetworkChanged {
                    network_id: network.id,
                    network: Some(network.clone()),
                });
                self.index.apply_network_change(old, Some(network));
                if let Some(event) = event {
                    self.events.publish(&event);
                }
            }
            Record::Member(member) => {
                let old = match old {
                    Some(Record::Member(m)) => Some(m),
                    _ => None,
                };
                let (network_id, member_id) = (member.network_id, member.id);
                let event = notify_listeners.then(|| StoreEvent::MemberChanged {
                    network_id,
                    member_id,
                    member: Some(member.clone()),
                });
                let change = self.index.apply_member_change(old, Some(member));
                if let Some(event) = event {
                    self.events.publish(&event);
                    if change.deauthorized {
                        self.events.publish(&StoreEvent::MemberDeauthorized {
                            network_id,
                            member_id,
                        });
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Drops a network from the cache. Returns `true` if it was cached.
    pub fn remove_network(&self, network_id: NetworkId, notify_listeners: bool) -> bool {
        let removed = self.index.remove_network(network_id);
        if removed && notify_listeners {
            self.events.publish(&StoreEvent::NetworkChanged {
                network_id,
                network: None,
            });
        }
        removed
    }

    /// Drops a member from the cache. Returns `true` if it was cached.
    pub fn remove_member(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        notify_listeners: bool,
    ) -> bool {
        let Some(old) = self.index.member(network_id, member_id) else {
            return false;
        };
        let change = self.index.apply_member_change(Some(&old), None);
        if notify_listeners {
            self.events.publish(&StoreEvent::MemberChanged {
                network_id,
                member_id,
                member: None,
            });
            if change.deauthorized {
                self.events.publish(&StoreEvent::MemberDeauthorized {
                    network_id,
                    member_id,
                });
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Applies a record delivered by the backing store (bootstrap scan or
    /// live update). Deliveries older than the cached revision, and
    /// same-revision deliveries with identical content, are dropped.
    ///
    /// Returns `true` when the cache changed.
    pub fn ingest(&self, record: Record, notify_listeners: bool) -> bool {
        let current = self.current(record.key());
        if let Some(current) = &current {
            if record.revision() < current.revision()
                || (record.revision() == current.revision() && record.same_content(current))
            {
                return false;
            }
        }
        self.apply(current.as_ref(), record, notify_listeners);
        true
    }

    /// Applies a removal delivered by the backing store.
    pub fn ingest_removal(&self, key: RecordKey, notify_listeners: bool) -> bool {
        match key {
            RecordKey::Network(id) => self.remove_network(id, notify_listeners),
            RecordKey::Member(nid, mid) => self.remove_member(nid, mid, notify_listeners),
        }
    }

    /// Publishes cache size gauges for this backend.
    pub fn record_gauges(&self) {
        #[allow(clippy::cast_precision_loss)]
        {
            metrics::gauge!("confdb_network_count", "backend" => self.kind)
                .set(self.index.networks().len() as f64);
            metrics::gauge!("confdb_member_count", "backend" => self.kind)
                .set(self.index.member_count() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use confdb_core::ManualClock;

    use super::*;

    fn core() -> StoreCore {
        StoreCore::new("test", Arc::new(ManualClock::new(1_000)))
    }

    fn nwid() -> NetworkId {
        NetworkId::new(0x1234_5678_90ab_cdef).unwrap()
    }

    fn mid() -> MemberId {
        MemberId::new(0x01_0203_0405).unwrap()
    }

    #[test]
    fn config_store_is_object_safe() {
        fn _accepts(_s: Arc<dyn ConfigStore>) {}
    }

    #[test]
    fn first_write_gets_revision_one_and_creation_time() {
        let core = core();
        let write = core
            .prepare_write(NetworkRecord::new(nwid()).into())
            .unwrap();
        assert!(write.old.is_none());
        assert_eq!(write.new.revision(), 1);
        assert_eq!(write.new.creation_time(), 1_000);
    }

    #[test]
    fn identical_content_is_not_a_write() {
        let core = core();
        let write = core.prepare_write(NetworkRecord::new(nwid()).into()).unwrap();
        core.commit(write, true);
        let again = core.index().network(nwid()).unwrap();
        assert!(core.prepare_write(again.into()).is_none());

        // Caller-supplied stale revision and zero creation time are
        // normalized before comparison.
        assert!(core.prepare_write(NetworkRecord::new(nwid()).into()).is_none());
    }

    #[test]
    fn changed_content_bumps_revision() {
        let core = core();
        core.commit(core.prepare_write(NetworkRecord::new(nwid()).into()).unwrap(), false);
        let mut n = core.index().network(nwid()).unwrap();
        n.name = "lab".into();
        let write = core.prepare_write(n.into()).unwrap();
        assert_eq!(write.new.revision(), 2);
        assert_eq!(write.new.creation_time(), 1_000);
    }

    #[test]
    fn propagated_revision_is_kept_when_ahead() {
        let core = core();
        let mut n = NetworkRecord::new(nwid());
        n.revision = 7;
        let write = core.prepare_write(n.into()).unwrap();
        assert_eq!(write.new.revision(), 7);
    }

    #[tokio::test]
    async fn commit_notifies_only_when_asked() {
        let core = core();
        let mut rx = core.events().subscribe();
        core.commit(core.prepare_write(NetworkRecord::new(nwid()).into()).unwrap(), false);
        assert!(rx.try_recv().is_err());

        let mut m = MemberRecord::new(nwid(), mid());
        m.authorized = true;
        core.commit(core.prepare_write(m.clone().into()).unwrap(), true);
        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::MemberChanged { .. }));

        let mut revoked = core.index().member(nwid(), mid()).unwrap();
        revoked.authorized = false;
        core.commit(core.prepare_write(revoked.into()).unwrap(), true);
        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::MemberChanged { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            StoreEvent::MemberDeauthorized { .. }
        ));
    }

    #[test]
    fn ingest_drops_stale_and_duplicate_deliveries() {
        let core = core();
        let mut n = NetworkRecord::new(nwid());
        n.revision = 5;
        assert!(core.ingest(n.clone().into(), false));
        assert!(!core.ingest(n.clone().into(), false));

        let mut older = n.clone();
        older.revision = 4;
        older.name = "old".into();
        assert!(!core.ingest(older.into(), false));

        let mut newer = n;
        newer.revision = 6;
        newer.name = "new".into();
        assert!(core.ingest(newer.into(), false));
        assert_eq!(core.index().network(nwid()).unwrap().name, "new");
    }

    #[test]
    fn removal_reports_presence() {
        let core = core();
        assert!(!core.remove_network(nwid(), true));
        core.ingest(NetworkRecord::new(nwid()).into(), false);
        core.ingest(MemberRecord::new(nwid(), mid()).into(), false);
        assert!(core.ingest_removal(RecordKey::Member(nwid(), mid()), false));
        assert!(!core.remove_member(nwid(), mid(), false));
        assert!(core.ingest_removal(RecordKey::Network(nwid()), false));
        assert!(core.index().networks().is_empty());
    }
}
