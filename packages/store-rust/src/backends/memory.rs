//! Non-persistent [`ConfigStore`].
//!
//! [`MemoryStore`] keeps records only in its cache and is ready as soon as
//! it is built. Useful for tests, for ephemeral controllers, and as a mirror
//! constituent that fronts slower backends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use confdb_core::{
    ClockSource, MemberId, MemberRecord, NetworkId, NetworkRecord, NetworkSummary, Record,
    SystemClock,
};
use tokio::sync::mpsc;

use crate::events::{StoreEvent, StoreId};
use crate::store::{ConfigStore, StoreCore};

/// In-memory store. Writes always succeed unless failure injection is on.
pub struct MemoryStore {
    core: StoreCore,
    fail_writes: AtomicBool,
    save_calls: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        let core = StoreCore::new("memory", clock);
        core.lifecycle().set_ready();
        Self {
            core,
            fail_writes: AtomicBool::new(false),
            save_calls: AtomicUsize::new(0),
        }
    }

    /// Makes every subsequent `save` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `save` calls received, including no-ops and failures.
    #[must_use]
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Marks the store degraded or ready again.
    pub fn set_healthy(&self, healthy: bool) {
        if healthy {
            self.core.lifecycle().set_ready();
        } else {
            self.core.lifecycle().set_degraded();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
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
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let key = record.key();
        let Some(write) = self.core.prepare_write(record) else {
            return false;
        };
        if self.fail_writes.load(Ordering::SeqCst) {
            self.core.record_failed_save(key, &"write failure injected");
            return false;
        }
        self.core.commit(write, notify_listeners);
        true
    }

    async fn erase_network(&self, network_id: NetworkId, notify_listeners: bool) {
        self.core.remove_network(network_id, notify_listeners);
    }

    async fn erase_member(&self, network_id: NetworkId, member_id: MemberId, notify_listeners: bool) {
        self.core.remove_member(network_id, member_id, notify_listeners);
    }

    fn node_is_online(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        address: Option<SocketAddr>,
    ) {
        let index = self.core.index();
        if let Some(old) = index.member(network_id, member_id) {
            let mut seen = old.clone();
            seen.last_online_time = self.core.now();
            seen.last_online_address = address.map(|a| a.to_string());
            index.apply_member_change(Some(&old), Some(seen));
        }
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
    }
}

#[cfg(test)]
mod tests {
    use confdb_core::ManualClock;

    use super::*;
    use crate::listener::spawn_dispatcher;
    use crate::listener::tests::CountingListener;

    fn nwid() -> NetworkId {
        NetworkId::new(0x1234_5678_90ab_cdef).unwrap()
    }

    fn mid() -> MemberId {
        MemberId::new(0x01_0203_0405).unwrap()
    }

    #[tokio::test]
    async fn create_network_then_authorize_member() {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::new(10)));
        let listener = Arc::new(CountingListener::default());
        let dispatcher = spawn_dispatcher(store.subscribe(), listener.clone());

        assert!(store.save(NetworkRecord::new(nwid()).into(), true).await);
        let n = store.network(nwid()).unwrap();
        assert_eq!(n.revision, 1);
        assert!(n.private);
        assert_eq!(n.multicast_limit, 32);

        let member = MemberRecord::new(nwid(), mid());
        assert!(store.save(member.clone().into(), true).await);
        let s = store.summary(nwid()).unwrap();
        assert_eq!((s.total_member_count, s.authorized_member_count), (1, 0));

        let mut authorized = store.member(nwid(), mid()).unwrap();
        authorized.authorized = true;
        assert!(store.save(authorized.clone().into(), true).await);
        assert!(!store.save(authorized.into(), true).await);
        assert_eq!(store.summary(nwid()).unwrap().authorized_member_count, 1);
        assert_eq!(store.member(nwid(), mid()).unwrap().revision, 2);

        store.shutdown().await;
        drop(store);
        dispatcher.await.unwrap();
        assert_eq!(listener.networks(), 1);
        assert_eq!(listener.members(), 2);
    }

    #[tokio::test]
    async fn erase_network_removes_everything() {
        let store = MemoryStore::new();
        store.save(NetworkRecord::new(nwid()).into(), true).await;
        store.save(MemberRecord::new(nwid(), mid()).into(), true).await;
        store.erase_network(nwid(), true).await;
        assert!(store.networks().is_empty());
        assert!(store.network(nwid()).is_none());
        assert!(store.summary(nwid()).is_none());
        assert!(store.member(nwid(), mid()).is_none());
    }

    #[tokio::test]
    async fn injected_failure_leaves_cache_untouched() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(!store.save(NetworkRecord::new(nwid()).into(), true).await);
        assert!(store.network(nwid()).is_none());
        assert_eq!(store.save_calls(), 1);
    }

    #[tokio::test]
    async fn presence_touches_only_presence_fields() {
        let clock = Arc::new(ManualClock::new(500));
        let store = MemoryStore::with_clock(clock.clone());
        store.save(MemberRecord::new(nwid(), mid()).into(), false).await;
        clock.set(900);
        store.node_is_online(nwid(), mid(), Some("192.0.2.1:9993".parse().unwrap()));
        let m = store.member(nwid(), mid()).unwrap();
        assert_eq!(m.last_online_time, 900);
        assert_eq!(m.revision, 1);
        assert_eq!(m.last_online_address.as_deref(), Some("192.0.2.1:9993"));
    }

    #[tokio::test]
    async fn readiness_follows_health() {
        let store = MemoryStore::new();
        assert!(store.is_ready());
        assert!(store.wait_for_ready().await);
        store.set_healthy(false);
        assert!(!store.is_ready());
        store.set_healthy(true);
        assert!(store.is_ready());
    }
}
