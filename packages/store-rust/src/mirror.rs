//! Combinator presenting several stores as one.
//!
//! Every change a constituent reports is replayed into the others with
//! `notify_listeners == false` and then published once on the mirror's own
//! bus. Silent replay is the echo suppression: the receiving constituents
//! apply the change without emitting an event, so it never travels back to
//! its source and outer subscribers see it exactly once.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use confdb_core::{MemberId, MemberRecord, NetworkId, NetworkRecord, NetworkSummary, Record};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::MirrorConfig;
use crate::error::StoreError;
use crate::events::{EventBus, StoreEvent, StoreId};
use crate::lifecycle::{Lifecycle, StopSignal};
use crate::store::ConfigStore;

struct Inner {
    id: StoreId,
    stores: Vec<Arc<dyn ConfigStore>>,
    events: EventBus,
    lifecycle: Lifecycle,
}

/// Mirrors writes and change events across a set of stores.
pub struct MirrorSet {
    inner: Arc<Inner>,
}

impl MirrorSet {
    /// Wires up forwarding between `stores`. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] when `stores` is empty.
    pub fn new(stores: Vec<Arc<dyn ConfigStore>>, config: &MirrorConfig) -> Result<Self, StoreError> {
        if stores.is_empty() {
            return Err(StoreError::InvalidConfig("mirror needs at least one store".into()));
        }
        let inner = Arc::new(Inner {
            id: StoreId::next(),
            stores,
            events: EventBus::new(),
            lifecycle: Lifecycle::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        for (source, store) in inner.stores.iter().enumerate() {
            inner.lifecycle.spawn(forward(
                source,
                store.subscribe(),
                tx.clone(),
                inner.lifecycle.stop_signal(),
            ));
        }
        drop(tx);
        inner
            .lifecycle
            .spawn(dispatch(Arc::clone(&inner), rx, inner.lifecycle.stop_signal()));
        if let Some(sync) = config.sync {
            let sweeper = Arc::clone(&inner);
            let mut stop = inner.lifecycle.stop_signal();
            inner.lifecycle.spawn(async move {
                while stop.sleep(sync.next_delay()).await {
                    if sweeper.stores.iter().all(|s| s.is_ready()) {
                        let repaired = sweeper.reconcile().await;
                        if repaired > 0 {
                            info!(repaired, "mirror sweep repaired divergent records");
                        }
                    }
                }
                debug!("mirror sweep stopped");
            });
        }
        inner.lifecycle.set_ready();
        info!(
            mirror = %inner.id,
            stores = ?inner.stores.iter().map(|s| s.kind()).collect::<Vec<_>>(),
            "mirror set started"
        );
        Ok(Self { inner })
    }

    #[must_use]
    pub fn stores(&self) -> &[Arc<dyn ConfigStore>] {
        &self.inner.stores
    }

    /// Pushes the newest revision of every record to the constituents that
    /// lack it or hold an older one. Returns the number of repairs.
    ///
    /// Absence is not propagated: a record erased in one constituent but
    /// still present in another is copied back. A constituent holding the
    /// same content under a lower revision is left alone, so revision
    /// numbers may differ between constituents for identical records.
    pub async fn reconcile(&self) -> usize {
        self.inner.reconcile().await
    }
}

impl Drop for MirrorSet {
    fn drop(&mut self) {
        self.inner.lifecycle.request_stop();
    }
}

async fn forward(
    source: usize,
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    merged: mpsc::UnboundedSender<(usize, StoreEvent)>,
    mut stop: StopSignal,
) {
    loop {
        let event = tokio::select! {
            () = stop.stopped() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        if merged.send((source, event)).is_err() {
            break;
        }
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    mut merged: mpsc::UnboundedReceiver<(usize, StoreEvent)>,
    mut stop: StopSignal,
) {
    loop {
        let next = tokio::select! {
            () = stop.stopped() => break,
            next = merged.recv() => next,
        };
        let Some((source, event)) = next else { break };
        inner.propagate(source, &event).await;
        inner.events.publish(&event);
    }
    debug!(mirror = %inner.id, "mirror dispatcher stopped");
}

impl Inner {
    fn others(&self, source: usize) -> impl Iterator<Item = &Arc<dyn ConfigStore>> {
        self.stores
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != source)
            .map(|(_, s)| s)
    }

    /// Replays `event` into every constituent except its source.
    async fn propagate(&self, source: usize, event: &StoreEvent) {
        for store in self.others(source) {
            match event {
                StoreEvent::NetworkChanged {
                    network: Some(network),
                    ..
                } => {
                    store.save(Record::Network(network.clone()), false).await;
                }
                StoreEvent::NetworkChanged {
                    network_id,
                    network: None,
                } => store.erase_network(*network_id, false).await,
                StoreEvent::MemberChanged {
                    member: Some(member),
                    ..
                } => {
                    store.save(Record::Member(member.clone()), false).await;
                }
                StoreEvent::MemberChanged {
                    network_id,
                    member_id,
                    member: None,
                } => store.erase_member(*network_id, *member_id, false).await,
                StoreEvent::MemberDeauthorized { .. } => {}
            }
        }
    }

    fn newest_network(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        self.stores
            .iter()
            .filter_map(|s| s.network(network_id))
            .max_by_key(|n| n.revision)
    }

    async fn reconcile(&self) -> usize {
        let mut repaired = 0;
        let network_ids: BTreeSet<NetworkId> =
            self.stores.iter().flat_map(|s| s.networks()).collect();
        for network_id in network_ids {
            if let Some(newest) = self.newest_network(network_id) {
                for store in &self.stores {
                    let stale = store
                        .network(network_id)
                        .map_or(true, |n| {
                            n.revision < newest.revision && !n.same_content(&newest)
                        });
                    if stale && store.save(Record::Network(newest.clone()), false).await {
                        repaired += 1;
                    }
                }
            }

            let mut newest_members: BTreeMap<MemberId, MemberRecord> = BTreeMap::new();
            for store in &self.stores {
                for member in store.members(network_id) {
                    let keep = newest_members
                        .get(&member.id)
                        .map_or(true, |m| m.revision < member.revision);
                    if keep {
                        newest_members.insert(member.id, member);
                    }
                }
            }
            for member in newest_members.into_values() {
                for store in &self.stores {
                    let stale = store
                        .member(network_id, member.id)
                        .map_or(true, |m| {
                            m.revision < member.revision && !m.same_content(&member)
                        });
                    if stale && store.save(Record::Member(member.clone()), false).await {
                        repaired += 1;
                    }
                }
            }
        }
        repaired
    }
}

#[async_trait]
impl ConfigStore for MirrorSet {
    fn id(&self) -> StoreId {
        self.inner.id
    }

    fn kind(&self) -> &'static str {
        "mirror"
    }

    fn network(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        self.inner.stores.iter().find_map(|s| s.network(network_id))
    }

    fn member(&self, network_id: NetworkId, member_id: MemberId) -> Option<MemberRecord> {
        self.inner
            .stores
            .iter()
            .find_map(|s| s.member(network_id, member_id))
    }

    fn members(&self, network_id: NetworkId) -> Vec<MemberRecord> {
        self.inner
            .stores
            .iter()
            .find(|s| s.network(network_id).is_some())
            .unwrap_or(&self.inner.stores[0])
            .members(network_id)
    }

    fn summary(&self, network_id: NetworkId) -> Option<NetworkSummary> {
        self.inner.stores.iter().find_map(|s| s.summary(network_id))
    }

    fn networks(&self) -> Vec<NetworkId> {
        let all: BTreeSet<NetworkId> = self.inner.stores.iter().flat_map(|s| s.networks()).collect();
        all.into_iter().collect()
    }

    /// With `notify_listeners`, saves to the first constituent that accepts
    /// the write; its change event then propagates to the rest. Without it,
    /// saves silently to every constituent.
    async fn save(&self, record: Record, notify_listeners: bool) -> bool {
        if notify_listeners {
            for store in &self.inner.stores {
                if store.save(record.clone(), true).await {
                    return true;
                }
            }
            return false;
        }
        let mut changed = false;
        for store in &self.inner.stores {
            changed |= store.save(record.clone(), false).await;
        }
        changed
    }

    async fn erase_network(&self, network_id: NetworkId, notify_listeners: bool) {
        let existed = self.network(network_id).is_some();
        for store in &self.inner.stores {
            store.erase_network(network_id, false).await;
        }
        if existed && notify_listeners {
            self.inner.events.publish(&StoreEvent::NetworkChanged {
                network_id,
                network: None,
            });
        }
    }

    async fn erase_member(&self, network_id: NetworkId, member_id: MemberId, notify_listeners: bool) {
        let previous = self.member(network_id, member_id);
        for store in &self.inner.stores {
            store.erase_member(network_id, member_id, false).await;
        }
        let Some(previous) = previous else { return };
        if notify_listeners {
            self.inner.events.publish(&StoreEvent::MemberChanged {
                network_id,
                member_id,
                member: None,
            });
            if previous.authorized {
                self.inner.events.publish(&StoreEvent::MemberDeauthorized {
                    network_id,
                    member_id,
                });
            }
        }
    }

    fn node_is_online(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        address: Option<SocketAddr>,
    ) {
        for store in &self.inner.stores {
            store.node_is_online(network_id, member_id, address);
        }
    }

    /// Ready only when every constituent is.
    fn is_ready(&self) -> bool {
        self.inner.stores.iter().all(|s| s.is_ready())
    }

    /// Resolves as soon as any constituent is ready, so one slow backend
    /// does not hold up startup.
    async fn wait_for_ready(&self) -> bool {
        let mut waits: FuturesUnordered<_> =
            self.inner.stores.iter().map(|s| s.wait_for_ready()).collect();
        while let Some(ready) = waits.next().await {
            if ready {
                return true;
            }
        }
        false
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    async fn shutdown(&self) {
        self.inner.lifecycle.shutdown().await;
        for store in &self.inner.stores {
            store.shutdown().await;
        }
    }
}
