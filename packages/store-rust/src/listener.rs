//! Change listener trait, composite fan-out, and the event dispatcher.
//!
//! [`ChangeListener`] is the callback surface consumers implement.
//! [`spawn_dispatcher`] drains a store's event channel on a single task and
//! invokes the listener, so callbacks never run on a backend's own task.

use std::sync::Arc;

use confdb_core::{MemberId, MemberRecord, NetworkId, NetworkRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::StoreEvent;

/// Receives change notifications from a store.
///
/// Used as `Arc<dyn ChangeListener>`.
pub trait ChangeListener: Send + Sync {
    /// Network created or updated, or erased when `network` is `None`.
    fn on_network_update(&self, network_id: NetworkId, network: Option<&NetworkRecord>);

    /// Member created or updated, or erased when `member` is `None`.
    fn on_member_update(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        member: Option<&MemberRecord>,
    );

    /// Member lost authorization.
    fn on_member_deauthorize(&self, _network_id: NetworkId, _member_id: MemberId) {}
}

/// Routes one event to the matching listener callback.
pub fn deliver(listener: &dyn ChangeListener, event: &StoreEvent) {
    match event {
        StoreEvent::NetworkChanged {
            network_id,
            network,
        } => listener.on_network_update(*network_id, network.as_ref()),
        StoreEvent::MemberChanged {
            network_id,
            member_id,
            member,
        } => listener.on_member_update(*network_id, *member_id, member.as_ref()),
        StoreEvent::MemberDeauthorized {
            network_id,
            member_id,
        } => listener.on_member_deauthorize(*network_id, *member_id),
    }
}

/// Drains `events` and invokes `listener` for each, in order, until the
/// channel closes.
pub fn spawn_dispatcher(
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    listener: Arc<dyn ChangeListener>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            deliver(listener.as_ref(), &event);
        }
        tracing::debug!("change dispatcher finished");
    })
}

/// Composite listener that fans out to multiple listeners.
#[derive(Default)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl CompositeListener {
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn ChangeListener>>) -> Self {
        Self { listeners }
    }

    pub fn add(&mut self, listener: Arc<dyn ChangeListener>) {
        self.listeners.push(listener);
    }
}

impl ChangeListener for CompositeListener {
    fn on_network_update(&self, network_id: NetworkId, network: Option<&NetworkRecord>) {
        for listener in &self.listeners {
            listener.on_network_update(network_id, network);
        }
    }

    fn on_member_update(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        member: Option<&MemberRecord>,
    ) {
        for listener in &self.listeners {
            listener.on_member_update(network_id, member_id, member);
        }
    }

    fn on_member_deauthorize(&self, network_id: NetworkId, member_id: MemberId) {
        for listener in &self.listeners {
            listener.on_member_deauthorize(network_id, member_id);
        }
    }
}
