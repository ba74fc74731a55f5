//! Change events and the per-store event bus.
//!
//! Backends never call listeners directly. Every change detected by a
//! backend (local save, bootstrap aside, or a live update from its backing
//! store) is published as a [`StoreEvent`] on the backend's [`EventBus`];
//! subscribers drain their own channel on their own task.

use std::sync::atomic::{AtomicU64, Ordering};

use confdb_core::{MemberId, MemberRecord, NetworkId, NetworkRecord};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Instance identity of a store. Two stores never share an id, even when
/// they are configured identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

impl StoreId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

/// A change that has been applied to a store's cache.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Network created or updated (`Some`), or erased (`None`).
    NetworkChanged {
        network_id: NetworkId,
        network: Option<NetworkRecord>,
    },
    /// Member created or updated (`Some`), or erased (`None`).
    MemberChanged {
        network_id: NetworkId,
        member_id: MemberId,
        member: Option<MemberRecord>,
    },
    /// Member lost authorization, either by update or by erase.
    MemberDeauthorized {
        network_id: NetworkId,
        member_id: MemberId,
    },
}

impl StoreEvent {
    #[must_use]
    pub fn network_id(&self) -> NetworkId {
        match self {
            Self::NetworkChanged { network_id, .. }
            | Self::MemberChanged { network_id, .. }
            | Self::MemberDeauthorized { network_id, .. } => *network_id,
        }
    }
}

/// Fan-out of events to every live subscriber channel.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber. Dropping the receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Sends `event` to every subscriber, pruning closed channels.
    pub fn publish(&self, event: &StoreEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        metrics::counter!("confdb_change_notifications_total").increment(1);
    }
}
