//! Coalescing buffer for presence updates.
//!
//! `node_is_online` is called at device heartbeat rate, so backends only
//! record the call here and persist the buffer on their own timer. Within
//! one flush window the most recent call per member wins.

use std::collections::HashMap;
use std::net::SocketAddr;

use confdb_core::{MemberId, NetworkId};
use parking_lot::Mutex;

/// One coalesced presence observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub network_id: NetworkId,
    pub member_id: MemberId,
    /// Milliseconds since Unix epoch.
    pub timestamp: u64,
    pub address: Option<SocketAddr>,
}

impl PresenceUpdate {
    /// Address rendered for storage; empty when unknown.
    #[must_use]
    pub fn address_string(&self) -> String {
        self.address.map(|a| a.to_string()).unwrap_or_default()
    }
}

/// Pending presence updates since the last flush.
#[derive(Debug, Default)]
pub struct PresenceBuffer {
    pending: Mutex<HashMap<(NetworkId, MemberId), (u64, Option<SocketAddr>)>>,
}

impl PresenceBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation, replacing any earlier one for the same member.
    pub fn record(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        timestamp: u64,
        address: Option<SocketAddr>,
    ) {
        self.pending
            .lock()
            .insert((network_id, member_id), (timestamp, address));
    }

    /// Takes every pending update, leaving the buffer empty. Ordered by
    /// network then member.
    #[must_use]
    pub fn drain(&self) -> Vec<PresenceUpdate> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut updates: Vec<PresenceUpdate> = pending
            .into_iter()
            .map(|((network_id, member_id), (timestamp, address))| PresenceUpdate {
                network_id,
                member_id,
                timestamp,
                address,
            })
            .collect();
        updates.sort_unstable_by_key(|u| (u.network_id, u.member_id));
        updates
    }

    /// Puts updates back after a failed flush, without clobbering newer
    /// observations recorded meanwhile.
    pub fn restore(&self, updates: Vec<PresenceUpdate>) {
        let mut pending = self.pending.lock();
        for u in updates {
            pending
                .entry((u.network_id, u.member_id))
                .or_insert((u.timestamp, u.address));
        }
    }

    /// Drops every pending update for a network.
    pub fn forget_network(&self, network_id: NetworkId) {
        self.pending.lock().retain(|(nid, _), _| *nid != network_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (NetworkId, MemberId) {
        (NetworkId::new(9).unwrap(), MemberId::new(3).unwrap())
    }

    #[test]
    fn rapid_calls_coalesce_to_latest() {
        let buf = PresenceBuffer::new();
        let (n, m) = ids();
        buf.record(n, m, 1, Some("10.0.0.1:9993".parse().unwrap()));
        buf.record(n, m, 2, Some("10.0.0.2:9993".parse().unwrap()));
        buf.record(n, m, 3, Some("10.0.0.3:9993".parse().unwrap()));
        let drained = buf.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].timestamp, 3);
        assert_eq!(drained[0].address_string(), "10.0.0.3:9993");
        assert!(buf.is_empty());
    }

    #[test]
    fn forget_network_leaves_other_networks() {
        let buf = PresenceBuffer::new();
        let (n, m) = ids();
        let other = NetworkId::new(10).unwrap();
        buf.record(n, m, 1, None);
        buf.record(other, m, 2, None);
        buf.forget_network(n);
        let drained = buf.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].network_id, other);
    }

    #[test]
    fn restore_keeps_newer_observations() {
        let buf = PresenceBuffer::new();
        let (n, m) = ids();
        buf.record(n, m, 1, None);
        let drained = buf.drain();
        buf.record(n, m, 5, None);
        buf.restore(drained);
        let again = buf.drain();
        assert_eq!(again[0].timestamp, 5);
        assert_eq!(again[0].address_string(), "");
    }
}
