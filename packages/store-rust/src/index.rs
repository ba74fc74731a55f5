//! In-memory indexed cache of networks and members.
//!
//! [`CachedIndex`] is the single read path for every backend. Bootstrap
//! loads, local saves and live updates all go through
//! [`apply_network_change`](CachedIndex::apply_network_change) and
//! [`apply_member_change`](CachedIndex::apply_member_change), which keep the
//! derived per-network sets (authorized members, active bridges, allocated
//! addresses) in step with the member map incrementally.
//!
//! Two lock levels: the outer map lock is held only long enough to find,
//! insert or remove an entry; each entry has its own lock held for one read
//! or one change application. Neither is ever held across I/O.
//!
//! The index applies changes in delivery order. It does not reorder or
//! deduplicate: callers that can observe out-of-order deliveries filter them
//! before calling in.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use confdb_core::{MemberId, MemberRecord, NetworkId, NetworkRecord, NetworkSummary};
use parking_lot::{Mutex, RwLock};

/// Cached state of one network.
#[derive(Debug, Default)]
struct CachedNetworkEntry {
    config: Option<NetworkRecord>,
    members: HashMap<MemberId, MemberRecord>,
    authorized: HashSet<MemberId>,
    active_bridges: HashSet<MemberId>,
    /// Address -> number of members holding it. Conflicting assignments
    /// must not free an address still held by another member.
    allocated_ips: HashMap<IpAddr, usize>,
    most_recent_deauth_time: u64,
}

impl CachedNetworkEntry {
    fn unindex(&mut self, member: &MemberRecord) {
        self.active_bridges.remove(&member.id);
        if self.authorized.remove(&member.id) || member.authorized {
            self.bump_deauth(member.last_deauthorized_time);
        }
        for ip in parse_ips(&member.ip_assignments) {
            if let Some(count) = self.allocated_ips.get_mut(&ip) {
                *count -= 1;
                if *count == 0 {
                    self.allocated_ips.remove(&ip);
                }
            }
        }
    }

    fn index(&mut self, member: MemberRecord) {
        if member.active_bridge {
            self.active_bridges.insert(member.id);
        }
        if member.authorized {
            self.authorized.insert(member.id);
        } else {
            self.bump_deauth(member.last_deauthorized_time);
        }
        for ip in parse_ips(&member.ip_assignments) {
            *self.allocated_ips.entry(ip).or_insert(0) += 1;
        }
        self.members.insert(member.id, member);
    }

    fn bump_deauth(&mut self, at: u64) {
        if at > self.most_recent_deauth_time {
            self.most_recent_deauth_time = at;
        }
    }

    fn summary(&self) -> NetworkSummary {
        let mut active_bridges: Vec<MemberId> = self.active_bridges.iter().copied().collect();
        active_bridges.sort_unstable();
        let mut allocated_ips: Vec<IpAddr> = self.allocated_ips.keys().copied().collect();
        allocated_ips.sort_unstable();
        NetworkSummary {
            active_bridges,
            allocated_ips,
            authorized_member_count: self.authorized.len(),
            total_member_count: self.members.len(),
            most_recent_deauth_time: self.most_recent_deauth_time,
        }
    }
}

/// Assignments are stored as bare addresses; tolerate a trailing prefix
/// length and skip anything unparseable.
fn parse_ips(assignments: &[String]) -> impl Iterator<Item = IpAddr> + '_ {
    assignments.iter().filter_map(|raw| {
        let addr = raw.split('/').next().unwrap_or(raw);
        addr.trim().parse().ok()
    })
}

/// Outcome of one member change application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberChange {
    /// Something was indexed or unindexed.
    pub applied: bool,
    /// The member was authorized before and is not (or no longer exists) now.
    pub deauthorized: bool,
}

/// Network id -> cached entry, with incremental derived-set maintenance.
#[derive(Debug, Default)]
pub struct CachedIndex {
    networks: RwLock<HashMap<NetworkId, Arc<Mutex<CachedNetworkEntry>>>>,
}

impl CachedIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, network_id: NetworkId) -> Option<Arc<Mutex<CachedNetworkEntry>>> {
        self.networks.read().get(&network_id).cloned()
    }

    fn entry_or_insert(&self, network_id: NetworkId) -> Arc<Mutex<CachedNetworkEntry>> {
        if let Some(entry) = self.entry(network_id) {
            return entry;
        }
        Arc::clone(self.networks.write().entry(network_id).or_default())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn network(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        self.entry(network_id)?.lock().config.clone()
    }

    /// Whether a config record is cached for the network, without cloning it.
    #[must_use]
    pub fn contains_network(&self, network_id: NetworkId) -> bool {
        self.entry(network_id)
            .is_some_and(|entry| entry.lock().config.is_some())
    }

    #[must_use]
    pub fn member(&self, network_id: NetworkId, member_id: MemberId) -> Option<MemberRecord> {
        self.entry(network_id)?.lock().members.get(&member_id).cloned()
    }

    /// All cached members of a network, ordered by member id.
    #[must_use]
    pub fn members(&self, network_id: NetworkId) -> Vec<MemberRecord> {
        let Some(entry) = self.entry(network_id) else {
            return Vec::new();
        };
        let mut members: Vec<MemberRecord> = entry.lock().members.values().cloned().collect();
        members.sort_unstable_by_key(|m| m.id);
        members
    }

    /// Aggregates for a network that has a config record.
    #[must_use]
    pub fn summary(&self, network_id: NetworkId) -> Option<NetworkSummary> {
        let entry = self.entry(network_id)?;
        let guard = entry.lock();
        guard.config.as_ref()?;
        Some(guard.summary())
    }

    /// Ids of every network with a config record, sorted.
    #[must_use]
    pub fn networks(&self) -> Vec<NetworkId> {
        let entries: Vec<(NetworkId, Arc<Mutex<CachedNetworkEntry>>)> = self
            .networks
            .read()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();
        let mut ids: Vec<NetworkId> = entries
            .into_iter()
            .filter(|(_, entry)| entry.lock().config.is_some())
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        let entries: Vec<Arc<Mutex<CachedNetworkEntry>>> =
            self.networks.read().values().cloned().collect();
        entries.iter().map(|e| e.lock().members.len()).sum()
    }

    // -----------------------------------------------------------------------
    // Change application
    // -----------------------------------------------------------------------

    /// Applies a network change. `new == None` deletes the whole entry
    /// (config and members), keyed by `old`'s id.
    ///
    /// Returns `true` when the index changed.
    pub fn apply_network_change(
        &self,
        old: Option<&NetworkRecord>,
        new: Option<NetworkRecord>,
    ) -> bool {
        match new {
            Some(network) => {
                let entry = self.entry_or_insert(network.id);
                entry.lock().config = Some(network);
                true
            }
            None => old.is_some_and(|old| self.remove_network(old.id)),
        }
    }

    /// Drops a network entry with all its members. Returns `true` if an
    /// entry existed.
    pub fn remove_network(&self, network_id: NetworkId) -> bool {
        self.networks.write().remove(&network_id).is_some()
    }

    /// Applies a member change.
    ///
    /// The prior state is taken from the cache when the member is cached
    /// (falling back to `old` otherwise) so derived sets stay exact even when
    /// a delivery's `old` image is stale. Removing a member clears it from
    /// every derived set.
    pub fn apply_member_change(
        &self,
        old: Option<&MemberRecord>,
        new: Option<MemberRecord>,
    ) -> MemberChange {
        let Some((network_id, member_id)) = new.as_ref().or(old).map(|m| (m.network_id, m.id))
        else {
            return MemberChange::default();
        };

        let entry = match new {
            Some(_) => self.entry_or_insert(network_id),
            None => match self.entry(network_id) {
                Some(entry) => entry,
                None => return MemberChange::default(),
            },
        };
        let mut guard = entry.lock();

        let prior = guard.members.remove(&member_id).or_else(|| old.cloned());
        let was_authorized = prior.as_ref().is_some_and(|m| m.authorized)
            || guard.authorized.contains(&member_id);
        let mut applied = false;
        if let Some(prior) = &prior {
            guard.unindex(prior);
            applied = true;
        }
        guard.authorized.remove(&member_id);
        guard.active_bridges.remove(&member_id);

        let now_authorized = new.as_ref().is_some_and(|m| m.authorized);
        if let Some(member) = new {
            guard.index(member);
            applied = true;
        }

        MemberChange {
            applied,
            deauthorized: was_authorized && !now_authorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn nwid() -> NetworkId {
        NetworkId::new(0x1234_5678_90ab_cdef).unwrap()
    }

    fn member(raw: u64) -> MemberRecord {
        MemberRecord::new(nwid(), MemberId::new(raw).unwrap())
    }

    fn with_network() -> CachedIndex {
        let index = CachedIndex::new();
        index.apply_network_change(None, Some(NetworkRecord::new(nwid())));
        index
    }

    #[test]
    fn network_upsert_and_erase() {
        let index = with_network();
        assert_eq!(index.networks(), vec![nwid()]);
        assert!(index.network(nwid()).is_some());

        let old = index.network(nwid()).unwrap();
        index.apply_member_change(None, Some(member(1)));
        assert!(index.apply_network_change(Some(&old), None));
        assert!(index.network(nwid()).is_none());
        assert!(index.member(nwid(), MemberId::new(1).unwrap()).is_none());
        assert!(index.summary(nwid()).is_none());
        assert!(index.networks().is_empty());
        assert!(!index.apply_network_change(Some(&old), None));
    }

    #[test]
    fn authorization_flip_updates_counts() {
        let index = with_network();
        let m = member(0x01_0203_0405);
        index.apply_member_change(None, Some(m.clone()));
        let s = index.summary(nwid()).unwrap();
        assert_eq!((s.total_member_count, s.authorized_member_count), (1, 0));

        let mut authorized = m.clone();
        authorized.authorized = true;
        let change = index.apply_member_change(Some(&m), Some(authorized.clone()));
        assert!(change.applied && !change.deauthorized);
        assert_eq!(index.summary(nwid()).unwrap().authorized_member_count, 1);

        let mut revoked = authorized.clone();
        revoked.authorized = false;
        revoked.last_deauthorized_time = 5_000;
        let change = index.apply_member_change(Some(&authorized), Some(revoked));
        assert!(change.deauthorized);
        let s = index.summary(nwid()).unwrap();
        assert_eq!(s.authorized_member_count, 0);
        assert_eq!(s.most_recent_deauth_time, 5_000);
    }

    #[test]
    fn removal_clears_every_derived_set_even_with_stale_old() {
        let index = with_network();
        let mut m = member(7);
        m.authorized = true;
        m.active_bridge = true;
        m.ip_assignments = vec!["10.0.0.7".into(), "fd00::7".into()];
        index.apply_member_change(None, Some(m.clone()));

        let stale = member(7);
        let change = index.apply_member_change(Some(&stale), None);
        assert!(change.deauthorized);
        let s = index.summary(nwid()).unwrap();
        assert_eq!(s.total_member_count, 0);
        assert_eq!(s.authorized_member_count, 0);
        assert!(s.active_bridges.is_empty());
        assert!(s.allocated_ips.is_empty());
    }

    #[test]
    fn shared_address_survives_one_release() {
        let index = with_network();
        let mut a = member(1);
        a.ip_assignments = vec!["10.0.0.9".into()];
        let mut b = member(2);
        b.ip_assignments = vec!["10.0.0.9/24".into(), "garbage".into()];
        index.apply_member_change(None, Some(a.clone()));
        index.apply_member_change(None, Some(b));
        index.apply_member_change(Some(&a), None);
        let s = index.summary(nwid()).unwrap();
        assert_eq!(s.allocated_ips, vec!["10.0.0.9".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn member_before_network_creates_entry() {
        let index = CachedIndex::new();
        index.apply_member_change(None, Some(member(3)));
        assert!(index.networks().is_empty());
        assert!(index.summary(nwid()).is_none());
        assert_eq!(index.members(nwid()).len(), 1);
        index.apply_network_change(None, Some(NetworkRecord::new(nwid())));
        assert_eq!(index.summary(nwid()).unwrap().total_member_count, 1);
        assert_eq!(index.member_count(), 1);
    }

    #[test]
    fn both_absent_is_noop() {
        let index = with_network();
        assert_eq!(index.apply_member_change(None, None), MemberChange::default());
        assert!(!index.apply_network_change(None, None));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Upsert {
            id: u64,
            authorized: bool,
            bridge: bool,
            ip: u8,
        },
        Remove {
            id: u64,
        },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..6, any::<bool>(), any::<bool>(), 0u8..4).prop_map(
                |(id, authorized, bridge, ip)| Op::Upsert {
                    id,
                    authorized,
                    bridge,
                    ip
                }
            ),
            (0u64..6).prop_map(|id| Op::Remove { id }),
        ]
    }

    proptest! {
        #[test]
        fn derived_sets_match_member_map(ops in proptest::collection::vec(op(), 1..60)) {
            let index = with_network();
            for op in ops {
                match op {
                    Op::Upsert { id, authorized, bridge, ip } => {
                        let old = index.member(nwid(), MemberId::new(id).unwrap());
                        let mut m = member(id);
                        m.authorized = authorized;
                        m.active_bridge = bridge;
                        m.ip_assignments = vec![format!("10.0.0.{ip}")];
                        index.apply_member_change(old.as_ref(), Some(m));
                    }
                    Op::Remove { id } => {
                        // Deliberately pass a stale, default image.
                        let stale = member(id);
                        index.apply_member_change(Some(&stale), None);
                    }
                }
            }
            let members = index.members(nwid());
            let summary = index.summary(nwid()).unwrap();
            prop_assert_eq!(summary.total_member_count, members.len());
            prop_assert_eq!(
                summary.authorized_member_count,
                members.iter().filter(|m| m.authorized).count()
            );
            let mut bridges: Vec<MemberId> =
                members.iter().filter(|m| m.active_bridge).map(|m| m.id).collect();
            bridges.sort_unstable();
            prop_assert_eq!(summary.active_bridges, bridges);
            let mut ips: Vec<IpAddr> = members
                .iter()
                .flat_map(|m| m.ip_assignments.iter().map(|s| s.parse::<IpAddr>().unwrap()))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            ips.sort_unstable();
            prop_assert_eq!(summary.allocated_ips, ips);
        }
    }
}
