//! Row shapes for the relational backend.
//!
//! Rows carry every column as `Option` so decoding never fails on a NULL or
//! an unexpected value: each field falls back to its record default and the
//! fallback is logged at debug level. Only an unusable primary key drops a
//! row.

use std::collections::HashMap;

use confdb_core::{
    Dns, IpAssignmentPool, MemberId, MemberRecord, NetworkId, NetworkRecord, Route, V4AssignMode,
    V6AssignMode,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Map;
use tracing::debug;

use crate::index::CachedIndex;
use crate::presence::PresenceUpdate;

/// Parses a JSON text column, falling back to `default` when absent or
/// malformed.
fn json_or<T: DeserializeOwned>(raw: Option<&str>, column: &str, default: impl FnOnce() -> T) -> T {
    match raw {
        None => default(),
        Some(text) => serde_json::from_str(text).unwrap_or_else(|err| {
            debug!(column, error = %err, "malformed JSON column, using default");
            default()
        }),
    }
}

/// Renders a value for a JSON text column.
pub(crate) fn to_json_text<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Postgres has no unsigned integers; millisecond timestamps and revisions
/// are stored as `BIGINT`.
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

fn to_u32(value: Option<i32>, default: u32) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

/// One `ztc_network` row.
#[derive(Debug, Clone, Default)]
pub struct NetworkRow {
    pub id: Option<String>,
    pub name: Option<String>,
    pub private: Option<bool>,
    pub enable_broadcast: Option<bool>,
    pub mtu: Option<i32>,
    pub multicast_limit: Option<i32>,
    pub rules: Option<String>,
    pub capabilities: Option<String>,
    pub tags: Option<String>,
    pub v4_assign_mode: Option<String>,
    pub v6_assign_mode: Option<String>,
    pub dns_domain: Option<String>,
    pub dns_servers: Option<String>,
    pub revision: Option<i64>,
    pub creation_time: Option<i64>,
    pub last_modified: Option<i64>,
    /// Uninterpreted document fields as a JSON object.
    pub extra: Option<String>,
}

impl NetworkRow {
    /// Builds the record, defaulting every malformed column. Returns `None`
    /// only when the id is unusable.
    #[must_use]
    pub fn into_record(self, pools: Vec<IpAssignmentPool>, routes: Vec<Route>) -> Option<NetworkRecord> {
        let id: NetworkId = self.id.as_deref()?.parse().ok()?;
        let defaults = NetworkRecord::new(id);
        Some(NetworkRecord {
            id,
            name: self.name.unwrap_or_default(),
            private: self.private.unwrap_or(defaults.private),
            enable_broadcast: self.enable_broadcast.unwrap_or(defaults.enable_broadcast),
            multicast_limit: to_u32(self.multicast_limit, defaults.multicast_limit),
            mtu: to_u32(self.mtu, defaults.mtu),
            rules: json_or(self.rules.as_deref(), "rules", confdb_core::record::default_rules),
            ip_assignment_pools: pools,
            routes,
            capabilities: json_or(self.capabilities.as_deref(), "capabilities", Vec::new),
            tags: json_or(self.tags.as_deref(), "tags", Vec::new),
            v4_assign_mode: json_or(
                self.v4_assign_mode.as_deref(),
                "v4_assign_mode",
                V4AssignMode::default,
            ),
            v6_assign_mode: json_or(
                self.v6_assign_mode.as_deref(),
                "v6_assign_mode",
                V6AssignMode::default,
            ),
            dns: Dns {
                domain: self.dns_domain.unwrap_or_default(),
                servers: json_or(self.dns_servers.as_deref(), "dns_servers", Vec::new),
            },
            revision: to_u64(self.revision),
            creation_time: to_u64(self.creation_time),
            last_modified: to_u64(self.last_modified),
            extra: json_or(self.extra.as_deref(), "config", Map::new),
        })
    }

    #[must_use]
    pub fn from_record(record: &NetworkRecord) -> Self {
        Self {
            id: Some(record.id.to_hex()),
            name: Some(record.name.clone()),
            private: Some(record.private),
            enable_broadcast: Some(record.enable_broadcast),
            mtu: i32::try_from(record.mtu).ok(),
            multicast_limit: i32::try_from(record.multicast_limit).ok(),
            rules: Some(to_json_text(&record.rules)),
            capabilities: Some(to_json_text(&record.capabilities)),
            tags: Some(to_json_text(&record.tags)),
            v4_assign_mode: Some(to_json_text(&record.v4_assign_mode)),
            v6_assign_mode: Some(to_json_text(&record.v6_assign_mode)),
            dns_domain: Some(record.dns.domain.clone()),
            dns_servers: Some(to_json_text(&record.dns.servers)),
            revision: Some(to_i64(record.revision)),
            creation_time: Some(to_i64(record.creation_time)),
            last_modified: Some(to_i64(record.last_modified)),
            extra: Some(to_json_text(&record.extra)),
        }
    }
}

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

/// One `ztc_member` row.
#[derive(Debug, Clone, Default)]
pub struct MemberRow {
    pub id: Option<String>,
    pub network_id: Option<String>,
    pub authorized: Option<bool>,
    pub active_bridge: Option<bool>,
    pub no_auto_assign_ips: Option<bool>,
    pub identity: Option<String>,
    pub capabilities: Option<String>,
    pub tags: Option<String>,
    pub revision: Option<i64>,
    pub creation_time: Option<i64>,
    pub last_authorized_time: Option<i64>,
    pub last_deauthorized_time: Option<i64>,
    pub v_major: Option<i32>,
    pub v_minor: Option<i32>,
    pub v_rev: Option<i32>,
    pub v_proto: Option<i32>,
    pub extra: Option<String>,
}

impl MemberRow {
    #[must_use]
    pub fn into_record(self, ip_assignments: Vec<String>) -> Option<MemberRecord> {
        let id: MemberId = self.id.as_deref()?.parse().ok()?;
        let network_id: NetworkId = self.network_id.as_deref()?.parse().ok()?;
        Some(MemberRecord {
            id,
            network_id,
            authorized: self.authorized.unwrap_or(false),
            active_bridge: self.active_bridge.unwrap_or(false),
            ip_assignments,
            no_auto_assign_ips: self.no_auto_assign_ips.unwrap_or(false),
            capabilities: json_or(self.capabilities.as_deref(), "capabilities", Vec::new),
            tags: json_or(self.tags.as_deref(), "tags", Vec::new),
            identity: self.identity.unwrap_or_default(),
            revision: to_u64(self.revision),
            creation_time: to_u64(self.creation_time),
            last_authorized_time: to_u64(self.last_authorized_time),
            last_deauthorized_time: to_u64(self.last_deauthorized_time),
            v_major: self.v_major.unwrap_or(-1),
            v_minor: self.v_minor.unwrap_or(-1),
            v_rev: self.v_rev.unwrap_or(-1),
            v_proto: self.v_proto.unwrap_or(-1),
            last_online_time: 0,
            last_online_address: None,
            extra: json_or(self.extra.as_deref(), "config", Map::new),
        })
    }

    #[must_use]
    pub fn from_record(record: &MemberRecord) -> Self {
        Self {
            id: Some(record.id.to_hex()),
            network_id: Some(record.network_id.to_hex()),
            authorized: Some(record.authorized),
            active_bridge: Some(record.active_bridge),
            no_auto_assign_ips: Some(record.no_auto_assign_ips),
            identity: Some(record.identity.clone()),
            capabilities: Some(to_json_text(&record.capabilities)),
            tags: Some(to_json_text(&record.tags)),
            revision: Some(to_i64(record.revision)),
            creation_time: Some(to_i64(record.creation_time)),
            last_authorized_time: Some(to_i64(record.last_authorized_time)),
            last_deauthorized_time: Some(to_i64(record.last_deauthorized_time)),
            v_major: Some(record.v_major),
            v_minor: Some(record.v_minor),
            v_rev: Some(record.v_rev),
            v_proto: Some(record.v_proto),
            extra: Some(to_json_text(&record.extra)),
        }
    }
}

/// Groups child rows by parent key, dropping rows whose key is unusable.
pub fn group_children<K, V>(rows: impl IntoIterator<Item = (Option<K>, Option<V>)>) -> HashMap<K, Vec<V>>
where
    K: std::hash::Hash + Eq,
{
    let mut grouped: HashMap<K, Vec<V>> = HashMap::new();
    for (key, value) in rows {
        if let (Some(key), Some(value)) = (key, value) {
            grouped.entry(key).or_default().push(value);
        }
    }
    grouped
}

// ---------------------------------------------------------------------------
// Presence and aggregates
// ---------------------------------------------------------------------------

/// One `ztc_member_status` upsert row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRow {
    pub network_id: String,
    pub member_id: String,
    pub address: String,
    pub last_updated: i64,
}

/// Keeps updates for members the cache knows about; presence for unknown
/// members is dropped rather than creating orphan status rows.
#[must_use]
pub fn presence_rows(updates: &[PresenceUpdate], index: &CachedIndex) -> Vec<PresenceRow> {
    updates
        .iter()
        .filter(|u| index.member(u.network_id, u.member_id).is_some())
        .map(|u| PresenceRow {
            network_id: u.network_id.to_hex(),
            member_id: u.member_id.to_hex(),
            address: u.address_string(),
            last_updated: to_i64(u.timestamp),
        })
        .collect()
}

/// One appended `ztc_network_stats` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRow {
    pub network_id: String,
    pub recorded_at: i64,
    pub total_member_count: i64,
    pub authorized_member_count: i64,
    pub online_member_count: i64,
}

/// Per-network counts from the cache plus members seen within the online
/// window.
#[must_use]
pub fn stats_rows(
    index: &CachedIndex,
    last_seen: &HashMap<NetworkId, HashMap<MemberId, u64>>,
    now: u64,
    online_window_ms: u64,
) -> Vec<StatsRow> {
    let cutoff = now.saturating_sub(online_window_ms);
    index
        .networks()
        .into_iter()
        .filter_map(|network_id| {
            let summary = index.summary(network_id)?;
            let online = last_seen
                .get(&network_id)
                .map_or(0, |seen| seen.values().filter(|t| **t >= cutoff).count());
            Some(StatsRow {
                network_id: network_id.to_hex(),
                recorded_at: to_i64(now),
                total_member_count: i64::try_from(summary.total_member_count).unwrap_or(i64::MAX),
                authorized_member_count: i64::try_from(summary.authorized_member_count)
                    .unwrap_or(i64::MAX),
                online_member_count: i64::try_from(online).unwrap_or(i64::MAX),
            })
        })
        .collect()
}

/// Builds a route from a `ztc_network_route` row.
#[must_use]
pub fn route(target: Option<String>, via: Option<String>) -> Option<Route> {
    Some(Route {
        target: target?,
        via: via.filter(|v| !v.is_empty()),
    })
}

#[must_use]
pub fn pool(start: Option<String>, end: Option<String>) -> Option<IpAssignmentPool> {
    Some(IpAssignmentPool {
        ip_range_start: start?,
        ip_range_end: end?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn nwid() -> NetworkId {
        NetworkId::new(0x1234_5678_90ab_cdef).unwrap()
    }

    #[test]
    fn null_columns_take_record_defaults() {
        let row = NetworkRow {
            id: Some("1234567890abcdef".into()),
            ..NetworkRow::default()
        };
        let record = row.into_record(Vec::new(), Vec::new()).unwrap();
        assert_eq!(record, NetworkRecord::new(nwid()));
    }

    #[test]
    fn malformed_columns_are_defaulted_not_fatal() {
        let row = NetworkRow {
            id: Some("1234567890abcdef".into()),
            mtu: Some(-5),
            rules: Some("{not json".into()),
            v6_assign_mode: Some(r#"{"rfc4193": true}"#.into()),
            revision: Some(-1),
            ..NetworkRow::default()
        };
        let record = row.into_record(Vec::new(), Vec::new()).unwrap();
        assert_eq!(record.mtu, 2800);
        assert_eq!(record.rules, vec![json!({"type": "ACTION_ACCEPT"})]);
        assert!(record.v6_assign_mode.rfc4193);
        assert_eq!(record.revision, 0);
    }

    #[test]
    fn bad_primary_key_drops_row() {
        let row = NetworkRow {
            id: Some("xyz".into()),
            ..NetworkRow::default()
        };
        assert!(row.into_record(Vec::new(), Vec::new()).is_none());
        assert!(MemberRow::default().into_record(Vec::new()).is_none());
    }

    #[test]
    fn rows_round_trip_through_records() {
        let mut n = NetworkRecord::new(nwid());
        n.name = "lab".into();
        n.revision = 4;
        n.extra.insert("remoteTraceLevel".into(), json!(2));
        let back = NetworkRow::from_record(&n)
            .into_record(n.ip_assignment_pools.clone(), n.routes.clone())
            .unwrap();
        assert_eq!(back, n);

        let mut m = MemberRecord::new(nwid(), MemberId::new(5).unwrap());
        m.authorized = true;
        m.v_major = 1;
        let back = MemberRow::from_record(&m).into_record(Vec::new()).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn children_group_by_parent() {
        let pools = group_children(vec![
            (Some("a"), pool(Some("10.0.0.1".into()), Some("10.0.0.9".into()))),
            (Some("a"), pool(Some("10.0.1.1".into()), None)),
            (None, pool(Some("x".into()), Some("y".into()))),
            (Some("b"), pool(Some("10.9.0.1".into()), Some("10.9.0.2".into()))),
        ]);
        assert_eq!(pools.len(), 2);
        assert_eq!(pools["a"].len(), 1);
        assert_eq!(pools["a"][0].ip_range_end, "10.0.0.9");
        assert_eq!(pools["b"].len(), 1);

        let routes = group_children(vec![
            (Some("b"), route(Some("10.0.0.0/24".into()), Some(String::new()))),
            (Some("b"), route(Some("0.0.0.0/0".into()), Some("10.0.0.1".into()))),
            (Some("c"), route(None, Some("10.0.0.1".into()))),
        ]);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes["b"][0].via, None);
        assert_eq!(routes["b"][1].via.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn presence_rows_skip_unknown_members() {
        let index = CachedIndex::new();
        let known = MemberId::new(1).unwrap();
        index.apply_member_change(None, Some(MemberRecord::new(nwid(), known)));
        let updates = vec![
            PresenceUpdate {
                network_id: nwid(),
                member_id: known,
                timestamp: 10,
                address: Some("192.0.2.7:9993".parse().unwrap()),
            },
            PresenceUpdate {
                network_id: nwid(),
                member_id: MemberId::new(2).unwrap(),
                timestamp: 10,
                address: None,
            },
        ];
        let rows = presence_rows(&updates, &index);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].member_id, "0000000001");
        assert_eq!(rows[0].address, "192.0.2.7:9993");
    }

    #[test]
    fn stats_count_recent_presence_only() {
        let index = CachedIndex::new();
        index.apply_network_change(None, Some(NetworkRecord::new(nwid())));
        let mut a = MemberRecord::new(nwid(), MemberId::new(1).unwrap());
        a.authorized = true;
        index.apply_member_change(None, Some(a));
        index.apply_member_change(None, Some(MemberRecord::new(nwid(), MemberId::new(2).unwrap())));
        let mut seen = HashMap::new();
        seen.insert(
            nwid(),
            HashMap::from([(MemberId::new(1).unwrap(), 9_500), (MemberId::new(2).unwrap(), 1_000)]),
        );
        let rows = stats_rows(&index, &seen, 10_000, 1_000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_member_count, 2);
        assert_eq!(rows[0].authorized_member_count, 1);
        assert_eq!(rows[0].online_member_count, 1);
    }
}
