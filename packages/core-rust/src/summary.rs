//! Per-network aggregate view served alongside the network record.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::ids::MemberId;

/// Aggregates derived from a network's members.
///
/// Built from the cached derived sets, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    /// Members currently flagged as active bridges, sorted.
    pub active_bridges: Vec<MemberId>,
    /// Every address assigned to some member, sorted.
    pub allocated_ips: Vec<IpAddr>,
    pub authorized_member_count: usize,
    pub total_member_count: usize,
    /// Latest deauthorization time observed for any member (ms since epoch).
    pub most_recent_deauth_time: u64,
}
