//! Versioned configuration records.
//!
//! [`NetworkRecord`] and [`MemberRecord`] are open documents: well-known
//! fields are typed, everything else round-trips through `extra`. Missing
//! fields decode to their documented defaults so that records written by
//! older controllers remain loadable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{MemberId, NetworkId};

/// Default multicast recipient limit for new networks.
pub const DEFAULT_MULTICAST_LIMIT: u32 = 32;

/// Default network MTU.
pub const DEFAULT_MTU: u32 = 2800;

/// Keys dropped from `extra` on decode. These are either legacy duplicates of
/// typed fields or runtime-derived values that must never influence change
/// detection.
const NETWORK_LEGACY_KEYS: &[&str] = &[
    "objtype",
    "nwid",
    "clock",
    "totalMemberCount",
    "authorizedMemberCount",
    "activeMemberCount",
];

const MEMBER_LEGACY_KEYS: &[&str] = &[
    "objtype",
    "address",
    "clock",
    "recentLog",
    "physicalAddress",
    "lastRequestMetaData",
];

fn default_true() -> bool {
    true
}

fn default_multicast_limit() -> u32 {
    DEFAULT_MULTICAST_LIMIT
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_version_field() -> i32 {
    -1
}

/// The accept-all rule set applied to networks that specify none.
#[must_use]
pub fn default_rules() -> Vec<Value> {
    vec![serde_json::json!({ "type": "ACTION_ACCEPT" })]
}

// ---------------------------------------------------------------------------
// Network sub-documents
// ---------------------------------------------------------------------------

/// Inclusive IP range handed out by automatic address assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAssignmentPool {
    pub ip_range_start: String,
    pub ip_range_end: String,
}

/// Managed route pushed to members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination in CIDR notation.
    pub target: String,
    /// Gateway address, `None` for an on-link route.
    #[serde(default)]
    pub via: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct V4AssignMode {
    #[serde(default)]
    pub zt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct V6AssignMode {
    #[serde(default)]
    pub zt: bool,
    #[serde(default)]
    pub rfc4193: bool,
    #[serde(default, rename = "6plane")]
    pub six_plane: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

// ---------------------------------------------------------------------------
// NetworkRecord
// ---------------------------------------------------------------------------

/// Configuration of one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    pub id: NetworkId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub private: bool,
    #[serde(default = "default_true")]
    pub enable_broadcast: bool,
    #[serde(default = "default_multicast_limit")]
    pub multicast_limit: u32,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_rules")]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub ip_assignment_pools: Vec<IpAssignmentPool>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub capabilities: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<Value>,
    #[serde(default)]
    pub v4_assign_mode: V4AssignMode,
    #[serde(default)]
    pub v6_assign_mode: V6AssignMode,
    #[serde(default)]
    pub dns: Dns,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub creation_time: u64,
    #[serde(default)]
    pub last_modified: u64,
    /// Fields this crate does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NetworkRecord {
    /// Creates a network with every field at its default.
    #[must_use]
    pub fn new(id: NetworkId) -> Self {
        Self {
            id,
            name: String::new(),
            private: true,
            enable_broadcast: true,
            multicast_limit: DEFAULT_MULTICAST_LIMIT,
            mtu: DEFAULT_MTU,
            rules: default_rules(),
            ip_assignment_pools: Vec::new(),
            routes: Vec::new(),
            capabilities: Vec::new(),
            tags: Vec::new(),
            v4_assign_mode: V4AssignMode::default(),
            v6_assign_mode: V6AssignMode::default(),
            dns: Dns::default(),
            revision: 0,
            creation_time: 0,
            last_modified: 0,
            extra: Map::new(),
        }
    }

    /// Decodes a network document, filling defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Fails when the id is missing or a typed field has the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut record: Self = serde_json::from_value(value)?;
        strip_keys(&mut record.extra, NETWORK_LEGACY_KEYS);
        Ok(record)
    }

    /// Decodes a network document from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Fails on invalid JSON or an undecodable document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    /// Returns `true` when both records carry the same configuration,
    /// ignoring revision and modification time.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.content_view() == other.content_view()
    }

    fn content_view(&self) -> Self {
        let mut view = self.clone();
        view.revision = 0;
        view.last_modified = 0;
        view
    }
}

// ---------------------------------------------------------------------------
// MemberRecord
// ---------------------------------------------------------------------------

/// Membership state of one device within one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub id: MemberId,
    #[serde(rename = "nwid")]
    pub network_id: NetworkId,
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub active_bridge: bool,
    #[serde(default)]
    pub ip_assignments: Vec<String>,
    #[serde(default)]
    pub no_auto_assign_ips: bool,
    #[serde(default)]
    pub capabilities: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<Value>,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub creation_time: u64,
    #[serde(default)]
    pub last_authorized_time: u64,
    #[serde(default)]
    pub last_deauthorized_time: u64,
    #[serde(default = "default_version_field")]
    pub v_major: i32,
    #[serde(default = "default_version_field")]
    pub v_minor: i32,
    #[serde(default = "default_version_field")]
    pub v_rev: i32,
    #[serde(default = "default_version_field")]
    pub v_proto: i32,
    #[serde(default)]
    pub last_online_time: u64,
    #[serde(default)]
    pub last_online_address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemberRecord {
    /// Creates an unauthorized member with every field at its default.
    #[must_use]
    pub fn new(network_id: NetworkId, id: MemberId) -> Self {
        Self {
            id,
            network_id,
            authorized: false,
            active_bridge: false,
            ip_assignments: Vec::new(),
            no_auto_assign_ips: false,
            capabilities: Vec::new(),
            tags: Vec::new(),
            identity: String::new(),
            revision: 0,
            creation_time: 0,
            last_authorized_time: 0,
            last_deauthorized_time: 0,
            v_major: -1,
            v_minor: -1,
            v_rev: -1,
            v_proto: -1,
            last_online_time: 0,
            last_online_address: None,
            extra: Map::new(),
        }
    }

    /// Decodes a member document, filling defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Fails when either id is missing or a typed field has the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut record: Self = serde_json::from_value(value)?;
        strip_keys(&mut record.extra, MEMBER_LEGACY_KEYS);
        Ok(record)
    }

    /// # Errors
    ///
    /// Fails on invalid JSON or an undecodable document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    /// Returns `true` when both records carry the same membership state,
    /// ignoring revision and presence.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.content_view() == other.content_view()
    }

    fn content_view(&self) -> Self {
        let mut view = self.clone();
        view.revision = 0;
        view.last_online_time = 0;
        view.last_online_address = None;
        view
    }
}

fn strip_keys(extra: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        extra.remove(*key);
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Identity of a record, independent of its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Network(NetworkId),
    Member(NetworkId, MemberId),
}

impl RecordKey {
    #[must_use]
    pub fn network_id(&self) -> NetworkId {
        match self {
            Self::Network(id) | Self::Member(id, _) => *id,
        }
    }
}

/// Either kind of record, as accepted by `save`.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Network(NetworkRecord),
    Member(MemberRecord),
}

impl Record {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Network(n) => RecordKey::Network(n.id),
            Self::Member(m) => RecordKey::Member(m.network_id, m.id),
        }
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        match self {
            Self::Network(n) => n.revision,
            Self::Member(m) => m.revision,
        }
    }

    pub fn set_revision(&mut self, revision: u64) {
        match self {
            Self::Network(n) => n.revision = revision,
            Self::Member(m) => m.revision = revision,
        }
    }

    #[must_use]
    pub fn creation_time(&self) -> u64 {
        match self {
            Self::Network(n) => n.creation_time,
            Self::Member(m) => m.creation_time,
        }
    }

    pub fn set_creation_time(&mut self, at: u64) {
        match self {
            Self::Network(n) => n.creation_time = at,
            Self::Member(m) => m.creation_time = at,
        }
    }

    /// Content comparison across records of the same kind. Records of
    /// different kinds are never equal.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Network(a), Self::Network(b)) => a.same_content(b),
            (Self::Member(a), Self::Member(b)) => a.same_content(b),
            _ => false,
        }
    }

    /// Decodes a document of either kind. An explicit `objtype` wins;
    /// otherwise a document whose `nwid` differs from its `id` is a member
    /// (legacy network documents repeat their own id as `nwid`).
    ///
    /// # Errors
    ///
    /// Propagates the decode error of the detected kind.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let is_member = match value.get("objtype").and_then(Value::as_str) {
            Some(kind) => kind == "member",
            None => value
                .get("nwid")
                .is_some_and(|nwid| Some(nwid) != value.get("id")),
        };
        if is_member {
            MemberRecord::from_value(value).map(Self::Member)
        } else {
            NetworkRecord::from_value(value).map(Self::Network)
        }
    }

    /// Encodes the record as a JSON document.
    ///
    /// # Errors
    ///
    /// Only fails if `extra` holds values serde cannot encode.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Network(n) => serde_json::to_value(n),
            Self::Member(m) => serde_json::to_value(m),
        }
    }
}

impl From<NetworkRecord> for Record {
    fn from(record: NetworkRecord) -> Self {
        Self::Network(record)
    }
}

impl From<MemberRecord> for Record {
    fn from(record: MemberRecord) -> Self {
        Self::Member(record)
    }
}
