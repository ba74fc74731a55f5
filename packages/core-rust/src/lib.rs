//! confdb core: network and member records, identifiers, summaries, clock.

pub mod clock;
pub mod ids;
pub mod record;
pub mod summary;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use ids::{IdError, MemberId, NetworkId};
pub use record::{
    Dns, IpAssignmentPool, MemberRecord, NetworkRecord, Record, RecordKey, Route, V4AssignMode,
    V6AssignMode,
};
pub use summary::NetworkSummary;

