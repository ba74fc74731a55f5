//! Network and member identifiers.
//!
//! Both identifiers are rendered as fixed-width lowercase hex strings when
//! used as key fragments (file names, selectors, SQL keys) and when
//! serialized into record documents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Largest valid member id (40 bits).
pub const MEMBER_ID_MAX: u64 = 0xff_ffff_ffff;

/// Errors produced when parsing or constructing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("invalid hex identifier: {0:?}")]
    InvalidHex(String),

    #[error("member id {0:#x} exceeds 40 bits")]
    MemberOutOfRange(u64),

    #[error("network id must be non-zero")]
    ZeroNetwork,
}

// ---------------------------------------------------------------------------
// NetworkId
// ---------------------------------------------------------------------------

/// 64-bit network identifier, rendered as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(u64);

impl NetworkId {
    /// Wraps a raw id. Zero is reserved and rejected.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::ZeroNetwork`] for `0`.
    pub fn new(raw: u64) -> Result<Self, IdError> {
        if raw == 0 {
            return Err(IdError::ZeroNetwork);
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the 16-digit hex rendering.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(parse_hex(s)?)
    }
}

impl Serialize for NetworkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// MemberId
// ---------------------------------------------------------------------------

/// 40-bit member identifier, unique within a network, rendered as 10 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u64);

impl MemberId {
    /// Wraps a raw id, rejecting values wider than 40 bits.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::MemberOutOfRange`] when `raw > MEMBER_ID_MAX`.
    pub fn new(raw: u64) -> Result<Self, IdError> {
        if raw > MEMBER_ID_MAX {
            return Err(IdError::MemberOutOfRange(raw));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the 10-digit hex rendering.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:010x}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(parse_hex(s)?)
    }
}

impl Serialize for MemberId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MemberId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_hex(s: &str) -> Result<u64, IdError> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(IdError::InvalidHex(s.to_string()));
    }
    u64::from_str_radix(trimmed, 16).map_err(|_| IdError::InvalidHex(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_id_renders_sixteen_digits() {
        let id: NetworkId = "1234567890abcdef".parse().unwrap();
        assert_eq!(id.as_u64(), 0x1234_5678_90ab_cdef);
        assert_eq!(id.to_string(), "1234567890abcdef");
        assert_eq!(NetworkId::new(0xff).unwrap().to_hex(), "00000000000000ff");
    }

    #[test]
    fn network_id_rejects_zero_and_garbage() {
        assert_eq!(NetworkId::new(0), Err(IdError::ZeroNetwork));
        assert!("zz".parse::<NetworkId>().is_err());
        assert!("".parse::<NetworkId>().is_err());
        assert!("1234567890abcdef0".parse::<NetworkId>().is_err());
    }

    #[test]
    fn member_id_is_forty_bits() {
        let id: MemberId = "0102030405".parse().unwrap();
        assert_eq!(id.as_u64(), 0x01_0203_0405);
        assert_eq!(id.to_string(), "0102030405");
        assert_eq!(
            MemberId::new(MEMBER_ID_MAX + 1),
            Err(IdError::MemberOutOfRange(MEMBER_ID_MAX + 1))
        );
    }

    #[test]
    fn ids_serialize_as_hex_strings() {
        let nwid = NetworkId::new(0xabc).unwrap();
        let json = serde_json::to_string(&nwid).unwrap();
        assert_eq!(json, "\"0000000000000abc\"");
        let back: NetworkId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nwid);

        let mid: MemberId = serde_json::from_str("\"deadbeef00\"").unwrap();
        assert_eq!(mid.as_u64(), 0xde_adbe_ef00);
    }

    proptest::proptest! {
        #[test]
        fn member_hex_is_fixed_width(raw in 0..=MEMBER_ID_MAX) {
            let id = MemberId::new(raw).unwrap();
            let hex = id.to_hex();
            proptest::prop_assert_eq!(hex.len(), 10);
            proptest::prop_assert_eq!(hex.parse::<MemberId>().unwrap(), id);
        }
    }
}
