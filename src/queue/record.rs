//! Fix record and its on-disk encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Queue-assigned sequence id. Ids start at 1 and grow with append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FixId(pub u64);

impl FixId {
    /// Big-endian key so that the store's lexicographic order is append order.
    pub(crate) fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub(crate) fn from_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        Some(FixId(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for FixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A fix before the queue has assigned it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFix {
    pub device_id: String,
    /// Capture time, milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Degrees
    pub latitude: f64,
    /// Degrees
    pub longitude: f64,
    /// Metres per second
    pub speed: f64,
    /// Degrees
    pub bearing: f64,
}

/// One normalized location sample owned by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct FixRecord {
    pub id: FixId,
    pub fix: NewFix,
    pub sent: bool,
}

/// Value stored under a `FixId` key.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredFix {
    pub fix: NewFix,
    pub sent: bool,
}

impl StoredFix {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }

    pub fn into_record(self, id: FixId) -> FixRecord {
        FixRecord {
            id,
            fix: self.fix,
            sent: self.sent,
        }
    }
}
