use std::fmt;

use derive_more::Display;
use serde::{
    Deserialize,
    Serialize,
};

mod timestamp;

pub use timestamp::HybridTimestamp;

/// Stable identifier of a table. Index-backing tables have ids of their own.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TableId(String);

impl TableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable identifier of a secondary index under construction.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct IndexId(String);

impl IndexId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable identifier of one tablet: a contiguous key-range shard of a table,
/// replicated independently.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TabletId(String);

impl TabletId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Version counter on a table's persisted schema. Every committed permission
/// change increments it; compare-and-set writes detect concurrent alters by
/// observing a version other than the one they expected.
#[derive(
    Clone, Copy, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    pub const ZERO: SchemaVersion = SchemaVersion(0);

    pub fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn succ(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// A row key within a tablet's range. Keys are opaque byte strings ordered
/// lexicographically; they render as hex since raw key bytes are rarely
/// printable.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RowKey(Vec<u8>);

impl RowKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        Ok(Self(hex::decode(s)?))
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({})", self.hex())
    }
}
