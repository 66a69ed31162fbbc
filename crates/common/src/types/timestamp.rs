use std::{
    fmt,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use serde::{
    Deserialize,
    Serialize,
};

const BITS_FOR_LOGICAL: u32 = 12;
const LOGICAL_MASK: u64 = (1 << BITS_FOR_LOGICAL) - 1;

/// A hybrid logical clock value: 52 bits of physical microseconds since the
/// unix epoch and 12 bits of logical counter, packed so that the natural u64
/// ordering is hybrid-time ordering (physical first, logical as the
/// tie-break). Used as the single global read point for a backfill run.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HybridTimestamp(u64);

impl HybridTimestamp {
    pub const MAX: HybridTimestamp = HybridTimestamp(u64::MAX);
    pub const MIN: HybridTimestamp = HybridTimestamp(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros << BITS_FOR_LOGICAL)
    }

    pub fn physical_micros(&self) -> u64 {
        self.0 >> BITS_FOR_LOGICAL
    }

    pub fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }
}

impl TryFrom<SystemTime> for HybridTimestamp {
    type Error = anyhow::Error;

    fn try_from(t: SystemTime) -> anyhow::Result<Self> {
        let micros = t.duration_since(UNIX_EPOCH)?.as_micros();
        let micros: u64 = micros.try_into()?;
        anyhow::ensure!(
            micros <= u64::MAX >> BITS_FOR_LOGICAL,
            "system time too large for a hybrid timestamp"
        );
        Ok(Self::from_micros(micros))
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_micros(), self.logical())
    }
}

impl fmt::Debug for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HybridTimestamp({self})")
    }
}
