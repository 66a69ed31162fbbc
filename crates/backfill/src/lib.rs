//! Online secondary-index backfill coordination.
//!
//! Adding an index to a populated, partitioned table requires copying every
//! existing row into the index without blocking live traffic. This crate owns
//! the coordinator side of that operation: picking one consistent read
//! timestamp across all tablets, driving each tablet through a resumable
//! checkpointed chunk loop, isolating failures per index, and walking each
//! index's permission stages to `Public` (or terminal `Failed`). Replication,
//! storage, the wire transport and catalog persistence are collaborators
//! reached through the narrow traits in [`service`] and [`catalog`].

pub mod alter;
pub mod catalog;
pub mod chunk;
pub mod coordinator;
pub mod metrics;
pub mod retry;
pub mod safe_time;
pub mod service;
pub mod tablet;
#[cfg(any(test, feature = "testing"))]
pub mod test_helpers;
pub mod types;

#[cfg(test)]
mod tests;

pub use alter::MultiStageAlter;
pub use coordinator::{
    BackfillOutcome,
    BackfillTable,
};
