//! Scheduled channel rotation.
//!
//! A due resource is snapshotted, recreated, and the replacement persisted
//! before the original is destroyed. Runs are deduplicated per logical slot
//! ([`ResourceKey`](crate::store::ResourceKey)), which survives the channel
//! id change a rotation causes.

pub mod actions;
pub mod dedup;
pub mod error;
pub mod service;

pub use actions::{ActionError, AlwaysConnected, ChannelActions, ChannelTemplate, ConnectivityProbe};
pub use dedup::{DedupGuard, DedupLocks};
pub use error::{JobError, SchedulerError};
pub use service::{DedupScheduler, SchedulerConfig};

#[cfg(test)]
mod tests;
