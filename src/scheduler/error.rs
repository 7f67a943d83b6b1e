use super::actions::ActionError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Interval must be at least one hour")]
    InvalidInterval,

    #[error("No scheduled rotation for channel {channel_id} in guild {guild_id}")]
    NotFound { guild_id: String, channel_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Why a rotation did not reach its persist step.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to snapshot channel: {0}")]
    Snapshot(ActionError),

    #[error("Failed to create replacement channel: {0}")]
    Create(ActionError),

    #[error("Failed to persist replacement channel: {0}")]
    Persist(StoreError),
}
