use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Channel not found: {0}")]
    NotFound(String),
    #[error("Missing permission: {0}")]
    Forbidden(String),
    #[error("Platform request failed: {0}")]
    Request(String),
}

/// Everything needed to recreate a channel in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTemplate {
    pub guild_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub parent_id: Option<String>,
    pub position: i32,
    pub nsfw: bool,
    pub rate_limit_per_user: u32,
}

/// Channel operations the rotation job needs from the platform.
#[async_trait]
pub trait ChannelActions: Send + Sync {
    async fn snapshot(&self, guild_id: &str, channel_id: &str)
        -> Result<ChannelTemplate, ActionError>;

    /// Returns the new channel's id.
    async fn create_from(&self, template: &ChannelTemplate) -> Result<String, ActionError>;

    async fn reposition(&self, channel_id: &str, position: i32) -> Result<(), ActionError>;

    async fn destroy(&self, channel_id: &str) -> Result<(), ActionError>;
}

/// Whether the platform connection is currently up.
pub trait ConnectivityProbe: Send + Sync {
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConnected;

impl ConnectivityProbe for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }
}
