//! Time-bounded caching of hot per-guild configuration.

pub mod guild_config;
pub mod ttl;

pub use guild_config::GuildConfigs;
pub use ttl::{Generation, TtlCache};

#[cfg(test)]
mod tests;
