//! Event batching.
//!
//! [`EventBatcher`] is the generic accumulator; the submodules plug a
//! [`BatchSink`] into it for each noisy event stream the bot handles.

pub mod batcher;
pub mod event_log;
pub mod message_cache;
pub mod presence;
pub mod xp;

pub use batcher::{BatchRecord, BatchSink, BatcherConfig, EventBatcher};
pub use event_log::{EventLogBatcher, EventLogSink, LogEvent, LogEventKind, LogEvents};
pub use message_cache::{sweep_expired_messages, MessageCacheBatcher, MessageCacheSink};
pub use presence::{PresenceBatcher, PresenceChange, PresenceChanges, PresenceSink};
pub use xp::{
    level_for_xp, RoleGrantError, RoleGrants, TracingRoleGrants, XpBatcher, XpGrant, XpKey, XpSink,
};

use std::time::Duration;

/// Human wording for a flush window, e.g. "10 seconds" or "2 minutes".
pub(crate) fn describe_window(window: Duration) -> String {
    let secs = window.as_secs();
    match secs {
        0 | 1 => "second".to_string(),
        s if s % 3600 == 0 => plural(s / 3600, "hour"),
        s if s % 60 == 0 => plural(s / 60, "minute"),
        s => plural(s, "second"),
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        unit.to_string()
    } else {
        format!("{} {}s", n, unit)
    }
}
