//! Outbound notification boundary.
//!
//! Callers build a [`Notice`] that already respects the platform limits
//! below, then hand it to [`dispatch`], which never retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_FIELDS: usize = 25;
pub const MAX_FIELD_NAME_LEN: usize = 256;
pub const MAX_FIELD_VALUE_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Destination rejected notification: {0}")]
    Rejected(String),
    #[error("Notification transport unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color(pub u32);

impl Color {
    pub const GREEN: Color = Color(0x2ecc71);
    pub const RED: Color = Color(0xe74c3c);
    pub const PURPLE: Color = Color(0x9b59b6);
    pub const TEAL: Color = Color(0x1abc9c);
    pub const BLUE: Color = Color(0x3498db);
    pub const PINK: Color = Color(0xff51ff);
    pub const AMBER: Color = Color(0xffaa00);
    pub const GOLD: Color = Color(0xf1c40f);
}

impl Default for Color {
    fn default() -> Self {
        Color::BLUE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub label: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub color: Color,
    pub fields: Vec<Field>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Notice {
    pub fn new(title: impl AsRef<str>, color: Color) -> Self {
        Self {
            title: truncate(title.as_ref(), MAX_TITLE_LEN),
            color,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, text: impl AsRef<str>) -> Self {
        self.description = truncate(text.as_ref(), MAX_DESCRIPTION_LEN);
        self
    }

    pub fn with_footer(mut self, text: impl AsRef<str>) -> Self {
        self.footer = Some(truncate(text.as_ref(), MAX_DESCRIPTION_LEN));
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Append a field, truncating label and value. Returns `false` once the
    /// notice already holds [`MAX_FIELDS`].
    pub fn push_field(
        &mut self,
        label: impl AsRef<str>,
        value: impl AsRef<str>,
        inline: bool,
    ) -> bool {
        if self.fields.len() >= MAX_FIELDS {
            return false;
        }
        self.fields.push(Field {
            label: truncate(label.as_ref(), MAX_FIELD_NAME_LEN),
            value: truncate(value.as_ref(), MAX_FIELD_VALUE_LEN),
            inline,
        });
        true
    }

    /// Push one field per item up to `limit` (never more than [`MAX_FIELDS`]
    /// in total), then a single field carrying `+K more <noun>`.
    pub fn push_capped_fields<T, F>(&mut self, items: &[T], limit: usize, noun: &str, render: F)
    where
        F: Fn(&T) -> (String, String, bool),
    {
        // keep one slot free for the overflow marker
        let room = MAX_FIELDS.saturating_sub(self.fields.len() + 1);
        let shown = limit.min(room).min(items.len());

        for item in &items[..shown] {
            let (label, value, inline) = render(item);
            self.push_field(label, value, inline);
        }

        if items.len() > shown {
            self.push_field("...", format!("+{} more {}", items.len() - shown, noun), false);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_empty() && self.fields.is_empty()
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut with `…`.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

/// Join `items` with `", "`, showing at most `limit` of them followed by
/// ` (+K more)` when some were left out.
pub fn capped_list(items: &[String], limit: usize) -> String {
    if items.len() <= limit {
        return items.join(", ");
    }
    format!(
        "{} (+{} more)",
        items[..limit].join(", "),
        items.len() - limit
    )
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, destination: &str, notice: &Notice) -> Result<(), NotifyError>;
}

/// Send once, log on failure. Empty notices are skipped.
pub async fn dispatch(notifier: &dyn Notifier, destination: &str, notice: Notice) -> bool {
    if destination.is_empty() || notice.is_empty() {
        debug!(destination = destination, "Skipping empty notification");
        return false;
    }

    match notifier.send(destination, &notice).await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                destination = destination,
                title = %notice.title,
                error = %e,
                "Failed to send notification"
            );
            false
        }
    }
}

/// Notifier that writes every notice to the log as JSON. Used for dry runs
/// and when no transport is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, destination: &str, notice: &Notice) -> Result<(), NotifyError> {
        let body = serde_json::to_string(notice)
            .map_err(|e| NotifyError::Rejected(e.to_string()))?;
        info!(destination = destination, notice = %body, "Notification");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo wörld", 5), "héll…");
        assert_eq!(truncate("héllo wörld", 5).chars().count(), 5);
    }

    #[test]
    fn capped_list_appends_more_marker() {
        let users: Vec<String> = (0..18).map(|i| format!("<@{}>", i)).collect();
        let text = capped_list(&users, 15);
        assert!(text.ends_with(" (+3 more)"));
        assert!(text.starts_with("<@0>, <@1>"));
        assert_eq!(capped_list(&users[..2], 15), "<@0>, <@1>");
    }

    #[test]
    fn capped_fields_never_exceed_platform_limit() {
        let items: Vec<u32> = (0..40).collect();
        let mut notice = Notice::new("Nickname Changes", Color::PURPLE);
        notice.push_capped_fields(&items, 100, "nickname changes", |i| {
            (format!("<@{}>", i), "a → b".to_string(), true)
        });

        assert_eq!(notice.fields.len(), MAX_FIELDS);
        let last = notice.fields.last().unwrap();
        assert_eq!(last.value, "+16 more nickname changes");
    }

    #[test]
    fn field_text_is_truncated() {
        let mut notice = Notice::new("t", Color::BLUE);
        notice.push_field("x".repeat(300), "y".repeat(2000), false);
        assert_eq!(notice.fields[0].label.chars().count(), MAX_FIELD_NAME_LEN);
        assert_eq!(notice.fields[0].value.chars().count(), MAX_FIELD_VALUE_LEN);
    }

    #[tokio::test]
    async fn dispatch_skips_empty_and_swallows_failures() {
        let ok = RecordingNotifier::default();
        assert!(!dispatch(&ok, "log", Notice::new("empty", Color::BLUE)).await);
        assert!(ok.sent().is_empty());

        let down = RecordingNotifier::failing();
        let notice = Notice::new("t", Color::BLUE).with_description("body");
        assert!(!dispatch(&down, "log", notice.clone()).await);

        assert!(dispatch(&ok, "log", notice).await);
        assert_eq!(ok.sent().len(), 1);
    }
}
