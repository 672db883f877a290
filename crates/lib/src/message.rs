//! Conversation messages.
//!
//! A message is mutable only while `streaming` is true; once closed it is history.
//! Messages created on this side of the channel are flagged `local` so a server
//! snapshot can tell them apart from what the backend already knows about.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Synthetic reply appended when the backend reports an error.
pub const REPLY_ERROR_TEXT: &str = "Sorry, I encountered an error. Please try again.";

/// Synthetic reply appended when a submission could not be delivered.
pub const SUBMIT_ERROR_TEXT: &str =
    "Sorry, I encountered an error while sending your message. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// The backend historically calls this role "ai".
    #[serde(alias = "ai")]
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "time", deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub error: bool,
    /// Created client-side (optimistic or assembled), not yet part of a server snapshot.
    #[serde(skip)]
    pub local: bool,
}

impl Message {
    fn local(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            error: false,
            local: true,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::local(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::local(Role::Assistant, content)
    }

    /// Empty assistant reply opened by `stream_start`.
    pub fn streaming_placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::local(Role::Assistant, "")
        }
    }

    /// Assistant-role message flagged as an error.
    pub fn error_notice(content: impl Into<String>) -> Self {
        Self {
            error: true,
            ..Self::local(Role::Assistant, content)
        }
    }
}

/// Accepts RFC 3339 or naive ISO-8601 (read as UTC); null means the epoch.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(DateTime::<Utc>::default()),
        Some(s) => parse_timestamp(&s).map_err(serde::de::Error::custom),
    }
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn snapshot_entry_accepts_legacy_role_and_naive_time() {
        let m: Message = serde_json::from_str(
            r#"{"role":"ai","content":"hi","time":"2025-03-04T10:11:12.123456"}"#,
        )
        .unwrap();
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.created_at.year(), 2025);
        assert_eq!(m.created_at.hour(), 10);
        assert!(!m.streaming);
        assert!(!m.local);
    }

    #[test]
    fn snapshot_entry_accepts_rfc3339_created_at() {
        let m: Message = serde_json::from_str(
            r#"{"role":"user","content":"x","createdAt":"2025-03-04T10:11:12+02:00"}"#,
        )
        .unwrap();
        assert_eq!(m.created_at.hour(), 8);
    }

    #[test]
    fn missing_time_is_epoch() {
        let m: Message = serde_json::from_str(r#"{"role":"user","content":"x"}"#).unwrap();
        assert_eq!(m.created_at.timestamp(), 0);
    }

    #[test]
    fn constructors_are_local() {
        assert!(Message::user("a").local);
        let p = Message::streaming_placeholder();
        assert!(p.streaming && p.content.is_empty() && p.role == Role::Assistant);
        let e = Message::error_notice(REPLY_ERROR_TEXT);
        assert!(e.error && !e.streaming);
    }
}
