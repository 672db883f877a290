//! Realtime channel protocol: JSON envelope and typed events.
//!
//! Every frame is `{ "event": "<name>", "payload": <json> }`. Incoming frames are parsed
//! once, here, into [`ServerEvent`]; consumers only ever see the typed form.

use crate::message::Message;
use serde::{Deserialize, Serialize};

/// Wire frame in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("event {0} ignored")]
    Ignored(String),
}

/// Discriminant of [`ServerEvent`], used to pick subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Registered,
    Snapshot,
    AiResponse,
    StreamStart,
    StreamChunk,
    StreamEnd,
    Error,
    Alert,
    Disconnected,
}

/// Events delivered to consumers. All but `Disconnected` arrive from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected { message: String },
    Registered { session_id: String },
    /// Full, authoritative conversation history (`new_message`).
    Snapshot(Vec<Message>),
    /// Whole reply delivered at once.
    AiResponse { response: String },
    StreamStart,
    StreamChunk { chunk: String },
    StreamEnd,
    Error { reason: String },
    Alert { title: String },
    /// Synthesised locally when the transport drops without an explicit disconnect.
    Disconnected { reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct ConnectedPayload {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RegisteredPayload {
    #[serde(alias = "user_id")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct AiResponsePayload {
    response: String,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    chunk: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default, alias = "error")]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct AlertPayload {
    title: String,
}

/// Reminder push from the scheduling backend.
#[derive(Debug, Deserialize)]
struct ScheduleAlertPayload {
    #[serde(default)]
    success: bool,
    reminder_title: Option<String>,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected { .. } => EventKind::Connected,
            ServerEvent::Registered { .. } => EventKind::Registered,
            ServerEvent::Snapshot(_) => EventKind::Snapshot,
            ServerEvent::AiResponse { .. } => EventKind::AiResponse,
            ServerEvent::StreamStart => EventKind::StreamStart,
            ServerEvent::StreamChunk { .. } => EventKind::StreamChunk,
            ServerEvent::StreamEnd => EventKind::StreamEnd,
            ServerEvent::Error { .. } => EventKind::Error,
            ServerEvent::Alert { .. } => EventKind::Alert,
            ServerEvent::Disconnected { .. } => EventKind::Disconnected,
        }
    }

    /// Parse one text frame.
    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        let env: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(env)
    }

    pub fn from_envelope(env: Envelope) -> Result<Self, ProtocolError> {
        let payload = if env.payload.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            env.payload
        };
        let event = match env.event.as_str() {
            "connected" => {
                let p: ConnectedPayload = serde_json::from_value(payload).unwrap_or_default();
                ServerEvent::Connected { message: p.message }
            }
            "registered" => {
                let p: RegisteredPayload = serde_json::from_value(payload)?;
                ServerEvent::Registered {
                    session_id: p.session_id,
                }
            }
            "new_message" => ServerEvent::Snapshot(serde_json::from_value(payload)?),
            "ai_response" => {
                let p: AiResponsePayload = serde_json::from_value(payload)?;
                ServerEvent::AiResponse {
                    response: p.response,
                }
            }
            "stream_start" => ServerEvent::StreamStart,
            "stream_chunk" => {
                let p: ChunkPayload = serde_json::from_value(payload)?;
                ServerEvent::StreamChunk { chunk: p.chunk }
            }
            "stream_end" => ServerEvent::StreamEnd,
            "error" => {
                let p: ErrorPayload = serde_json::from_value(payload)?;
                ServerEvent::Error { reason: p.reason }
            }
            "alert" => {
                let p: AlertPayload = serde_json::from_value(payload)?;
                ServerEvent::Alert { title: p.title }
            }
            "schedule_alert" => {
                let p: ScheduleAlertPayload = serde_json::from_value(payload)?;
                match p.reminder_title {
                    Some(title) if p.success && !title.trim().is_empty() => {
                        ServerEvent::Alert { title }
                    }
                    _ => return Err(ProtocolError::Ignored(env.event)),
                }
            }
            _ => return Err(ProtocolError::UnknownEvent(env.event)),
        };
        Ok(event)
    }
}

/// Frames the client sends on the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Announce the session identity under the given event name.
    Register { event: String, session_id: String },
    Custom {
        event: String,
        payload: serde_json::Value,
    },
}

impl ClientEvent {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            ClientEvent::Register { event, session_id } => Envelope {
                event: event.clone(),
                // The backend reads either key depending on the endpoint.
                payload: serde_json::json!({ "session_id": session_id, "user_id": session_id }),
            },
            ClientEvent::Custom { event, payload } => Envelope {
                event: event.clone(),
                payload: payload.clone(),
            },
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn parses_stream_events() {
        assert_eq!(
            ServerEvent::from_frame(r#"{"event":"stream_start","payload":{"message":"Processing"}}"#)
                .unwrap(),
            ServerEvent::StreamStart
        );
        assert_eq!(
            ServerEvent::from_frame(r#"{"event":"stream_chunk","payload":{"chunk":"Hel"}}"#).unwrap(),
            ServerEvent::StreamChunk {
                chunk: "Hel".to_string()
            }
        );
        assert_eq!(
            ServerEvent::from_frame(r#"{"event":"stream_end"}"#).unwrap(),
            ServerEvent::StreamEnd
        );
    }

    #[test]
    fn error_accepts_reason_or_error_key() {
        let a = ServerEvent::from_frame(r#"{"event":"error","payload":{"reason":"boom"}}"#).unwrap();
        let b = ServerEvent::from_frame(r#"{"event":"error","payload":{"error":"boom"}}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn snapshot_parses_message_array() {
        let ev = ServerEvent::from_frame(
            r#"{"event":"new_message","payload":[
                {"role":"user","content":"hi","time":"2025-01-01T00:00:00"},
                {"role":"ai","content":"hello","time":"2025-01-01T00:00:01"}
            ]}"#,
        )
        .unwrap();
        let ServerEvent::Snapshot(msgs) = ev else {
            panic!("expected snapshot");
        };
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs.iter().all(|m| !m.local));
    }

    #[test]
    fn schedule_alert_maps_to_alert_only_when_successful_and_titled() {
        let ev = ServerEvent::from_frame(
            r#"{"event":"schedule_alert","payload":{"success":true,"reminder_title":"Take meds"}}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            ServerEvent::Alert {
                title: "Take meds".to_string()
            }
        );
        let ignored = ServerEvent::from_frame(
            r#"{"event":"schedule_alert","payload":{"success":false,"reminder_title":"x"}}"#,
        );
        assert!(matches!(ignored, Err(ProtocolError::Ignored(_))));
        for payload in [
            r#"{"reminder_title":"no success flag"}"#,
            r#"{"success":true,"reminder_title":"  "}"#,
            r#"{"success":true}"#,
        ] {
            let frame = format!(r#"{{"event":"schedule_alert","payload":{}}}"#, payload);
            assert!(
                matches!(ServerEvent::from_frame(&frame), Err(ProtocolError::Ignored(_))),
                "{}",
                payload
            );
        }
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(matches!(
            ServerEvent::from_frame(r#"{"event":"telemetry","payload":{}}"#),
            Err(ProtocolError::UnknownEvent(_))
        ));
        assert!(matches!(
            ServerEvent::from_frame("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn register_frame_carries_session_under_both_keys() {
        let frame = ClientEvent::Register {
            event: "register".to_string(),
            session_id: "u-1".to_string(),
        }
        .to_frame()
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["event"], "register");
        assert_eq!(v["payload"]["session_id"], "u-1");
        assert_eq!(v["payload"]["user_id"], "u-1");
    }
}
