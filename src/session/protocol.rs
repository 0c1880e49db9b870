//! WebSocket control messages.
//!
//! Inbound (`type`-tagged):
//! ```json
//! {"type": "text", "text": "Hello"}
//! {"type": "speaker", "speaker": 3}
//! {"type": "end"}
//! ```
//! `response.done` and `response.output_item.done` are accepted as `end`, so a
//! realtime-API event stream can be forwarded to conversion-only sockets as is.
//!
//! A one-shot `/ws/tts` socket opened without `text` in its query expects one
//! untagged request first: `{"text": "Hello", "speaker": 3}`.
//!
//! Outbound (`event`-tagged): `ready`, `end`, and `error` with a `detail` string.
//! Audio is sent separately as binary PCM16 frames.

use crate::error::StreamError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },

    #[serde(
        rename = "end",
        alias = "response.done",
        alias = "response.output_item.done"
    )]
    End,

    /// Speaker ids arrive as numbers or numeric strings
    #[serde(rename = "speaker")]
    Speaker { speaker: Value },

    #[serde(other)]
    Unknown,
}

/// The single request of a one-shot session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitRequest {
    #[serde(default)]
    pub text: String,
    /// Overrides the speaker chosen at connect time
    #[serde(default)]
    pub speaker: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Ready,
    End,
    Error { detail: String },
}

impl ServerEvent {
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            // Only reachable if serde_json rejects a plain string field
            Err(_) => r#"{"event":"error","detail":"unserializable event"}"#.to_string(),
        }
    }
}

/// Parse one inbound text frame.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, StreamError> {
    serde_json::from_str(raw).map_err(|e| StreamError::Protocol(format!("invalid message: {e}")))
}

/// Parse the request frame of a one-shot session.
pub fn parse_init_request(raw: &str) -> Result<InitRequest, StreamError> {
    serde_json::from_str(raw)
        .map_err(|e| StreamError::Protocol(format!("invalid request: {e}")))
}

/// Interpret a speaker id given as a JSON number or numeric string.
pub fn parse_speaker(value: &Value) -> Result<u32, StreamError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| StreamError::Protocol(format!("invalid speaker id: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inbound_messages() {
        assert_eq!(
            parse_client_message(r#"{"type":"text","text":"Hi"}"#).unwrap(),
            ClientMessage::Text { text: "Hi".to_string() }
        );
        assert_eq!(
            parse_client_message(r#"{"type":"text"}"#).unwrap(),
            ClientMessage::Text { text: String::new() }
        );
        assert_eq!(parse_client_message(r#"{"type":"end"}"#).unwrap(), ClientMessage::End);
        assert_eq!(
            parse_client_message(r#"{"type":"speaker","speaker":"8"}"#).unwrap(),
            ClientMessage::Speaker { speaker: json!("8") }
        );
    }

    #[test]
    fn test_realtime_end_aliases() {
        for raw in [
            r#"{"type":"response.done","response":{"id":"r1"}}"#,
            r#"{"type":"response.output_item.done","item":{}}"#,
        ] {
            assert_eq!(parse_client_message(raw).unwrap(), ClientMessage::End);
        }
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            parse_client_message(r#"{"type":"response.audio.delta","delta":"AAAA"}"#).unwrap(),
            ClientMessage::Unknown
        );
        assert!(matches!(
            parse_client_message("not json"),
            Err(StreamError::Protocol(_))
        ));
        assert!(matches!(
            parse_client_message(r#"{"text":"no type"}"#),
            Err(StreamError::Protocol(_))
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"text","text":42}"#),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_init_request() {
        assert_eq!(
            parse_init_request(r#"{"text":"Hello.","speaker":3}"#).unwrap(),
            InitRequest {
                text: "Hello.".to_string(),
                speaker: Some(json!(3)),
            }
        );
        assert_eq!(parse_init_request("{}").unwrap(), InitRequest::default());
        assert!(matches!(
            parse_init_request("hello"),
            Err(StreamError::Protocol(reason)) if reason.starts_with("invalid request")
        ));
    }

    #[test]
    fn test_parse_speaker() {
        assert_eq!(parse_speaker(&json!(3)).unwrap(), 3);
        assert_eq!(parse_speaker(&json!(" 14 ")).unwrap(), 14);
        assert!(parse_speaker(&json!(-1)).is_err());
        assert!(parse_speaker(&json!("zundamon")).is_err());
        assert!(parse_speaker(&json!(null)).is_err());
    }

    #[test]
    fn test_outbound_events() {
        assert_eq!(ServerEvent::Ready.to_json(), r#"{"event":"ready"}"#);
        assert_eq!(ServerEvent::End.to_json(), r#"{"event":"end"}"#);
        assert_eq!(
            ServerEvent::Error { detail: "boom".to_string() }.to_json(),
            r#"{"event":"error","detail":"boom"}"#
        );
    }
}
