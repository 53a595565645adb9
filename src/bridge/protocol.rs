//! Terminal WebSocket protocol
//!
//! Control traffic is JSON text frames with a `{"type": ...}` envelope.
//! Terminal output goes out as binary frames of raw bytes, and binary frames
//! from the client are raw input.
//!
//! Client → server:
//! ```text
//! {"type":"TermSetSessionId","session_id":"S"}
//! {"type":"TermResize","rows":24,"cols":80}
//! {"type":"TermInput","data":"ls\n"}
//! {"type":"TermPause","pause":true}
//! {"type":"TermOutputRequest","request_id":"r1","lines":10}
//! ```
//!
//! Server → client: `TermOutputResponse`, `TermSessionBound`, `TermError`,
//! `TermClosed`.
//!
//! A frame whose `type` is not one of the above decodes to
//! [`Inbound::Unknown`]; the connection ignores it and never answers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing message type")]
    MissingType,

    #[error("Malformed {kind} frame: {reason}")]
    Malformed { kind: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    TermSetSessionId { session_id: String },
    TermResize { rows: u16, cols: u16 },
    TermInput { data: String },
    TermPause { pause: bool },
    TermOutputRequest { request_id: String, lines: usize },
}

const CLIENT_TYPES: [&str; 5] = [
    "TermSetSessionId",
    "TermResize",
    "TermInput",
    "TermPause",
    "TermOutputRequest",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    TermOutputResponse {
        request_id: String,
        success: bool,
        output: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TermSessionBound {
        session_id: String,
        reattached: bool,
        replay_bytes: usize,
    },
    TermError {
        kind: String,
        message: String,
    },
    TermClosed {
        reason: String,
    },
}

impl ServerMessage {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::TermError {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings, integers and bools: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A decoded text frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ClientMessage),
    Unknown(String),
}

pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !CLIENT_TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown(kind));
    }

    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|e| ProtocolError::Malformed {
            kind,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_messages() {
        assert_eq!(
            decode(r#"{"type":"TermSetSessionId","session_id":"S"}"#).unwrap(),
            Inbound::Message(ClientMessage::TermSetSessionId {
                session_id: "S".into()
            })
        );
        assert_eq!(
            decode(r#"{"type":"TermResize","rows":40,"cols":120}"#).unwrap(),
            Inbound::Message(ClientMessage::TermResize { rows: 40, cols: 120 })
        );
        assert_eq!(
            decode(r#"{"type":"TermOutputRequest","request_id":"r1","lines":10}"#).unwrap(),
            Inbound::Message(ClientMessage::TermOutputRequest {
                request_id: "r1".into(),
                lines: 10
            })
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            decode(r#"{"type":"Bogus","x":1}"#).unwrap(),
            Inbound::Unknown("Bogus".into())
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode("not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(decode(r#"{"data":"x"}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"TermResize","rows":"tall"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_server_envelope() {
        let json = ServerMessage::TermOutputResponse {
            request_id: "r1".into(),
            success: true,
            output: vec!["hi".into()],
            error: None,
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "TermOutputResponse");
        assert_eq!(value["output"][0], "hi");
        assert!(value.get("error").is_none());

        let bound = ServerMessage::TermSessionBound {
            session_id: "S".into(),
            reattached: true,
            replay_bytes: 12,
        }
        .to_json();
        assert!(bound.contains(r#""type":"TermSessionBound""#));
    }
}
