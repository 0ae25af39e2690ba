//! Wire format for the streaming chat socket
//!
//! Every frame is a JSON text message. The client sends exactly one
//! [`ClientFrame::Send`] after the socket opens and at most one
//! [`ClientFrame::Cancel`] while it stays open. The peer answers with a
//! stream of [`ServerEvent`]s discriminated by `type`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Author of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Payload of the opening frame: selected models plus the full history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub model: Vec<String>,
    pub messages: Vec<Message>,
}

/// Control verbs a client may issue on an open socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Cancel,
}

/// Frames written by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Send(SendRequest),
    Control { action: Action },
}

impl ClientFrame {
    pub fn cancel() -> Self {
        ClientFrame::Control {
            action: Action::Cancel,
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(
            self,
            ClientFrame::Control {
                action: Action::Cancel
            }
        )
    }

    /// Serialize to the text payload of a socket frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Frames written by the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One incremental fragment of generated text
    Token { token: String },
    /// End of generation; `duration` is wall-clock seconds when the peer reports it
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    /// Generation failed
    Error { message: String },
    /// Any `type` this client does not know about
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn token(token: impl Into<String>) -> Self {
        ServerEvent::Token {
            token: token.into(),
        }
    }

    pub fn done() -> Self {
        ServerEvent::Done { duration: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Parse the text payload of an inbound frame.
    ///
    /// Unrecognized `type` values decode to [`ServerEvent::Unknown`]; only
    /// non-JSON payloads or known types with missing fields are errors.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}
