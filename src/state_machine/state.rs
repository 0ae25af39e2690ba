//! Session controller state types

use crate::protocol::SendRequest;
use crate::transcript::Transcript;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one generation request and its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of the single active session.
///
/// There is no separate closed state: once a socket closes the controller is
/// back to `Idle`, which is observationally the same thing.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    /// No connection
    #[default]
    Idle,

    /// Socket being established; `request` goes out as soon as it opens
    Connecting {
        session: SessionId,
        request: SendRequest,
    },

    /// Request sent, receiving events
    Streaming {
        session: SessionId,
        cancel_sent: bool,
    },
}

impl SessionState {
    /// The session holding the connection handle, if any
    pub fn session(&self) -> Option<SessionId> {
        match self {
            SessionState::Idle => None,
            SessionState::Connecting { session, .. } | SessionState::Streaming { session, .. } => {
                Some(*session)
            }
        }
    }

    pub fn is_current(&self, session: SessionId) -> bool {
        self.session() == Some(session)
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Connecting { .. } => SessionStatus::Connecting,
            SessionState::Streaming { .. } => SessionStatus::Streaming,
        }
    }
}

/// Coarse session state exposed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Streaming,
}

/// Everything the controller owns: the session, the log and the model selection
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatState {
    pub session: SessionState,
    pub transcript: Transcript,
    pub models: Vec<String>,
}

impl ChatState {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            session: SessionState::Idle,
            transcript: Transcript::new(),
            models,
        }
    }
}

/// Immutable configuration for the controller
#[derive(Debug, Clone)]
pub struct ChatContext {
    /// Model ids the user may select
    pub catalog: Vec<String>,
}

impl ChatContext {
    pub fn new(catalog: Vec<String>) -> Self {
        Self { catalog }
    }

    pub fn knows_model(&self, model: &str) -> bool {
        self.catalog.iter().any(|m| m == model)
    }
}
