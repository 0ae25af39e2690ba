//! Events that drive the session controller

use super::state::SessionId;
use crate::protocol::ServerEvent;

/// Inputs to [`transition`](super::transition).
///
/// User intents come from the presentation layer; the rest are reported by
/// the connection task of a particular session.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // User intents
    UserSend {
        text: String,
        /// Identity for the session this send will open
        session: SessionId,
    },
    UserCancel,
    SelectModels {
        models: Vec<String>,
    },

    // Connection events
    Connected {
        session: SessionId,
    },
    ConnectFailed {
        session: SessionId,
        reason: String,
    },
    Frame {
        session: SessionId,
        event: ServerEvent,
    },
    Closed {
        session: SessionId,
    },
}

impl Event {
    /// Session a connection event belongs to; `None` for user intents
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Event::Connected { session }
            | Event::ConnectFailed { session, .. }
            | Event::Frame { session, .. }
            | Event::Closed { session } => Some(*session),
            Event::UserSend { .. } | Event::UserCancel | Event::SelectModels { .. } => None,
        }
    }
}
