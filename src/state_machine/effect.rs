//! Effects produced by state transitions

use super::state::SessionId;
use crate::protocol::ClientFrame;

/// Effects to be executed, in order, after a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start connecting a new socket for `session`
    OpenConnection { session: SessionId },

    /// Actively close the socket of a superseded session
    CloseConnection { session: SessionId },

    /// Drop the handle of a session whose socket already went away
    ReleaseConnection { session: SessionId },

    /// Write one frame on the session's socket
    SendFrame {
        session: SessionId,
        frame: ClientFrame,
    },

    /// Push the current transcript to subscribers
    PublishTranscript,

    /// Push the current session status to subscribers
    PublishStatus,

    /// The peer marked the end of generation
    NotifyTurnComplete { duration: Option<f64> },
}

impl Effect {
    pub fn send_frame(session: SessionId, frame: ClientFrame) -> Self {
        Effect::SendFrame { session, frame }
    }
}
