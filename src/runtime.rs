//! Runtime that owns the socket and drives the session controller
//!
//! All intents and connection events funnel through one channel into a single
//! loop, so events from one connection are handled in the order the peer sent
//! them and never concurrently.

mod executor;
pub mod traits;
mod websocket;

#[cfg(test)]
pub mod testing;

pub use executor::SessionRuntime;
pub use traits::*;
pub use websocket::WsConnector;

use crate::config::ChatConfig;
use crate::state_machine::{ChatState, Event, SessionId, SessionStatus};
use crate::transcript::Transcript;
use std::fmt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

const INBOX_CAPACITY: usize = 64;
const UPDATE_CAPACITY: usize = 256;

/// Updates pushed to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// The full transcript after a change
    Transcript(Transcript),
    Status(SessionStatus),
    /// The peer finished a turn
    TurnComplete { duration: Option<f64> },
    /// A user intent was refused
    Rejected { reason: String },
}

/// Messages consumed by the runtime loop
pub(crate) enum RuntimeMessage {
    Event(Event),
    /// A connection task finished the handshake and hands over its write half
    Opened {
        session: SessionId,
        sink: Box<dyn FrameSink>,
    },
}

impl fmt::Debug for RuntimeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeMessage::Event(event) => f.debug_tuple("Event").field(event).finish(),
            RuntimeMessage::Opened { session, .. } => {
                f.debug_struct("Opened").field("session", session).finish_non_exhaustive()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("session runtime has stopped")]
    Stopped,
}

/// Handle used by the presentation layer to issue intents and follow updates
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::Sender<RuntimeMessage>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    /// Submit a prompt; any live session is superseded
    pub async fn send(&self, text: impl Into<String>) -> Result<SessionId, RuntimeError> {
        let session = SessionId::new();
        self.dispatch(Event::UserSend {
            text: text.into(),
            session,
        })
        .await?;
        Ok(session)
    }

    /// Ask the peer to stop generating; a no-op unless a session is streaming
    pub async fn cancel(&self) -> Result<(), RuntimeError> {
        self.dispatch(Event::UserCancel).await
    }

    pub async fn select_models(&self, models: Vec<String>) -> Result<(), RuntimeError> {
        self.dispatch(Event::SelectModels { models }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    async fn dispatch(&self, event: Event) -> Result<(), RuntimeError> {
        self.inbox
            .send(RuntimeMessage::Event(event))
            .await
            .map_err(|_| RuntimeError::Stopped)
    }
}

/// Spawn a runtime for `config` on the current tokio runtime.
///
/// The runtime stops as soon as every [`SessionHandle`] is dropped; connection
/// tasks do not keep it alive. Any live socket is closed on the way out.
pub fn start<C: Connector + 'static>(config: &ChatConfig, connector: C) -> SessionHandle {
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (updates_tx, _) = broadcast::channel(UPDATE_CAPACITY);

    let runtime = SessionRuntime::new(
        config.context(),
        ChatState::new(config.initial_selection()),
        connector,
        config.endpoint_url(),
        config.connect_timeout,
        config.write_timeout,
        inbox_rx,
        inbox_tx.downgrade(),
        updates_tx.clone(),
    );

    tokio::spawn(async move {
        runtime.run().await;
    });

    SessionHandle {
        inbox: inbox_tx,
        updates: updates_tx,
    }
}
