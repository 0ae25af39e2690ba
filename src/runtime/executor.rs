//! Session runtime executor

use super::traits::{Connector, FrameSink, TransportError};
use super::{RuntimeMessage, SessionUpdate};

use crate::protocol::ServerEvent;
use crate::state_machine::{transition, ChatContext, ChatState, Effect, Event, SessionId};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// The one connection handle; `sink` is `None` until the handshake completes
struct ActiveConnection {
    session: SessionId,
    sink: Option<Box<dyn FrameSink>>,
    /// Stops the connect/read task of this session
    cancel: CancellationToken,
}

/// Runs the controller against any [`Connector`]
pub struct SessionRuntime<C>
where
    C: Connector + 'static,
{
    context: ChatContext,
    state: ChatState,
    connector: Arc<C>,
    endpoint: String,
    connect_timeout: Duration,
    write_timeout: Duration,
    inbox_rx: mpsc::Receiver<RuntimeMessage>,
    /// Weak, as are the copies held by connection tasks, so the loop ends
    /// once every handle is gone
    inbox_tx: mpsc::WeakSender<RuntimeMessage>,
    updates_tx: broadcast::Sender<SessionUpdate>,
    connection: Option<ActiveConnection>,
}

impl<C> SessionRuntime<C>
where
    C: Connector + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        context: ChatContext,
        state: ChatState,
        connector: C,
        endpoint: String,
        connect_timeout: Duration,
        write_timeout: Duration,
        inbox_rx: mpsc::Receiver<RuntimeMessage>,
        inbox_tx: mpsc::WeakSender<RuntimeMessage>,
        updates_tx: broadcast::Sender<SessionUpdate>,
    ) -> Self {
        Self {
            context,
            state,
            connector: Arc::new(connector),
            endpoint,
            connect_timeout,
            write_timeout,
            inbox_rx,
            inbox_tx,
            updates_tx,
            connection: None,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(endpoint = %self.endpoint, "Starting session runtime");

        while let Some(message) = self.inbox_rx.recv().await {
            match message {
                RuntimeMessage::Event(event) => self.process_event(event).await,
                RuntimeMessage::Opened { session, sink } => self.handle_opened(session, sink).await,
            }
        }

        // Torn down: nothing may keep a socket open behind us
        if let Some(connection) = self.connection.take() {
            close_connection(connection, self.write_timeout);
        }
        tracing::info!("Session runtime stopped");
    }

    async fn process_event(&mut self, event: Event) {
        let mut events_to_process = vec![event];

        while let Some(current_event) = events_to_process.pop() {
            tracing::trace!(event = ?current_event, "Processing event");

            let result = match transition(&self.state, &self.context, current_event) {
                Ok(r) => r,
                Err(e) => {
                    // Rejections are user-facing (e.g. blank prompt)
                    tracing::info!(reason = %e, "Rejected user intent");
                    let _ = self.updates_tx.send(SessionUpdate::Rejected {
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            self.state = result.new_state;

            for effect in result.effects {
                if let Some(generated_event) = self.execute_effect(effect).await {
                    events_to_process.push(generated_event);
                }
            }
        }
    }

    /// A handshake finished; adopt the write half only if its session is
    /// still the one being connected
    async fn handle_opened(&mut self, session: SessionId, sink: Box<dyn FrameSink>) {
        match &mut self.connection {
            Some(connection) if connection.session == session && connection.sink.is_none() => {
                connection.sink = Some(sink);
                self.process_event(Event::Connected { session }).await;
            }
            _ => {
                tracing::debug!(session = %session, "Discarding connection of superseded session");
                spawn_close(session, sink, self.write_timeout);
            }
        }
    }

    /// Execute an effect and optionally return a generated event
    async fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::OpenConnection { session } => {
                self.open_connection(session);
                None
            }

            Effect::CloseConnection { session } => {
                if let Some(connection) = self.take_connection(session) {
                    tracing::info!(session = %session, "Closing superseded session");
                    close_connection(connection, self.write_timeout);
                }
                None
            }

            Effect::ReleaseConnection { session } => {
                if let Some(connection) = self.take_connection(session) {
                    tracing::info!(session = %session, "Session ended");
                    connection.cancel.cancel();
                }
                None
            }

            Effect::SendFrame { session, frame } => {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(session = %session, error = %e, "Failed to encode frame");
                        return None;
                    }
                };
                let Some(sink) = self
                    .connection
                    .as_mut()
                    .filter(|c| c.session == session)
                    .and_then(|c| c.sink.as_mut())
                else {
                    tracing::warn!(session = %session, "No open connection for outbound frame");
                    return None;
                };
                match tokio::time::timeout(self.write_timeout, sink.send_text(text)).await {
                    Ok(Ok(())) => {
                        tracing::debug!(session = %session, cancel = frame.is_cancel(), "Frame sent");
                        None
                    }
                    // A dead or stalled socket ends the session like a close would
                    Ok(Err(e)) => {
                        tracing::warn!(session = %session, error = %e, "Send failed");
                        Some(Event::Closed { session })
                    }
                    Err(_) => {
                        tracing::warn!(
                            session = %session,
                            timeout = ?self.write_timeout,
                            "Send timed out, peer is not reading"
                        );
                        Some(Event::Closed { session })
                    }
                }
            }

            Effect::PublishTranscript => {
                let _ = self
                    .updates_tx
                    .send(SessionUpdate::Transcript(self.state.transcript.clone()));
                None
            }

            Effect::PublishStatus => {
                let _ = self
                    .updates_tx
                    .send(SessionUpdate::Status(self.state.session.status()));
                None
            }

            Effect::NotifyTurnComplete { duration } => {
                tracing::info!(duration = ?duration, "Turn complete");
                let _ = self.updates_tx.send(SessionUpdate::TurnComplete { duration });
                None
            }
        }
    }

    fn open_connection(&mut self, session: SessionId) {
        if let Some(stale) = &self.connection {
            // Transitions close the previous session first; reaching this is a bug
            tracing::error!(session = %stale.session, "Opening a connection while another is live");
        }

        let cancel = CancellationToken::new();
        self.connection = Some(ActiveConnection {
            session,
            sink: None,
            cancel: cancel.clone(),
        });

        tracing::info!(session = %session, endpoint = %self.endpoint, "Connecting");
        tokio::spawn(drive_connection(
            self.connector.clone(),
            self.endpoint.clone(),
            self.connect_timeout,
            session,
            cancel,
            self.inbox_tx.clone(),
        ));
    }

    fn take_connection(&mut self, session: SessionId) -> Option<ActiveConnection> {
        if self.connection.as_ref().is_some_and(|c| c.session == session) {
            self.connection.take()
        } else {
            None
        }
    }
}

/// Stop the reader and start the closing handshake without waiting for it
fn close_connection(connection: ActiveConnection, timeout: Duration) {
    connection.cancel.cancel();
    if let Some(sink) = connection.sink {
        spawn_close(connection.session, sink, timeout);
    }
}

/// Close in the background, giving up after `timeout`
fn spawn_close(session: SessionId, mut sink: Box<dyn FrameSink>, timeout: Duration) {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(session = %session, error = %e, "Close failed"),
            Err(_) => tracing::warn!(session = %session, "Close timed out, dropping socket"),
        }
    });
}

/// Connect, hand the write half to the runtime, then forward inbound frames
/// until the socket closes or the session is superseded
async fn drive_connection<C: Connector>(
    connector: Arc<C>,
    endpoint: String,
    connect_timeout: Duration,
    session: SessionId,
    cancel: CancellationToken,
    inbox: mpsc::WeakSender<RuntimeMessage>,
) {
    let connected = tokio::select! {
        biased;

        () = cancel.cancelled() => {
            tracing::debug!(session = %session, "Connect abandoned");
            return;
        }

        result = tokio::time::timeout(connect_timeout, connector.connect(&endpoint)) => {
            result.unwrap_or_else(|_| Err(TransportError::ConnectTimeout(connect_timeout)))
        }
    };

    let (sink, mut frames) = match connected {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(session = %session, error = %e, "Connection failed");
            let failed = Event::ConnectFailed {
                session,
                reason: e.to_string(),
            };
            forward(&inbox, RuntimeMessage::Event(failed)).await;
            return;
        }
    };

    tracing::info!(session = %session, "Connection established");
    if !forward(&inbox, RuntimeMessage::Opened { session, sink }).await {
        return;
    }

    loop {
        let next = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!(session = %session, "Reader stopped");
                return;
            }

            next = frames.next() => next,
        };

        match next {
            Some(Ok(text)) => match ServerEvent::decode(&text) {
                Ok(ServerEvent::Unknown) => {
                    tracing::debug!(session = %session, frame = %text, "Ignoring frame of unknown type");
                }
                Ok(event) => {
                    let message = RuntimeMessage::Event(Event::Frame { session, event });
                    if !forward(&inbox, message).await {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %session, error = %e, "Ignoring malformed frame");
                }
            },
            Some(Err(e)) => {
                tracing::warn!(session = %session, error = %e, "Connection error");
                break;
            }
            None => break,
        }
    }

    tracing::info!(session = %session, "Connection closed by peer");
    forward(&inbox, RuntimeMessage::Event(Event::Closed { session })).await;
}

/// Deliver to the runtime loop; false once the runtime is gone
async fn forward(inbox: &mpsc::WeakSender<RuntimeMessage>, message: RuntimeMessage) -> bool {
    match inbox.upgrade() {
        Some(tx) => tx.send(message).await.is_ok(),
        None => false,
    }
}
