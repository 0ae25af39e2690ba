//! Mock transport for testing
//!
//! The mock connector hands every connection to the test as a [`MockPeer`],
//! which plays the server side of the protocol over in-memory channels.

use super::traits::*;
use super::{start, SessionHandle, SessionUpdate};
use crate::config::ChatConfig;
use crate::protocol::Message;
use crate::state_machine::SessionStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// Mock Peer
// ============================================================================

/// What the client wrote on a mock socket
#[derive(Debug, Clone, PartialEq)]
pub enum ClientWrite {
    Text(String),
    Close,
}

/// Server side of one mock connection
pub struct MockPeer {
    pub endpoint: String,
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    from_client: mpsc::UnboundedReceiver<ClientWrite>,
    stalled: Arc<AtomicBool>,
}

impl MockPeer {
    /// Push a raw text frame to the client; false once the client stopped reading
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(text.into())).is_ok())
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_raw(value.to_string())
    }

    pub fn send_token(&self, token: &str) -> bool {
        self.send_json(&serde_json::json!({ "type": "token", "token": token }))
    }

    pub fn send_done(&self) -> bool {
        self.send_json(&serde_json::json!({ "type": "done", "duration": 0.25 }))
    }

    pub fn send_error(&self, message: &str) -> bool {
        self.send_json(&serde_json::json!({ "type": "error", "message": message }))
    }

    /// Fail the read side of the connection
    pub fn fail(&self, reason: &str) -> bool {
        self.to_client.as_ref().is_some_and(|tx| {
            tx.send(Err(TransportError::Receive(reason.to_string())))
                .is_ok()
        })
    }

    /// Stop reading; client writes and closes never complete from now on
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Hang up; the client sees its frame stream end
    pub fn close(&mut self) {
        self.to_client = None;
    }

    /// Next thing the client wrote, `None` once the client dropped its sink
    pub async fn recv(&mut self, timeout: Duration) -> Option<ClientWrite> {
        tokio::time::timeout(timeout, self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next text frame the client wrote, parsed as JSON
    pub async fn recv_json(&mut self, timeout: Duration) -> Option<Value> {
        match self.recv(timeout).await? {
            ClientWrite::Text(text) => serde_json::from_str(&text).ok(),
            ClientWrite::Close => None,
        }
    }

    /// Whatever the client has already written, without waiting
    pub fn try_recv(&mut self) -> Option<ClientWrite> {
        self.from_client.try_recv().ok()
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<ClientWrite>,
    stalled: Arc<AtomicBool>,
}

impl MockSink {
    async fn write(&self, write: ClientWrite) -> Result<(), TransportError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.tx.send(write).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write(ClientWrite::Text(text)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.write(ClientWrite::Close).await
    }
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Connector whose connections are handed to the test as [`MockPeer`]s
pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    /// Errors returned by upcoming connects, in order
    failures: Mutex<VecDeque<TransportError>>,
    /// Connects that never complete
    hang: AtomicBool,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            failures: Mutex::new(VecDeque::new()),
            hang: AtomicBool::new(false),
        };
        (connector, peer_rx)
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn hang_connects(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let stalled = Arc::new(AtomicBool::new(false));
        let peer = MockPeer {
            endpoint: endpoint.to_string(),
            to_client: Some(to_client),
            from_client,
            stalled: stalled.clone(),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("test dropped the peer queue".to_string()))?;

        let frames: FrameStream = Box::pin(futures::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));
        let sink: Box<dyn FrameSink> = Box::new(MockSink {
            tx: client_tx,
            stalled,
        });
        Ok((sink, frames))
    }
}

// ============================================================================
// Test Runtime Builder
// ============================================================================

pub const WAIT: Duration = Duration::from_secs(2);

/// A started runtime wired to a [`MockConnector`]
pub struct TestRuntime {
    pub handle: SessionHandle,
    pub connector: Arc<MockConnector>,
    pub updates: broadcast::Receiver<SessionUpdate>,
    peers: mpsc::UnboundedReceiver<MockPeer>,
    /// Last transcript seen on the update channel
    pub transcript: Vec<Message>,
}

impl TestRuntime {
    pub fn start() -> Self {
        Self::start_with(&ChatConfig::default())
    }

    pub fn start_with(config: &ChatConfig) -> Self {
        let (connector, peers) = MockConnector::new();
        let connector = Arc::new(connector);
        let handle = start(config, connector.clone());
        let updates = handle.subscribe();
        Self {
            handle,
            connector,
            updates,
            peers,
            transcript: Vec::new(),
        }
    }

    pub async fn next_peer(&mut self) -> MockPeer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Whether a connection was attempted within `timeout`
    pub async fn peer_within(&mut self, timeout: Duration) -> Option<MockPeer> {
        tokio::time::timeout(timeout, self.peers.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next update matching `pred`, tracking transcripts on the way
    pub async fn wait_for(&mut self, pred: impl Fn(&SessionUpdate) -> bool) -> Option<SessionUpdate> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.updates.recv()).await {
                Ok(Ok(update)) => {
                    if let SessionUpdate::Transcript(t) = &update {
                        self.transcript = t.messages().to_vec();
                    }
                    if pred(&update) {
                        return Some(update);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                _ => return None,
            }
        }
    }

    pub async fn wait_for_status(&mut self, status: SessionStatus) -> bool {
        self.wait_for(|u| *u == SessionUpdate::Status(status))
            .await
            .is_some()
    }

    pub async fn wait_for_transcript(&mut self, expected: &[Message]) -> bool {
        self.wait_for(|u| matches!(u, SessionUpdate::Transcript(t) if t.messages() == expected))
            .await
            .is_some()
    }

    /// Send a prompt and return the peer after it received the opening request
    pub async fn open(&mut self, prompt: &str) -> (MockPeer, Value) {
        self.handle.send(prompt).await.expect("runtime stopped");
        let mut peer = self.next_peer().await;
        let request = peer.recv_json(WAIT).await.expect("no opening request");
        (peer, request)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientFrame;
    use serde_json::json;

    fn cancel_frame() -> Value {
        serde_json::from_str(&ClientFrame::cancel().encode().unwrap()).unwrap()
    }

    /// Round trip: prompt, two tokens, done
    #[tokio::test]
    async fn test_streamed_reply() {
        let mut rt = TestRuntime::start();
        let (mut peer, request) = rt.open("Hello").await;

        assert_eq!(peer.endpoint, "ws://localhost:8000/ws/chat");
        assert_eq!(
            request,
            json!({
                "model": ["llama3"],
                "messages": [{ "role": "user", "content": "Hello" }]
            })
        );

        peer.send_token("Hi");
        peer.send_token(" there");
        peer.send_done();
        let complete = rt
            .wait_for(|u| matches!(u, SessionUpdate::TurnComplete { .. }))
            .await;
        assert_eq!(
            complete,
            Some(SessionUpdate::TurnComplete {
                duration: Some(0.25)
            })
        );
        assert_eq!(
            rt.transcript,
            vec![Message::user("Hello"), Message::assistant("Hi there")]
        );

        peer.close();
        assert!(rt.wait_for_status(SessionStatus::Idle).await);
    }

    /// Cancel after a partial reply; the peer honors it and closes
    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let mut rt = TestRuntime::start();
        let (mut peer, _) = rt.open("Tell me a story").await;

        peer.send_token("Partial");
        assert!(
            rt.wait_for_transcript(&[
                Message::user("Tell me a story"),
                Message::assistant("Partial"),
            ])
            .await
        );

        rt.handle.cancel().await.unwrap();
        assert_eq!(peer.recv_json(WAIT).await, Some(cancel_frame()));

        // Second cancel within the same session is not sent
        rt.handle.cancel().await.unwrap();

        peer.send_done();
        peer.close();
        assert!(rt.wait_for_status(SessionStatus::Idle).await);
        assert_eq!(
            rt.transcript,
            vec![
                Message::user("Tell me a story"),
                Message::assistant("Partial")
            ]
        );

        // Handle released: the client side of the socket is gone
        rt.handle.cancel().await.unwrap();
        assert_eq!(peer.recv(Duration::from_millis(200)).await, None);
    }

    /// Tokens already in flight after a cancel still land in the transcript
    #[tokio::test]
    async fn test_tokens_after_cancel_are_folded() {
        let mut rt = TestRuntime::start();
        let (mut peer, _) = rt.open("Hello").await;

        peer.send_token("a");
        assert!(
            rt.wait_for_transcript(&[Message::user("Hello"), Message::assistant("a")])
                .await
        );
        rt.handle.cancel().await.unwrap();
        assert_eq!(peer.recv_json(WAIT).await, Some(cancel_frame()));

        peer.send_token("b");
        assert!(
            rt.wait_for_transcript(&[Message::user("Hello"), Message::assistant("ab")])
                .await
        );
    }

    /// A new send closes the old socket first and ignores its late tokens
    #[tokio::test]
    async fn test_new_send_supersedes_stream() {
        let mut rt = TestRuntime::start();
        let (mut old_peer, _) = rt.open("first").await;
        old_peer.send_token("old");
        assert!(
            rt.wait_for_transcript(&[Message::user("first"), Message::assistant("old")])
                .await
        );

        rt.handle.send("second").await.unwrap();
        let mut new_peer = rt.next_peer().await;

        // The old socket is closed as the new one opens
        assert_eq!(old_peer.recv(WAIT).await, Some(ClientWrite::Close));

        let request = new_peer.recv_json(WAIT).await.unwrap();
        assert_eq!(request["messages"].as_array().map(Vec::len), Some(3));

        old_peer.send_token(" late");
        new_peer.send_token("new");
        assert!(
            rt.wait_for_transcript(&[
                Message::user("first"),
                Message::assistant("old"),
                Message::user("second"),
                Message::assistant("new"),
            ])
            .await
        );
        new_peer.send_done();
        rt.wait_for(|u| matches!(u, SessionUpdate::TurnComplete { .. }))
            .await
            .unwrap();
        assert_eq!(rt.transcript[3], Message::assistant("new"));
    }

    /// Cancel with nothing open changes nothing and writes nothing
    #[tokio::test]
    async fn test_cancel_without_session_is_silent() {
        let mut rt = TestRuntime::start();
        rt.handle.cancel().await.unwrap();

        let (mut peer, request) = rt.open("Hello").await;
        assert!(request.get("model").is_some());
        // Only the opening request went out
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test]
    async fn test_cancel_while_connecting_is_dropped() {
        let mut rt = TestRuntime::start();
        rt.connector.hang_connects(true);
        rt.handle.send("Hello").await.unwrap();
        assert!(rt.wait_for_status(SessionStatus::Connecting).await);

        rt.handle.cancel().await.unwrap();
        // Still connecting, nothing rejected
        let update = rt
            .wait_for(|u| matches!(u, SessionUpdate::Rejected { .. } | SessionUpdate::Status(_)))
            .await;
        assert_eq!(update, None);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_skipped() {
        let mut rt = TestRuntime::start();
        let (peer, _) = rt.open("Hello").await;

        peer.send_raw("{not json");
        peer.send_json(&json!({ "type": "heartbeat" }));
        peer.send_json(&json!({ "type": "token" }));
        peer.send_token("ok");
        assert!(
            rt.wait_for_transcript(&[Message::user("Hello"), Message::assistant("ok")])
                .await
        );
    }

    #[tokio::test]
    async fn test_peer_error_becomes_transcript_entry() {
        let mut rt = TestRuntime::start();
        let (mut peer, _) = rt.open("Hello").await;

        peer.send_token("Part");
        peer.send_error("model crashed");
        peer.close();

        assert!(rt.wait_for_status(SessionStatus::Idle).await);
        assert_eq!(
            rt.transcript,
            vec![
                Message::user("Hello"),
                Message::assistant("Part"),
                Message::assistant("Error: model crashed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let mut rt = TestRuntime::start();
        rt.connector
            .fail_next(TransportError::Connect("connection refused".to_string()));

        rt.handle.send("Hello").await.unwrap();
        assert!(rt.wait_for_status(SessionStatus::Idle).await);
        assert_eq!(rt.transcript, vec![Message::user("Hello")]);

        // The user can simply try again
        let (_peer, request) = rt.open("Hello?").await;
        assert_eq!(request["messages"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let config = ChatConfig {
            connect_timeout: Duration::from_millis(50),
            ..ChatConfig::default()
        };
        let mut rt = TestRuntime::start_with(&config);
        rt.connector.hang_connects(true);

        rt.handle.send("Hello").await.unwrap();
        assert!(rt.wait_for_status(SessionStatus::Connecting).await);
        assert!(rt.wait_for_status(SessionStatus::Idle).await);
    }

    #[tokio::test]
    async fn test_read_error_ends_session() {
        let mut rt = TestRuntime::start();
        let (peer, _) = rt.open("Hello").await;

        peer.fail("reset by peer");
        assert!(rt.wait_for_status(SessionStatus::Idle).await);
    }

    #[tokio::test]
    async fn test_rejected_intents() {
        let mut rt = TestRuntime::start();

        rt.handle.send("   ").await.unwrap();
        let rejected = rt
            .wait_for(|u| matches!(u, SessionUpdate::Rejected { .. }))
            .await;
        assert_eq!(
            rejected,
            Some(SessionUpdate::Rejected {
                reason: "Prompt is empty".to_string()
            })
        );

        rt.handle
            .select_models(vec!["gpt-9".to_string()])
            .await
            .unwrap();
        assert!(rt
            .wait_for(|u| matches!(u, SessionUpdate::Rejected { .. }))
            .await
            .is_some());

        rt.handle.select_models(vec![]).await.unwrap();
        rt.handle.send("Hello").await.unwrap();
        let rejected = rt
            .wait_for(|u| matches!(u, SessionUpdate::Rejected { .. }))
            .await;
        assert_eq!(
            rejected,
            Some(SessionUpdate::Rejected {
                reason: "No model selected".to_string()
            })
        );
        assert!(rt.peer_within(Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn test_selected_models_are_sent() {
        let mut rt = TestRuntime::start();
        rt.handle
            .select_models(vec!["phi3".to_string(), "mistral".to_string()])
            .await
            .unwrap();

        let (_peer, request) = rt.open("Hello").await;
        assert_eq!(request["model"], json!(["phi3", "mistral"]));
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_live_socket() {
        let mut rt = TestRuntime::start();
        let (mut peer, _) = rt.open("Hello").await;
        peer.send_token("streaming");

        drop(rt.handle);
        assert_eq!(peer.recv(WAIT).await, Some(ClientWrite::Close));
    }

    /// A peer that stopped reading cannot hold up a new session
    #[tokio::test]
    async fn test_supersede_stalled_peer() {
        let mut rt = TestRuntime::start();
        let (old_peer, _) = rt.open("first").await;
        old_peer.stall();

        let (_new_peer, request) = rt.open("second").await;
        assert_eq!(request["messages"].as_array().map(Vec::len), Some(2));

        rt.handle.send("   ").await.unwrap();
        assert!(rt
            .wait_for(|u| matches!(u, SessionUpdate::Rejected { .. }))
            .await
            .is_some());
    }

    /// A cancel that cannot be written ends the session instead of hanging
    #[tokio::test]
    async fn test_cancel_to_stalled_peer_ends_session() {
        let config = ChatConfig {
            write_timeout: Duration::from_millis(50),
            ..ChatConfig::default()
        };
        let mut rt = TestRuntime::start_with(&config);
        let (peer, _) = rt.open("Hello").await;
        assert!(rt.wait_for_status(SessionStatus::Streaming).await);

        peer.stall();
        rt.handle.cancel().await.unwrap();
        assert!(rt.wait_for_status(SessionStatus::Idle).await);

        // Late frames from the released session are ignored
        peer.send_token("late");
        let (_peer, request) = rt.open("again").await;
        assert_eq!(request["messages"].as_array().map(Vec::len), Some(2));
        assert!(
            rt.wait_for_transcript(&[Message::user("Hello"), Message::user("again")])
                .await
        );
    }
}
