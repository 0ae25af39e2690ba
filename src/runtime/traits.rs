//! Transport abstractions for the runtime
//!
//! These traits let the executor run against a real socket or a scripted
//! peer in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Inbound text frames; the stream ends when the socket closes
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Both halves of an established connection
pub type Connection = (Box<dyn FrameSink>, FrameStream);

/// Opens connections to the peer
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError>;
}

/// Write half of a connection; owned only by the runtime loop
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Start the closing handshake
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("failed to receive frame: {0}")]
    Receive(String),
    #[error("connection is closed")]
    Closed,
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        (**self).connect(endpoint).await
    }
}
