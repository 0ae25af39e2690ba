//! WebSocket transport

use super::traits::{Connection, Connector, FrameSink, TransportError};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects with `tokio-tungstenite`; `wss://` endpoints go over rustls
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let (socket, response) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(endpoint = %endpoint, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = socket.split();
        let frames = stream
            .filter_map(|message| async move {
                match message {
                    Ok(WsMessage::Text(text)) => Some(Ok(text)),
                    Ok(WsMessage::Binary(bytes)) => {
                        tracing::debug!(len = bytes.len(), "Ignoring binary frame");
                        None
                    }
                    // Pings are answered by tungstenite; close ends the stream
                    Ok(_) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => None,
                    Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
                }
            })
            .boxed();

        let sink: Box<dyn FrameSink> = Box::new(WsSink { inner: sink });
        Ok((sink, frames))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(WsMessage::Text(text))
            .await
            .map_err(write_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await.map_err(write_error) {
            Err(TransportError::Closed) => Ok(()),
            other => other,
        }
    }
}

fn write_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        e => TransportError::Send(e.to_string()),
    }
}
