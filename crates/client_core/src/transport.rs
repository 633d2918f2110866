//! Persistent channel primitive used by the connection manager.

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame as received.
    Frame(String),
    /// The peer closed the channel cleanly.
    Closed,
    /// The channel broke.
    Failed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn TransportConnection>, TransportError>;
}

#[async_trait]
pub trait TransportConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Waits for the next inbound event. Must be cancel-safe: it is polled
    /// inside `select!` next to outbound commands.
    async fn next_event(&mut self) -> TransportEvent;

    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

struct WebSocketConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<Box<dyn TransportConnection>, TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;
        let (sink, stream) = ws_stream.split();
        Ok(Box::new(WebSocketConnection { sink, stream }))
    }
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::SendFailed(err.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Frame(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return TransportEvent::Frame(text),
                    Err(_) => warn!("ignoring non utf-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by peer");
                    return TransportEvent::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return TransportEvent::Failed(err.to_string()),
                None => return TransportEvent::Closed,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.sink.close().await {
            debug!(error = %err, "websocket close handshake failed");
        }
    }
}
