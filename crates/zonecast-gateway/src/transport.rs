//! Transport seam between connections and the wire.
//!
//! The connection layer talks to an abstract [`MessageSink`] so that the
//! send queue, health monitoring, and recovery logic are testable without
//! sockets. The production implementation wraps the write half of a
//! `tokio-tungstenite` `WebSocket` stream; the read half is driven by the
//! server's per-socket task through [`WsReader`].

use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Close code used when a newer connection replaces this one.
pub const CLOSE_REPLACED: u16 = 4000;
/// Close code for authentication failures.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code when the connection limit is reached.
pub const CLOSE_SERVER_FULL: u16 = 4002;
/// Normal close.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for unrecoverable server-side errors.
pub const CLOSE_ERROR: u16 = 1011;

/// The server-side `WebSocket` stream type.
pub type WsStream = WebSocketStream<TcpStream>;

/// Write half of a duplex client transport.
///
/// One text frame per message. Implementations must be safe to share
/// between the queue-drain task and direct-send fallbacks.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send one text frame.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Send a close frame with a code and reason.
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// [`MessageSink`] over the write half of a `WebSocket` stream.
pub struct WsSink {
    writer: Mutex<SplitSink<WsStream, Message>>,
}

impl WsSink {
    /// Wrap a split write half.
    #[must_use]
    pub fn new(writer: SplitSink<WsStream, Message>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        };
        let mut writer = self.writer.lock().await;
        writer.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}

/// One inbound frame from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A text frame.
    Text(String),
    /// The peer closed the stream, with the close code if one was sent.
    Closed(Option<u16>),
}

/// Read half of a server-side `WebSocket` stream.
pub struct WsReader {
    reader: SplitStream<WsStream>,
}

impl WsReader {
    /// Wrap a split read half.
    #[must_use]
    pub fn new(reader: SplitStream<WsStream>) -> Self {
        Self { reader }
    }

    /// Receive the next text frame.
    ///
    /// Protocol ping/pong and binary frames are skipped; a close frame or
    /// end of stream yields [`InboundFrame::Closed`].
    pub async fn next_frame(&mut self) -> Result<InboundFrame, TransportError> {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(InboundFrame::Text(text.to_string()));
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| f.code.into());
                    return Ok(InboundFrame::Closed(code));
                },
                Some(Ok(
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_),
                )) => {
                    // Protocol-level frames handled by tungstenite.
                },
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(InboundFrame::Closed(None)),
            }
        }
    }
}

/// Split an accepted `WebSocket` stream into the sink/reader pair.
#[must_use]
pub fn split(ws: WsStream) -> (WsSink, WsReader) {
    let (writer, reader) = ws.split();
    (WsSink::new(writer), WsReader::new(reader))
}
