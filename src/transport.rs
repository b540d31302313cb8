//! Inbound transport abstraction
//!
//! The engine consumes raw text messages from an already-established
//! duplex channel; opening, authenticating, and keeping that connection
//! alive belong to the surrounding SDK.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};
use tracing::debug;

use crate::error::Result;

/// Source of raw stream messages
#[async_trait]
pub trait MessageStream: Send {
    /// Next raw text message; `Ok(None)` when the stream has ended
    async fn next_message(&mut self) -> Result<Option<String>>;
}

/// Channel-fed stream, used by tests and in-process SDK integrations
#[async_trait]
impl MessageStream for mpsc::Receiver<String> {
    async fn next_message(&mut self) -> Result<Option<String>> {
        Ok(self.recv().await)
    }
}

/// Adapter over an established WebSocket connection
///
/// Control frames are skipped; the underlying stream answers pings on
/// its own. Close frames and stream exhaustion both end the stream.
pub struct WsMessageStream<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsMessageStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> MessageStream for WsMessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_message(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8_lossy(&data).to_string()))
                }
                Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "websocket close frame received");
                    return Ok(None);
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }
}
