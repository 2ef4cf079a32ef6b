//! Chunked frame transport seam.
//!
//! The protocol loop and codec speak to the socket through two small
//! traits so they can be driven by scripted transports in tests. A
//! logical message travels as one or more chunks; the last chunk of a
//! message carries the end-of-message flag. `WsSource`/`WsSink` adapt
//! the split axum WebSocket to this surface: the sink assembles chunks
//! into one WebSocket message, the source doles a received message out
//! in caller-buffer-sized pieces.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use tether_core::WireError;

/// Kind of a WebSocket frame as seen by the protocol loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Close,
    /// Anything the loop has no business interpreting.
    Other(&'static str),
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("Text"),
            Self::Binary => f.write_str("Binary"),
            Self::Close => f.write_str("Close"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// One physical read: how many bytes landed in the caller's buffer,
/// what kind of frame they belong to, and whether the logical message
/// is complete.
#[derive(Clone, Copy, Debug)]
pub struct Chunk {
    pub len: usize,
    pub kind: FrameKind,
    pub end_of_message: bool,
}

/// Write half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Queue one chunk; `end_of_message` flushes the logical message.
    async fn send_chunk(
        &mut self,
        data: &[u8],
        kind: FrameKind,
        end_of_message: bool,
    ) -> Result<(), WireError>;

    /// Graceful close handshake.
    async fn close(&mut self) -> Result<(), WireError>;
}

/// Read half of a connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next chunk, copying at most `buf.len()` bytes.
    async fn next_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk, WireError>;
}

/// A sink shared between the owning protocol loop and background
/// producers. The mutex is the per-connection send lock that keeps
/// concurrent writers from interleaving frames.
pub type SharedSink = Arc<Mutex<Box<dyn MessageSink>>>;

/// Split an accepted WebSocket into the transport halves.
pub fn split_socket(socket: WebSocket) -> (WsSource, WsSink) {
    let (tx, rx) = socket.split();
    (
        WsSource {
            inner: rx,
            pending: None,
        },
        WsSink {
            inner: tx,
            pending: Vec::new(),
            pending_kind: None,
        },
    )
}

/// Write adapter: accumulates chunks and emits one WebSocket message
/// per end-of-message flag.
pub struct WsSink {
    inner: SplitSink<WebSocket, WsMessage>,
    pending: Vec<u8>,
    pending_kind: Option<FrameKind>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_chunk(
        &mut self,
        data: &[u8],
        kind: FrameKind,
        end_of_message: bool,
    ) -> Result<(), WireError> {
        if let Some(started) = self.pending_kind {
            if started != kind {
                return Err(WireError::Transport(format!(
                    "frame kind changed mid-message: {started} -> {kind}"
                )));
            }
        }
        self.pending_kind = Some(kind);
        self.pending.extend_from_slice(data);

        if !end_of_message {
            return Ok(());
        }

        let bytes = std::mem::take(&mut self.pending);
        self.pending_kind = None;
        let msg = match kind {
            FrameKind::Text => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| WireError::Transport(format!("non-utf8 text frame: {e}")))?;
                WsMessage::Text(text.into())
            }
            FrameKind::Binary => WsMessage::Binary(bytes.into()),
            FrameKind::Close => WsMessage::Close(None),
            FrameKind::Other(name) => {
                return Err(WireError::Transport(format!("cannot send {name} frame")))
            }
        };
        self.inner.send(msg).await.map_err(|_| WireError::Closed)
    }

    async fn close(&mut self) -> Result<(), WireError> {
        self.inner
            .send(WsMessage::Close(None))
            .await
            .map_err(|_| WireError::Closed)
    }
}

struct PendingRead {
    data: Vec<u8>,
    kind: FrameKind,
    offset: usize,
}

/// Read adapter: surfaces each received WebSocket message as a run of
/// chunks. Control frames are consumed here (the host answers pings);
/// a close frame or stream end becomes a zero-length `Close` chunk.
pub struct WsSource {
    inner: SplitStream<WebSocket>,
    pending: Option<PendingRead>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn next_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk, WireError> {
        if self.pending.is_none() {
            loop {
                match self.inner.next().await {
                    None => {
                        return Ok(Chunk {
                            len: 0,
                            kind: FrameKind::Close,
                            end_of_message: true,
                        })
                    }
                    Some(Err(e)) => return Err(WireError::Transport(e.to_string())),
                    Some(Ok(WsMessage::Text(text))) => {
                        self.pending = Some(PendingRead {
                            data: text.as_bytes().to_vec(),
                            kind: FrameKind::Text,
                            offset: 0,
                        });
                        break;
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        self.pending = Some(PendingRead {
                            data: bytes.to_vec(),
                            kind: FrameKind::Binary,
                            offset: 0,
                        });
                        break;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        return Ok(Chunk {
                            len: 0,
                            kind: FrameKind::Close,
                            end_of_message: true,
                        })
                    }
                    // axum answers pings itself; pongs are noise here.
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                }
            }
        }

        let pending = self.pending.as_mut().unwrap_or_else(|| unreachable!());
        let n = buf.len().min(pending.data.len() - pending.offset);
        buf[..n].copy_from_slice(&pending.data[pending.offset..pending.offset + n]);
        pending.offset += n;
        let kind = pending.kind;
        let end_of_message = pending.offset >= pending.data.len();
        if end_of_message {
            self.pending = None;
        }
        Ok(Chunk {
            len: n,
            kind,
            end_of_message,
        })
    }
}
