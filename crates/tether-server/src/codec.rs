//! Envelope serialization, gzip, and chunked framed writes.
//!
//! The wire contract: a normal session exchanges gzip-compressed
//! Binary frames, a debug session exchanges readable Text/JSON. The
//! choice is per-session, never negotiated per-message. Large payloads
//! are written in chunks no larger than the configured buffer size;
//! the final chunk carries the end-of-message flag.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;

use tether_core::{RequestEnvelope, ResponseEnvelope, WireError};

use crate::transport::{FrameKind, MessageSink};

/// Serialize a response envelope to its UTF-8 JSON wire form.
pub fn encode(envelope: &ResponseEnvelope) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Gzip a buffer. A fresh encoder per call; no dictionary state is
/// carried between messages.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Gunzip a complete binary frame and decode the request inside.
pub fn decompress(bytes: &[u8]) -> Result<RequestEnvelope, WireError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded)?;
    Ok(serde_json::from_slice(&decoded)?)
}

/// Encode (and optionally gzip) an envelope, then write it through the
/// sink in bounded chunks. Binary frame iff compressed, Text otherwise.
pub async fn send_framed(
    sink: &mut dyn MessageSink,
    envelope: &ResponseEnvelope,
    buffer_size: usize,
    compress_payload: bool,
    cancel: &CancellationToken,
) -> Result<(), WireError> {
    let encoded = encode(envelope)?;
    let (bytes, kind) = if compress_payload {
        (compress(&encoded)?, FrameKind::Binary)
    } else {
        (encoded, FrameKind::Text)
    };
    send_chunked(sink, &bytes, kind, buffer_size, cancel).await
}

/// Write raw bytes as one logical message in bounded chunks.
pub async fn send_chunked(
    sink: &mut dyn MessageSink,
    data: &[u8],
    kind: FrameKind,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<(), WireError> {
    let step = buffer_size.max(1);
    let total = data.len();
    let mut sent = 0;
    loop {
        let end = (sent + step).min(total);
        let end_of_message = end == total;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WireError::Cancelled),
            res = sink.send_chunk(&data[sent..end], kind, end_of_message) => res?,
        }
        if end_of_message {
            return Ok(());
        }
        sent = end;
    }
}

/// Literal text frame, e.g. the `"pong"` keepalive reply. Always Text
/// regardless of the session's compression mode.
pub async fn send_literal(
    sink: &mut dyn MessageSink,
    text: &str,
    cancel: &CancellationToken,
) -> Result<(), WireError> {
    send_chunked(sink, text.as_bytes(), FrameKind::Text, text.len().max(1), cancel).await
}
