//! Per-connection protocol state machine.
//!
//! Each accepted socket runs `run_connection` on its own task:
//! Connecting → Open → Closing → Closed. Reattachment and the
//! handshake happen at the Open transition; the steady state is a
//! strictly sequential read → dispatch → reply loop. Malformed text
//! and unknown commands stay inside the loop as dropped frames or
//! error responses; transport faults, binary corruption, handler
//! failures, and cancellation all funnel into the same teardown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tether_core::envelope::error_payload;
use tether_core::{
    CommandError, ConnectionId, Principal, RequestEnvelope, ResponseEnvelope, WireError,
};

use crate::codec;
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::router::{CommandRouter, RequestScope};
use crate::transport::{FrameKind, MessageSink, MessageSource, SharedSink};

/// Connection parameters resolved from the upgrade request's query
/// string.
#[derive(Clone, Debug, Default)]
pub struct ConnectParams {
    /// Opaque reattachment token; resolves to an existing session.
    pub connection_token: Option<String>,
    /// Presence-only flag: readable Text/JSON instead of gzip Binary.
    pub debug: bool,
}

/// Why the loop left the Open state.
enum CloseReason {
    Remote,
    Cancelled,
    Wire(WireError),
    Handler(CommandError),
}

impl From<WireError> for CloseReason {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Closed => Self::Remote,
            WireError::Cancelled => Self::Cancelled,
            other => Self::Wire(other),
        }
    }
}

impl From<CommandError> for CloseReason {
    fn from(e: CommandError) -> Self {
        Self::Handler(e)
    }
}

/// Result of accumulating one logical message.
enum Inbound {
    Message { data: Vec<u8>, kind: FrameKind },
    Closed,
}

/// Drive one connection from accept to teardown.
pub async fn run_connection(
    mut source: Box<dyn MessageSource>,
    sink: Box<dyn MessageSink>,
    params: ConnectParams,
    principal: Option<Principal>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<CommandRouter>,
    shutdown: CancellationToken,
) {
    // Connecting → Open
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
    let state = establish(&registry, &params, principal, Arc::clone(&sink));
    let connection_id = state.id().clone();
    tracing::info!(
        connection_id = %connection_id,
        debug = state.debug_mode(),
        reattached = params.connection_token.is_some(),
        "connection open"
    );

    let reason = drive(source.as_mut(), &state, &registry, &router, &shutdown).await;

    // Closing → Closed. A reattachment may have replaced this loop's
    // socket on the shared state while the loop was draining; the
    // session then belongs to the newer socket, and only this loop's
    // superseded handle gets closed.
    if state.owns_sink(&sink) {
        registry.remove(&connection_id);
        state.close_socket().await;
    } else {
        tracing::info!(connection_id = %connection_id, "socket superseded, session kept");
        let mut superseded = sink.lock().await;
        if let Err(e) = superseded.close().await {
            tracing::debug!(connection_id = %connection_id, error = %e, "close handshake failed");
        }
    }

    match reason {
        CloseReason::Remote => {
            tracing::info!(connection_id = %connection_id, "connection closed by peer")
        }
        CloseReason::Cancelled => {
            tracing::info!(connection_id = %connection_id, "connection cancelled")
        }
        CloseReason::Wire(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "connection failed")
        }
        CloseReason::Handler(e) => {
            tracing::error!(connection_id = %connection_id, error = %e, "handler failure ended connection")
        }
    }
}

/// Resolve the session identity: reattach when the token is known and
/// still valid, otherwise start fresh.
fn establish(
    registry: &ConnectionRegistry,
    params: &ConnectParams,
    principal: Option<Principal>,
    sink: SharedSink,
) -> Arc<ConnectionState> {
    if let Some(token) = &params.connection_token {
        let id = ConnectionId::from_raw(token.clone());
        if let Some(state) = registry.attach(&id, Arc::clone(&sink), params.debug, principal) {
            return state;
        }
        tracing::debug!(token = %id, "reattachment token unknown or expired, registering fresh");
    }
    registry.add_fresh(sink, params.debug)
}

/// Open state: handshake, then the steady read/dispatch loop.
async fn drive(
    source: &mut dyn MessageSource,
    state: &Arc<ConnectionState>,
    registry: &Arc<ConnectionRegistry>,
    router: &CommandRouter,
    shutdown: &CancellationToken,
) -> CloseReason {
    // The client waits for this frame before issuing commands; it must
    // precede all other traffic.
    let hello = ResponseEnvelope::notification(
        state.id().clone(),
        serde_json::json!({ "type": "connected", "connectionId": state.id() }),
    );
    if let Err(e) = state.send(&hello).await {
        return e.into();
    }

    loop {
        let inbound = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return CloseReason::Cancelled,
            read = read_message(source, registry.buffer_size()) => read,
        };
        let (data, kind) = match inbound {
            Ok(Inbound::Message { data, kind }) => (data, kind),
            Ok(Inbound::Closed) => return CloseReason::Remote,
            Err(e) => return e.into(),
        };
        if let Err(reason) = handle_message(state, registry, router, data, kind).await {
            return reason;
        }
    }
}

/// Accumulate one logical message. The buffer lives for exactly one
/// message, bounding memory per connection.
async fn read_message(
    source: &mut dyn MessageSource,
    buffer_size: usize,
) -> Result<Inbound, WireError> {
    let mut chunk_buf = vec![0u8; buffer_size.max(1)];
    let mut message: Vec<u8> = Vec::new();
    let mut kind: Option<FrameKind> = None;
    loop {
        let chunk = source.next_chunk(&mut chunk_buf).await?;
        if chunk.kind == FrameKind::Close {
            return Ok(Inbound::Closed);
        }
        let kind = *kind.get_or_insert(chunk.kind);
        message.extend_from_slice(&chunk_buf[..chunk.len]);
        if chunk.end_of_message {
            return Ok(Inbound::Message {
                data: message,
                kind,
            });
        }
    }
}

/// Process one complete inbound message in the Open state.
///
/// Ok(()) keeps the loop alive; Err carries the close reason. The
/// text/binary asymmetry is deliberate: unparseable text is dropped as
/// noise, a corrupt binary frame ends the session.
async fn handle_message(
    state: &Arc<ConnectionState>,
    registry: &Arc<ConnectionRegistry>,
    router: &CommandRouter,
    data: Vec<u8>,
    kind: FrameKind,
) -> Result<(), CloseReason> {
    let request = match kind {
        FrameKind::Text => {
            // Raw keepalive probe, allowed before any structured
            // traffic; answered without touching the router.
            if data == b"ping" {
                state.send_literal("pong").await.map_err(CloseReason::from)?;
                return Ok(());
            }
            match serde_json::from_slice::<RequestEnvelope>(&data) {
                Ok(request) => request,
                Err(e) => {
                    tracing::debug!(
                        connection_id = %state.id(),
                        error = %e,
                        "dropping unparseable text frame"
                    );
                    return Ok(());
                }
            }
        }
        FrameKind::Binary => codec::decompress(&data).map_err(CloseReason::from)?,
        other => {
            let envelope = ResponseEnvelope::notification(
                state.id().clone(),
                error_payload(format!("Unsupported message type {other}"), None),
            );
            state.send(&envelope).await.map_err(CloseReason::from)?;
            return Ok(());
        }
    };

    // Keepalive may also arrive through the structured envelope.
    if request.action == "ping" {
        state.send_literal("pong").await.map_err(CloseReason::from)?;
        return Ok(());
    }

    let scope = RequestScope {
        connection_id: state.id().clone(),
        request_id: request.id.clone(),
        principal: state.principal(),
        registry: Arc::clone(registry),
    };
    match router.dispatch(&scope, &request).await {
        Ok(Some(payload)) => {
            let envelope = ResponseEnvelope::reply(state.id().clone(), request.id, payload);
            state.send(&envelope).await.map_err(CloseReason::from)
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
