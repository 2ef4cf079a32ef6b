//! Registry of live connections.
//!
//! One `ConnectionState` per logical session, keyed by a stable
//! `ConnectionId` that survives socket replacement. Mutations and
//! deliveries arrive concurrently from connection loops and background
//! producers, so the map is a `DashMap` and every send goes through
//! the per-connection sink lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use tether_core::{ConnectionId, Principal, ResponseEnvelope, WireError};

use crate::codec;
use crate::transport::SharedSink;

/// Per-target broadcast send deadline.
const BROADCAST_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// One logical client session, independent of any single physical
/// socket. The sink slot is `None` only in the window between token
/// exchange and the first attach.
pub struct ConnectionState {
    id: ConnectionId,
    sink: RwLock<Option<SharedSink>>,
    auth_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    principal: RwLock<Option<Principal>>,
    debug_mode: AtomicBool,
    open: AtomicBool,
    cancel: CancellationToken,
    buffer_size: usize,
}

impl ConnectionState {
    fn fresh(
        id: ConnectionId,
        sink: SharedSink,
        debug_mode: bool,
        buffer_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            sink: RwLock::new(Some(sink)),
            auth_token: None,
            expires_at: None,
            principal: RwLock::new(None),
            debug_mode: AtomicBool::new(debug_mode),
            open: AtomicBool::new(true),
            cancel,
            buffer_size,
        }
    }

    fn pending(
        id: ConnectionId,
        auth_token: String,
        expires_at: DateTime<Utc>,
        buffer_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            sink: RwLock::new(None),
            auth_token: Some(auth_token),
            expires_at: Some(expires_at),
            principal: RwLock::new(None),
            debug_mode: AtomicBool::new(false),
            open: AtomicBool::new(false),
            cancel,
            buffer_size,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && self.sink.read().is_some()
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Relaxed)
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn principal(&self) -> Option<Principal> {
        self.principal.read().clone()
    }

    /// True once the pre-registration window has lapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Token used to cut short in-flight sends when the connection
    /// tears down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Replace the socket wholesale. The previous handle, if any, is
    /// no longer owned by this state after this call.
    fn attach_sink(&self, sink: SharedSink, debug_mode: bool) {
        *self.sink.write() = Some(sink);
        self.debug_mode.store(debug_mode, Ordering::Relaxed);
        self.open.store(true, Ordering::Relaxed);
    }

    /// Attach the authenticated identity. First writer wins; a session
    /// carries at most one principal for its lifetime.
    fn attach_principal(&self, principal: Principal) {
        let mut slot = self.principal.write();
        if slot.is_none() {
            *slot = Some(principal);
        }
    }

    fn current_sink(&self) -> Option<SharedSink> {
        self.sink.read().clone()
    }

    /// True while this state still holds the given socket handle;
    /// false once a reattachment has replaced it. The loop that lost
    /// ownership must not tear the session down.
    pub fn owns_sink(&self, sink: &SharedSink) -> bool {
        self.sink
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, sink))
    }

    /// Send a framed envelope, compressed unless the session is in
    /// debug mode. Serialized against all other writers by the sink
    /// lock.
    pub async fn send(&self, envelope: &ResponseEnvelope) -> Result<(), WireError> {
        let sink = self.current_sink().ok_or(WireError::Closed)?;
        let mut sink = sink.lock().await;
        codec::send_framed(
            sink.as_mut(),
            envelope,
            self.buffer_size,
            !self.debug_mode(),
            &self.cancel,
        )
        .await
    }

    /// Send a literal text frame (the ping/pong path).
    pub async fn send_literal(&self, text: &str) -> Result<(), WireError> {
        let sink = self.current_sink().ok_or(WireError::Closed)?;
        let mut sink = sink.lock().await;
        codec::send_literal(sink.as_mut(), text, &self.cancel).await
    }

    /// Mark closed and attempt the graceful close handshake. Errors
    /// here are swallowed: by this point shutdown is a courtesy.
    pub async fn close_socket(&self) {
        self.open.store(false, Ordering::Relaxed);
        self.cancel.cancel();
        if let Some(sink) = self.current_sink() {
            let mut sink = sink.lock().await;
            if let Err(e) = sink.close().await {
                tracing::debug!(connection_id = %self.id, error = %e, "close handshake failed");
            }
        }
    }
}

/// Shared map of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
    buffer_size: usize,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new(buffer_size: usize, shutdown: CancellationToken) -> Self {
        Self {
            connections: DashMap::new(),
            buffer_size,
            shutdown,
        }
    }

    /// Per-send and per-read chunk bound, shared by every connection.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Insert unconditionally; last writer wins on id collision.
    pub fn add(&self, id: ConnectionId, state: Arc<ConnectionState>) {
        self.connections.insert(id, state);
    }

    /// Register a brand-new session around an accepted socket.
    pub fn add_fresh(&self, sink: SharedSink, debug_mode: bool) -> Arc<ConnectionState> {
        let id = ConnectionId::new();
        let state = Arc::new(ConnectionState::fresh(
            id.clone(),
            sink,
            debug_mode,
            self.buffer_size,
            self.shutdown.child_token(),
        ));
        self.add(id, Arc::clone(&state));
        state
    }

    /// Token-exchange path: create the session before any socket
    /// exists. The returned id doubles as the reattachment token.
    pub fn preregister(&self, auth_token: String, expires_at: DateTime<Utc>) -> ConnectionId {
        let id = ConnectionId::new();
        let state = Arc::new(ConnectionState::pending(
            id.clone(),
            auth_token,
            expires_at,
            self.buffer_size,
            self.shutdown.child_token(),
        ));
        self.add(id.clone(), state);
        id
    }

    /// Bind a new socket to an existing session, replacing any prior
    /// handle in place. Returns `None` when the id is unknown or the
    /// pre-registration has expired; the caller falls through to
    /// `add_fresh`.
    pub fn attach(
        &self,
        id: &ConnectionId,
        sink: SharedSink,
        debug_mode: bool,
        principal: Option<Principal>,
    ) -> Option<Arc<ConnectionState>> {
        let state = self.connections.get(id).map(|e| Arc::clone(e.value()))?;
        if state.is_expired(Utc::now()) {
            // A lapsed pre-registration is never claimable again;
            // drop it so the map cannot grow without bound.
            if !state.is_open() {
                self.connections.remove(id);
            }
            tracing::debug!(connection_id = %id, "reattachment token expired, entry dropped");
            return None;
        }
        state.attach_sink(sink, debug_mode);
        if let Some(principal) = principal {
            state.attach_principal(principal);
        }
        Some(state)
    }

    /// Idempotent delete.
    pub fn remove(&self, id: &ConnectionId) {
        self.connections.remove(id);
    }

    /// Drop never-claimed pre-registrations whose window has lapsed.
    /// Claimed sessions are spared regardless of their original
    /// window. Returns the number of entries removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, state| state.is_open() || !state.is_expired(now));
        before - self.connections.len()
    }

    pub fn try_get(&self, id: &ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Deliver a payload to one connection. A stale or absent target
    /// is silently dropped; that is the documented contract, not an
    /// error.
    pub async fn deliver_to(&self, id: &ConnectionId, payload: serde_json::Value) {
        let Some(state) = self.try_get(id) else {
            tracing::debug!(connection_id = %id, "delivery target not registered, dropping");
            return;
        };
        if !state.is_open() {
            tracing::debug!(connection_id = %id, "delivery target not open, dropping");
            return;
        }
        let envelope = ResponseEnvelope::notification(id.clone(), payload);
        if let Err(e) = state.send(&envelope).await {
            tracing::warn!(connection_id = %id, error = %e, "delivery failed");
        }
    }

    /// Fan a payload out to every open connection. The map is
    /// snapshotted first so no shard lock is held across an await, and
    /// the sends run concurrently with a per-target deadline: a peer
    /// that has stopped draining its socket forfeits the message
    /// instead of stalling the rest of the fan-out.
    pub async fn deliver_to_all(&self, payload: serde_json::Value) {
        let targets: Vec<Arc<ConnectionState>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let sends = targets
            .into_iter()
            .filter(|state| state.is_open())
            .map(|state| {
                let envelope = ResponseEnvelope::notification(state.id().clone(), payload.clone());
                async move {
                    match tokio::time::timeout(BROADCAST_SEND_TIMEOUT, state.send(&envelope)).await
                    {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            tracing::warn!(connection_id = %state.id(), error = %e, "broadcast delivery failed");
                            false
                        }
                        Err(_) => {
                            tracing::warn!(connection_id = %state.id(), "broadcast delivery timed out");
                            false
                        }
                    }
                }
            });
        let dropped = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|delivered| !*delivered)
            .count();
        if dropped > 0 {
            tracing::warn!(dropped, "broadcast messages dropped");
        }
    }
}
