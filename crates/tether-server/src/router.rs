//! Action-name → handler routing.
//!
//! The handler table is built explicitly at startup and immutable
//! afterwards; a missing handler is an error *payload*, never a panic,
//! so the protocol loop's control flow stays linear. Handler failures
//! are the one thing this layer does not absorb — they propagate to
//! the loop and end the session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use tether_core::envelope::error_payload;
use tether_core::{CommandError, ConnectionId, Principal, RequestEnvelope};

use crate::registry::ConnectionRegistry;

/// Everything a handler may touch for the duration of one request.
/// Built fresh per dispatch; nothing in it outlives the request, so
/// handler-local state cannot leak across invocations.
pub struct RequestScope {
    pub connection_id: ConnectionId,
    pub request_id: String,
    pub principal: Option<Principal>,
    pub registry: Arc<ConnectionRegistry>,
}

/// One unit of business logic bound to an action name.
///
/// Returning `Ok(None)` means "no reply"; the loop sends nothing.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        scope: &RequestScope,
        payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, CommandError>;
}

/// Static action table, populated once at startup.
#[derive(Default)]
pub struct CommandRouter {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action. Last registration wins.
    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    pub fn resolve(&self, action: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Resolve and invoke. An unknown action yields a synthesized
    /// error payload carrying the offending action name; handler
    /// errors pass through untouched.
    pub async fn dispatch(
        &self,
        scope: &RequestScope,
        request: &RequestEnvelope,
    ) -> Result<Option<serde_json::Value>, CommandError> {
        let Some(handler) = self.resolve(&request.action) else {
            tracing::debug!(
                connection_id = %scope.connection_id,
                action = %request.action,
                "no handler registered"
            );
            return Ok(Some(error_payload(
                "No handler found for command",
                Some(&request.action),
            )));
        };
        handler.handle(scope, request.payload.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(
            &self,
            _scope: &RequestScope,
            payload: serde_json::Value,
        ) -> Result<Option<serde_json::Value>, CommandError> {
            Ok(Some(payload))
        }
    }

    struct Silent;

    #[async_trait]
    impl CommandHandler for Silent {
        async fn handle(
            &self,
            _scope: &RequestScope,
            _payload: serde_json::Value,
        ) -> Result<Option<serde_json::Value>, CommandError> {
            Ok(None)
        }
    }

    struct Failing;

    #[async_trait]
    impl CommandHandler for Failing {
        async fn handle(
            &self,
            _scope: &RequestScope,
            _payload: serde_json::Value,
        ) -> Result<Option<serde_json::Value>, CommandError> {
            Err(CommandError::new("backend unavailable"))
        }
    }

    fn scope() -> RequestScope {
        RequestScope {
            connection_id: ConnectionId::from_raw("conn_t"),
            request_id: "r1".into(),
            principal: None,
            registry: Arc::new(ConnectionRegistry::new(64, CancellationToken::new())),
        }
    }

    fn request(action: &str) -> RequestEnvelope {
        RequestEnvelope {
            id: "r1".into(),
            action: action.into(),
            payload: serde_json::json!({"x": 1}),
        }
    }

    #[test]
    fn resolve_finds_registered_handler() {
        let mut router = CommandRouter::new();
        router.register("echo", Arc::new(Echo));
        assert!(router.resolve("echo").is_some());
        assert!(router.resolve("nope").is_none());
    }

    #[tokio::test]
    async fn dispatch_invokes_handler() {
        let mut router = CommandRouter::new();
        router.register("echo", Arc::new(Echo));
        let result = router.dispatch(&scope(), &request("echo")).await.unwrap();
        assert_eq!(result, Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn dispatch_unknown_action_returns_error_payload() {
        let router = CommandRouter::new();
        let result = router
            .dispatch(&scope(), &request("doesNotExist"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["error"], "No handler found for command");
        assert_eq!(result["action"], "doesNotExist");
    }

    #[tokio::test]
    async fn dispatch_silent_handler_yields_no_reply() {
        let mut router = CommandRouter::new();
        router.register("fire-and-forget", Arc::new(Silent));
        let result = router
            .dispatch(&scope(), &request("fire-and-forget"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn dispatch_propagates_handler_failure() {
        let mut router = CommandRouter::new();
        router.register("broken", Arc::new(Failing));
        let err = router
            .dispatch(&scope(), &request("broken"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("backend unavailable"));
    }

    #[test]
    fn register_last_wins() {
        let mut router = CommandRouter::new();
        router.register("a", Arc::new(Silent));
        router.register("a", Arc::new(Echo));
        assert_eq!(router.actions().count(), 1);
    }
}
