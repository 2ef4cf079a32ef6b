//! Built-in command handlers.
//!
//! Deliberately thin: real deployments register their own handlers at
//! startup. These two exist so a bare server is probeable end to end.

use async_trait::async_trait;

use tether_core::CommandError;

use crate::router::{CommandHandler, RequestScope};

/// Returns its payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    async fn handle(
        &self,
        _scope: &RequestScope,
        payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, CommandError> {
        Ok(Some(payload))
    }
}

/// Reports registry statistics for the calling session.
pub struct ConnectionInfoHandler;

#[async_trait]
impl CommandHandler for ConnectionInfoHandler {
    async fn handle(
        &self,
        scope: &RequestScope,
        _payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, CommandError> {
        Ok(Some(serde_json::json!({
            "connectionId": scope.connection_id,
            "connections": scope.registry.count(),
            "authenticated": scope.principal.is_some(),
            "subject": scope.principal.as_ref().map(|p| p.subject.clone()),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use std::sync::Arc;
    use tether_core::{ConnectionId, Principal};
    use tokio_util::sync::CancellationToken;

    fn scope_with(principal: Option<Principal>) -> RequestScope {
        RequestScope {
            connection_id: ConnectionId::from_raw("conn_h"),
            request_id: "r1".into(),
            principal,
            registry: Arc::new(ConnectionRegistry::new(64, CancellationToken::new())),
        }
    }

    #[tokio::test]
    async fn echo_returns_payload_verbatim() {
        let payload = serde_json::json!({"a": [1, 2], "b": null});
        let result = EchoHandler
            .handle(&scope_with(None), payload.clone())
            .await
            .unwrap();
        assert_eq!(result, Some(payload));
    }

    #[tokio::test]
    async fn connection_info_reflects_scope() {
        let scope = scope_with(Some(Principal::new("alice")));
        let result = ConnectionInfoHandler
            .handle(&scope, serde_json::Value::Null)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["connectionId"], "conn_h");
        assert_eq!(result["connections"], 0);
        assert_eq!(result["authenticated"], true);
        assert_eq!(result["subject"], "alice");
    }

    #[tokio::test]
    async fn connection_info_anonymous() {
        let result = ConnectionInfoHandler
            .handle(&scope_with(None), serde_json::Value::Null)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["authenticated"], false);
        assert!(result["subject"].is_null());
    }
}
