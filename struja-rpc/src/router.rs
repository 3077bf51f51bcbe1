//! Action routing
//!
//! Maps inbound call actions to the handler registered by the session's
//! role. Every dispatch produces either a result payload or a well-formed
//! wire error: an unregistered action answers NotImplemented, a handler
//! rejecting its payload answers FormatViolation, and any other handler
//! fault (including a panic) answers InternalError. The peer never sees
//! a crash artifact.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::frame::WireError;

/// Fault reported by an action handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not parse as the action's request record.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The handler itself failed.
    #[error("{0}")]
    Internal(String),
}

/// One handler per (role, action) pair: parsed payload in, result
/// payload or fault out. Registries build these into a map at
/// construction time.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn invoke(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// What a role can do: which actions it issues to its peer, which it
/// answers, and how.
#[async_trait]
pub trait RoleRegistry: Send + Sync + 'static {
    /// Role name for logs ("charge-point" / "central-system").
    fn role(&self) -> &'static str;

    /// Whether this role may issue `action` to its peer.
    fn issues(&self, action: &str) -> bool;

    /// Whether this role answers `action` when called by its peer.
    fn receives(&self, action: &str) -> bool;

    /// Run the handler registered for `action`.
    async fn handle(&self, action: &str, payload: Value) -> Result<Value, HandlerError>;
}

/// Dispatch front of a role registry.
#[derive(Clone)]
pub struct Router {
    registry: Arc<dyn RoleRegistry>,
}

impl Router {
    pub fn new(registry: Arc<dyn RoleRegistry>) -> Self {
        Self { registry }
    }

    pub fn role(&self) -> &'static str {
        self.registry.role()
    }

    pub fn can_issue(&self, action: &str) -> bool {
        self.registry.issues(action)
    }

    /// Route an inbound call to its handler.
    pub async fn dispatch(&self, action: &str, payload: Value) -> Result<Value, WireError> {
        if !self.registry.receives(action) {
            debug!(action, role = self.registry.role(), "no handler for action");
            return Err(WireError::not_implemented(action));
        }

        let fut = self.registry.handle(action, payload);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(HandlerError::Payload(e))) => {
                debug!(action, error = %e, "handler rejected payload");
                Err(WireError::format_violation(e.to_string()))
            }
            Ok(Err(HandlerError::Internal(msg))) => {
                error!(action, error = %msg, "handler failed");
                Err(WireError::internal(msg))
            }
            Err(_) => {
                error!(action, "handler panicked");
                Err(WireError::internal(format!("handler for {} panicked", action)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ErrorCode;

    struct EchoRole;

    #[async_trait]
    impl RoleRegistry for EchoRole {
        fn role(&self) -> &'static str {
            "echo"
        }

        fn issues(&self, _action: &str) -> bool {
            true
        }

        fn receives(&self, action: &str) -> bool {
            matches!(action, "Echo" | "Fail" | "Boom" | "Strict")
        }

        async fn handle(&self, action: &str, payload: Value) -> Result<Value, HandlerError> {
            match action {
                "Echo" => Ok(payload),
                "Fail" => Err(HandlerError::Internal("broken".into())),
                "Boom" => panic!("handler exploded"),
                "Strict" => {
                    #[derive(serde::Deserialize)]
                    struct Req {
                        #[allow(dead_code)]
                        required: String,
                    }
                    let _req: Req = serde_json::from_value(payload)?;
                    Ok(serde_json::json!({}))
                }
                _ => Err(HandlerError::Internal("unreachable".into())),
            }
        }
    }

    fn router() -> Router {
        Router::new(Arc::new(EchoRole))
    }

    #[tokio::test]
    async fn test_dispatch_known_action() {
        let out = router()
            .dispatch("Echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(out["x"], 1);
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_implemented() {
        let err = router()
            .dispatch("UnknownAction", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_bad_payload_is_format_violation() {
        let err = router()
            .dispatch("Strict", serde_json::json!({"wrong": true}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FormatViolation);
    }

    #[tokio::test]
    async fn test_handler_fault_is_internal_error() {
        let err = router()
            .dispatch("Fail", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.description, "broken");
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let err = router()
            .dispatch("Boom", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
    }
}
