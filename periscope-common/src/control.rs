//! Remote controls
//!
//! The app sends `ControlRequest`s to probes over a persistent WebSocket; a
//! probe looks up the named handler in its `ControlRegistry` and answers with
//! a `ControlResponse` carrying the same id. Unknown controls get an error
//! response, never a crash.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// RPC method name carried in the envelope
pub const HANDLE_METHOD: &str = "control.handle";

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("no handler registered for control {0}")]
    UnknownControl(String),

    #[error("probe {0} is not connected")]
    ProbeNotConnected(String),

    #[error("no app with id {0}")]
    UnknownApp(String),

    #[error("control request {0} timed out")]
    Timeout(u64),

    #[error("control connection closed before request {0} was answered")]
    Disconnected(u64),

    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Request to run a control on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u64,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub node_id: String,
    pub control: String,
}

/// Result of a control; exactly one of `value`/`error` is normally set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of a pipe opened by the control, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe: Option<String>,
    #[serde(default)]
    pub raw_tty: bool,
}

impl ControlResponse {
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn pipe(pipe_id: impl Into<String>, raw_tty: bool) -> Self {
        Self {
            pipe: Some(pipe_id.into()),
            raw_tty,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Something that can run a control
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, request: ControlRequest) -> ControlResponse;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ControlHandler for FnHandler<F>
where
    F: Fn(ControlRequest) -> ControlResponse + Send + Sync,
{
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        (self.0)(request)
    }
}

/// Named control handlers, shared by every component that registers or
/// dispatches controls
#[derive(Default)]
pub struct ControlRegistry {
    handlers: DashMap<String, Arc<dyn ControlHandler>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ControlHandler>) {
        let name = name.into();
        debug!("Registering control {}", name);
        self.handlers.insert(name, handler);
    }

    /// Register a synchronous closure as a handler
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(ControlRequest) -> ControlResponse + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)));
    }

    pub fn unregister(&self, name: &str) {
        self.handlers.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler named by `request.control`
    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let id = request.id;
        // Clone the handler out so no shard lock is held while it runs.
        let handler = self
            .handlers
            .get(&request.control)
            .map(|entry| Arc::clone(entry.value()));

        let mut response = match handler {
            Some(handler) => handler.handle(request).await,
            None => {
                warn!("Control {} not recognised", request.control);
                ControlResponse::error(ControlError::UnknownControl(request.control).to_string())
            }
        };
        response.id = id;
        response
    }

    /// Handle one RPC text frame, returning the frame to send back
    ///
    /// Returns `None` when the frame is so malformed that no request id can
    /// be recovered.
    pub async fn handle_rpc(&self, frame: &str) -> Option<RpcResponse> {
        let envelope: RpcRequest = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed control frame: {}", e);
                return None;
            }
        };

        if envelope.method != HANDLE_METHOD {
            return Some(RpcResponse::failure(
                envelope.id,
                format!("unknown method {}", envelope.method),
            ));
        }

        match serde_json::from_value::<ControlRequest>(envelope.params) {
            Ok(request) => {
                let response = self.dispatch(request).await;
                Some(RpcResponse::success(envelope.id, response))
            }
            Err(e) => Some(RpcResponse::failure(
                envelope.id,
                ControlError::Malformed(e).to_string(),
            )),
        }
    }
}

/// RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RpcRequest {
    pub fn handle(id: u64, request: &ControlRequest) -> Result<Self, ControlError> {
        Ok(Self {
            id,
            method: HANDLE_METHOD.to_string(),
            params: serde_json::to_value(request)?,
        })
    }
}

/// RPC response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ControlResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(id: u64, result: ControlResponse) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Collapse the envelope into a control response
    pub fn into_response(self) -> ControlResponse {
        match (self.result, self.error) {
            (Some(result), _) => result,
            (None, error) => {
                let mut response =
                    ControlResponse::error(error.unwrap_or_else(|| "empty response".to_string()));
                response.id = self.id;
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ControlRegistry {
        let registry = ControlRegistry::new();
        registry.register_fn("foo", |_req| ControlResponse::value("bar"));
        registry
    }

    #[tokio::test]
    async fn test_dispatch_registered_control() {
        let response = registry()
            .dispatch(ControlRequest {
                id: 1234,
                control: "foo".to_string(),
                ..Default::default()
            })
            .await;
        assert_eq!(response.id, 1234);
        assert_eq!(response.value, Some(serde_json::json!("bar")));
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_control() {
        let response = registry()
            .dispatch(ControlRequest {
                id: 3456,
                control: "baz".to_string(),
                ..Default::default()
            })
            .await;
        assert_eq!(response.id, 3456);
        assert!(response.is_error());
        assert!(response.value.is_none());
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = registry();
        assert!(registry.contains("foo"));
        registry.unregister("foo");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handler_may_register_while_running() {
        let registry = Arc::new(ControlRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register_fn("install", move |_req| {
            inner.register_fn("installed", |_req| ControlResponse::value(true));
            ControlResponse::value("ok")
        });

        let response = registry
            .dispatch(ControlRequest {
                id: 1,
                control: "install".to_string(),
                ..Default::default()
            })
            .await;
        assert!(!response.is_error());
        assert!(registry.contains("installed"));
    }

    #[tokio::test]
    async fn test_handle_rpc_frames() {
        let registry = registry();
        let request = ControlRequest {
            id: 7,
            control: "foo".to_string(),
            ..Default::default()
        };
        let frame = serde_json::to_string(&RpcRequest::handle(42, &request).expect("envelope"))
            .expect("serialize");

        let reply = registry.handle_rpc(&frame).await.expect("reply");
        assert_eq!(reply.id, 42);
        let response = reply.into_response();
        assert_eq!(response.id, 7);
        assert_eq!(response.value, Some(serde_json::json!("bar")));

        let reply = registry
            .handle_rpc(r#"{"id":9,"method":"control.nope","params":{}}"#)
            .await
            .expect("reply");
        assert!(reply.into_response().is_error());

        let reply = registry
            .handle_rpc(r#"{"id":10,"method":"control.handle","params":{"id":"x"}}"#)
            .await
            .expect("reply");
        assert_eq!(reply.id, 10);
        assert!(reply.error.is_some());

        assert!(registry.handle_rpc("{garbage").await.is_none());
    }
}
