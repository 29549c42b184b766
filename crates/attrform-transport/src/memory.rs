//! In-memory callback transport.
//!
//! Serves canned JSON responses keyed by method and path (including the query
//! string), and records every request it receives. It stands in for a real
//! connector in unit tests, integration tests, and `attrform inspect --mock`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::{CallbackMethod, CallbackRequest, CallbackTransport, TransportError};

type RouteKey = (CallbackMethod, String);

#[derive(Debug, Default)]
struct Routes {
    responses: HashMap<RouteKey, serde_json::Value>,
    failures: HashMap<RouteKey, (u16, String)>,
    delays: HashMap<RouteKey, Duration>,
    calls: Vec<CallbackRequest>,
}

/// A canned-response transport.
///
/// Clones share state, so a test can keep one handle for assertions while the
/// resolver owns another.
///
/// # Examples
///
/// ```
/// # use attrform_transport::{CallbackMethod, CallbackRequest, CallbackTransport, MemoryTransport};
/// # #[tokio::main]
/// # async fn main() {
/// let transport = MemoryTransport::new();
/// transport
///     .respond(CallbackMethod::Post, "v1/kinds", serde_json::json!([{"data": "basic"}]))
///     .await;
/// let req = CallbackRequest::new(CallbackMethod::Post, "v1/kinds");
/// let body = transport.invoke(&req).await.unwrap();
/// assert_eq!(body[0]["data"], "basic");
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    routes: Arc<RwLock<Routes>>,
}

impl MemoryTransport {
    /// Create a transport with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the JSON body returned for `method path`.
    ///
    /// `path` is matched against [`CallbackRequest::path_and_query`].
    pub async fn respond(&self, method: CallbackMethod, path: &str, body: serde_json::Value) {
        let key = (method, normalize(path));
        let mut routes = self.routes.write().await;
        routes.failures.remove(&key);
        routes.responses.insert(key, body);
    }

    /// Make `method path` answer with an HTTP error status.
    pub async fn fail(&self, method: CallbackMethod, path: &str, status_code: u16, message: &str) {
        let key = (method, normalize(path));
        let mut routes = self.routes.write().await;
        routes.responses.remove(&key);
        routes.failures.insert(key, (status_code, message.to_owned()));
    }

    /// Delay the answer for `method path`.
    pub async fn delay(&self, method: CallbackMethod, path: &str, delay: Duration) {
        let key = (method, normalize(path));
        self.routes.write().await.delays.insert(key, delay);
    }

    /// All requests received so far, in arrival order.
    pub async fn calls(&self) -> Vec<CallbackRequest> {
        self.routes.read().await.calls.clone()
    }

    /// Number of requests received so far.
    pub async fn call_count(&self) -> usize {
        self.routes.read().await.calls.len()
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_owned()
}

#[async_trait::async_trait]
impl CallbackTransport for MemoryTransport {
    async fn invoke(&self, request: &CallbackRequest) -> Result<serde_json::Value, TransportError> {
        let path = request.path_and_query();
        let key = (request.method, path.clone());

        let delay = {
            let mut routes = self.routes.write().await;
            routes.calls.push(request.clone());
            routes.delays.get(&key).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let routes = self.routes.read().await;
        if let Some((status_code, message)) = routes.failures.get(&key) {
            return Err(TransportError::Status {
                path,
                status_code: *status_code,
                message: message.clone(),
            });
        }
        routes
            .responses
            .get(&key)
            .cloned()
            .ok_or(TransportError::Status {
                path,
                status_code: 404,
                message: "no canned response".to_owned(),
            })
    }
}
