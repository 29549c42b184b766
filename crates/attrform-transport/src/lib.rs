//! Callback transport abstraction for `attrform`.
//!
//! This crate defines the [`CallbackTransport`] trait: a pure request/response
//! interface that knows nothing about attribute descriptors, dependency graphs,
//! or form state. The callback resolver in `attrform-core` builds a
//! [`CallbackRequest`] from an attribute's mappings and hands it to a transport.
//!
//! Two implementations are provided:
//!
//! - [`HttpTransport`]: production default, backed by `reqwest` (feature `http-transport`)
//! - [`MemoryTransport`]: canned responses, for tests and offline inspection

mod error;
#[cfg(feature = "http-transport")]
mod http;
mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::TransportError;
#[cfg(feature = "http-transport")]
pub use http::{HttpTransport, HttpTransportConfig};
pub use memory::MemoryTransport;

/// HTTP method used for a callback invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallbackMethod {
    /// Query-only lookup.
    Get,
    /// The callback contract default.
    #[default]
    Post,
}

impl fmt::Display for CallbackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// A fully-built callback request.
///
/// `path` is connector-relative with path variables already substituted.
/// Query parameters keep mapping order. The body is present only when at
/// least one mapping targets the request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRequest {
    /// HTTP method.
    pub method: CallbackMethod,
    /// Connector-relative path, e.g. `v1/authorityProvider/ejbca/attributes`.
    pub path: String,
    /// Query string pairs, unencoded.
    pub query: Vec<(String, String)>,
    /// JSON object body.
    pub body: Option<serde_json::Map<String, serde_json::Value>>,
}

impl CallbackRequest {
    /// Create a body-less request with no query parameters.
    #[must_use]
    pub fn new(method: CallbackMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Render the path plus URL-encoded query string.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        let path = self.path.trim_start_matches('/');
        if self.query.is_empty() {
            return path.to_owned();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{path}?{query}")
    }
}

/// A pluggable callback transport.
///
/// The response is returned as raw JSON; interpreting it as attribute content
/// is the resolver's job. Implementations must be safe to share across async
/// tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait CallbackTransport: Send + Sync + 'static {
    /// Invoke a connector callback.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] for network failures, timeouts, non-2xx
    /// statuses, or undecodable bodies.
    async fn invoke(&self, request: &CallbackRequest) -> Result<serde_json::Value, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query_without_query() {
        let req = CallbackRequest::new(CallbackMethod::Post, "/v1/kinds/basic/attributes");
        assert_eq!(req.path_and_query(), "v1/kinds/basic/attributes");
    }

    #[test]
    fn path_and_query_encodes_pairs() {
        let mut req = CallbackRequest::new(CallbackMethod::Get, "v1/ra");
        req.query.push(("name".to_owned(), "a b&c".to_owned()));
        req.query.push(("kind".to_owned(), "basic".to_owned()));
        assert_eq!(req.path_and_query(), "v1/ra?name=a%20b%26c&kind=basic");
    }

    #[test]
    fn method_defaults_to_post() {
        assert_eq!(CallbackMethod::default(), CallbackMethod::Post);
        assert_eq!(CallbackMethod::Get.to_string(), "GET");
    }
}
