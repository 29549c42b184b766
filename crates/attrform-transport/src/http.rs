//! HTTP callback transport backed by `reqwest`.
//!
//! Calls `{base_url}/{path}?{query}` with an optional bearer token, retries
//! 429/5xx answers and network failures with exponential backoff plus jitter,
//! and extracts the connector's error message from JSON error bodies.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{CallbackMethod, CallbackRequest, CallbackTransport, TransportError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Connector base URL, e.g. `http://127.0.0.1:8280`.
    pub base_url: String,
    /// Bearer token sent as `Authorization` (omitted when empty).
    pub token: String,
    /// Per-request timeout. Default: 10 seconds.
    pub timeout: Duration,
    /// Max retry attempts after the first try. Default: 3.
    pub max_retries: u32,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Connector callback transport over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    token: String,
    max_retries: u32,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Text(String),
    Detail { message: Option<String> },
}

impl HttpTransport {
    /// Build a transport from configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the base URL is empty or the HTTP
    /// client cannot be constructed.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(cfg: HttpTransportConfig) -> Result<Self, TransportError> {
        let base_url = cfg.base_url.trim_end_matches('/').to_owned();
        if base_url.is_empty() {
            return Err(TransportError::Config(
                "missing connector base URL".to_owned(),
            ));
        }

        let timeout = if cfg.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            cfg.timeout
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("attrform/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            token: cfg.token,
            max_retries: cfg.max_retries,
            client,
        })
    }

    /// The connector base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl CallbackTransport for HttpTransport {
    async fn invoke(&self, request: &CallbackRequest) -> Result<serde_json::Value, TransportError> {
        let path = request.path_and_query();
        let url = format!("{}/{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            let mut req = match request.method {
                CallbackMethod::Get => self.client.get(&url),
                CallbackMethod::Post => self.client.post(&url),
            };
            if !self.token.is_empty() {
                req = req.bearer_auth(&self.token);
            }
            if let Some(body) = &request.body {
                req = req.json(body);
            } else if request.method == CallbackMethod::Post {
                req = req.json(&serde_json::Map::new());
            }

            debug!(method = %request.method, %url, attempt, "invoking callback");

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();

                    if status.is_success() {
                        if text.trim().is_empty() {
                            return Ok(serde_json::Value::Array(Vec::new()));
                        }
                        return serde_json::from_str(&text).map_err(|e| TransportError::Json {
                            path: path.clone(),
                            reason: e.to_string(),
                        });
                    }

                    let message = error_message(&text)
                        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
                    last_err = Some(TransportError::Status {
                        path: path.clone(),
                        status_code: status.as_u16(),
                        message,
                    });

                    if attempt < self.max_retries && is_retryable(status) {
                        warn!(%url, status = status.as_u16(), attempt, "retrying callback");
                        sleep_with_jitter(attempt).await;
                        continue;
                    }
                }
                Err(e) => {
                    last_err = Some(if e.is_timeout() {
                        TransportError::Timeout { path: path.clone() }
                    } else {
                        TransportError::Network {
                            path: path.clone(),
                            reason: e.to_string(),
                        }
                    });

                    if attempt < self.max_retries {
                        warn!(%url, attempt, error = %e, "retrying callback");
                        sleep_with_jitter(attempt).await;
                        continue;
                    }
                }
            }

            break;
        }

        Err(last_err.unwrap_or(TransportError::Network {
            path,
            reason: "unknown error".to_owned(),
        }))
    }
}

fn error_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    if parsed.message.is_some() {
        return parsed.message;
    }
    match parsed.error? {
        ErrorDetail::Text(text) => Some(text),
        ErrorDetail::Detail { message } => message,
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

async fn sleep_with_jitter(attempt: u32) {
    #[allow(clippy::cast_possible_truncation)]
    let base = (RETRY_BASE_DELAY.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
    #[allow(clippy::cast_precision_loss)]
    let base_f = base as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let jitter = (base_f * 0.3 * rand_f64()) as u64;
    tokio::time::sleep(Duration::from_millis(base.saturating_add(jitter))).await;
}

/// Pseudo-random f64 in [0, 1) from the clock's sub-second nanos.
fn rand_f64() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
