//! Transport capability consumed by the client runtime.
//!
//! The runtime only talks to the server through the [`Transport`] trait so
//! tests can inject scripted transports. [`HttpTransport`] is the production
//! implementation over the CoCon REST interface:
//!
//! - `POST {base}/Connect` → `{"Connect": true, "id": "<session id>"}`
//! - `GET  {base}/Notification?id=...` (long-poll)
//! - `POST {base}/{Command}?id=...&<params>`
//! - `POST {base}/Disconnect?id=...`

use crate::config::Config;
use crate::errors::CoConError;
use crate::models::Endpoint;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Connect timeout for the underlying HTTP client.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded notification payload (JSON object).
pub type Payload = serde_json::Map<String, Value>;

/// Command parameters; values travel as query parameters.
pub type CommandParams = BTreeMap<String, String>;

/// Result of a successful connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    /// Server-assigned session (connection) id.
    pub id: String,
}

/// Outcome of one long-poll request.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The server delivered zero or more events, in arrival order.
    Events(Vec<Payload>),
    /// No event was ready before the long-poll window closed.
    ///
    /// `acknowledged` is true when the server itself reported the timeout,
    /// which also proves the session is still alive.
    TimedOut { acknowledged: bool },
}

/// HTTP capability used by the session manager, poller and command queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a new session.
    async fn connect(&self) -> Result<SessionGrant, CoConError>;

    /// Issue one long-poll request bound by `timeout`.
    async fn poll(&self, session_id: &str, timeout: Duration) -> Result<PollOutcome, CoConError>;

    /// Deliver a command and return the decoded response body.
    async fn send(
        &self,
        session_id: &str,
        name: &str,
        params: &CommandParams,
    ) -> Result<Value, CoConError>;

    /// Release the session server-side.
    async fn disconnect(&self, session_id: &str) -> Result<(), CoConError>;
}

/// Decode a notification response body into events.
///
/// An object is one event, an array of objects is one event per element,
/// an empty body or `null` is no event.
///
/// # Errors
///
/// Returns `CoConError::Protocol` for invalid JSON or non-object events.
pub fn decode_notification(body: &str) -> Result<Vec<Payload>, CoConError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| CoConError::Protocol(format!("invalid notification JSON: {e}")))?;

    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(payload) => Ok(vec![payload]),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(payload) => Ok(payload),
                other => Err(CoConError::Protocol(format!(
                    "notification element {index} is not an object: {other}"
                ))),
            })
            .collect(),
        other => Err(CoConError::Protocol(format!(
            "unexpected notification body: {other}"
        ))),
    }
}

/// Map a non-success HTTP status to the error taxonomy.
fn classify_status(endpoint: &str, status: StatusCode, body: Option<String>) -> CoConError {
    match status {
        StatusCode::BAD_REQUEST => CoConError::SessionInvalid(format!(
            "'/{endpoint}' rejected the session id (HTTP 400)"
        )),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            CoConError::TransientNetwork(format!("'/{endpoint}' returned HTTP {status}"))
        }
        s if s.is_server_error() => {
            CoConError::TransientNetwork(format!("'/{endpoint}' returned HTTP {status}"))
        }
        _ => CoConError::CommandRejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        },
    }
}

/// Production transport over the CoCon REST interface.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport for the server described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `CoConError::TransientNetwork` if the HTTP client cannot be
    /// constructed (e.g. the TLS backend fails to initialize).
    pub fn new(config: &Config) -> Result<Self, CoConError> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                CoConError::TransientNetwork(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            request_timeout: config.session_timeout,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn error_from_response(endpoint: &str, response: reqwest::Response) -> CoConError {
        let status = response.status();
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        trace!(
            target: "cocon.transport",
            endpoint = %endpoint,
            status = %status,
            body = ?body,
            "Error response body"
        );
        classify_status(endpoint, status, body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all)]
    async fn connect(&self) -> Result<SessionGrant, CoConError> {
        let endpoint = Endpoint::Connect.as_str();
        let response = self
            .client
            .post(self.url(endpoint))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| CoConError::TransientNetwork(format!("'/{endpoint}' failed: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(Self::error_from_response(endpoint, response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoConError::Protocol(format!("invalid '/{endpoint}' response: {e}")))?;

        if !body.get("Connect").and_then(Value::as_bool).unwrap_or(false) {
            return Err(CoConError::Protocol(format!(
                "'/{endpoint}' returned 200 but Connect is not true"
            )));
        }

        let id = body
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                CoConError::Protocol(format!("'/{endpoint}' response is missing the session id"))
            })?;

        debug!(target: "cocon.transport", session_id = %id, "Session granted");
        Ok(SessionGrant { id: id.to_string() })
    }

    async fn poll(&self, session_id: &str, timeout: Duration) -> Result<PollOutcome, CoConError> {
        let endpoint = Endpoint::Notification.as_str();
        let result = self
            .client
            .get(self.url(endpoint))
            .query(&[("id", session_id)])
            .timeout(timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Ok(PollOutcome::TimedOut {
                    acknowledged: false,
                })
            }
            Err(e) => {
                return Err(CoConError::TransientNetwork(format!(
                    "'/{endpoint}' failed: {e}"
                )))
            }
        };

        match response.status() {
            StatusCode::OK => {
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) if e.is_timeout() => {
                        return Ok(PollOutcome::TimedOut {
                            acknowledged: false,
                        })
                    }
                    Err(e) => {
                        return Err(CoConError::TransientNetwork(format!(
                            "'/{endpoint}' body read failed: {e}"
                        )))
                    }
                };
                decode_notification(&body).map(PollOutcome::Events)
            }
            StatusCode::REQUEST_TIMEOUT => Ok(PollOutcome::TimedOut { acknowledged: true }),
            _ => Err(Self::error_from_response(endpoint, response).await),
        }
    }

    async fn send(
        &self,
        session_id: &str,
        name: &str,
        params: &CommandParams,
    ) -> Result<Value, CoConError> {
        let mut query: Vec<(&str, &str)> = params
            .iter()
            .filter(|(key, _)| key.as_str() != "id")
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        query.push(("id", session_id));

        let response = self
            .client
            .post(self.url(name))
            .query(&query)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| CoConError::TransientNetwork(format!("'/{name}' failed: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(Self::error_from_response(name, response).await);
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));

        let body = response
            .text()
            .await
            .map_err(|e| CoConError::TransientNetwork(format!("'/{name}' body read failed: {e}")))?;

        if is_json {
            serde_json::from_str(&body)
                .map_err(|e| CoConError::Protocol(format!("invalid '/{name}' response: {e}")))
        } else {
            Ok(Value::String(body))
        }
    }

    async fn disconnect(&self, session_id: &str) -> Result<(), CoConError> {
        let endpoint = Endpoint::Disconnect.as_str();
        let response = self
            .client
            .post(self.url(endpoint))
            .query(&[("id", session_id)])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| CoConError::TransientNetwork(format!("'/{endpoint}' failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let err = Self::error_from_response(endpoint, response).await;
            warn!(target: "cocon.transport", error = %err, "Disconnect rejected");
            Err(err)
        }
    }
}
