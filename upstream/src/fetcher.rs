//! Single bounded upstream call with uniform outcome classification.
//!
//! The fetcher never retries. Retrying is the resolver's or the caller's
//! business; doing it here as well would multiply latency.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::{AuthToken, EndpointDescriptor};
use crate::transport::{Method, RequestBody, Transport, TransportFailure, TransportRequest};

/// Default per-call ceiling.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// ------------------------------------------------------------------ //
//  Outcome types                                                      //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    /// The upstream answered with a non-2xx status.
    ClientRejected,
    Unreachable,
    Timeout,
}

impl Classification {
    pub fn from_status(status: u16) -> Self {
        if (200..300).contains(&status) {
            Classification::Success
        } else {
            Classification::ClientRejected
        }
    }

    pub fn is_success(self) -> bool {
        self == Classification::Success
    }
}

/// Response body as far as it could be understood.
///
/// Upstreams are free to answer with anything, so a body that is not JSON is
/// kept as text instead of being treated as an error.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    #[default]
    None,
    Json(Value),
    Text(String),
}

impl ResponseBody {
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return ResponseBody::None;
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Body as a JSON value; text is wrapped as `{"message": text}`.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            ResponseBody::None => None,
            ResponseBody::Json(v) => Some(v.clone()),
            ResponseBody::Text(s) => Some(serde_json::json!({ "message": s })),
        }
    }

    /// Records in a list payload.
    ///
    /// Accepts a bare list, or an object wrapping the list in `data`,
    /// `results` or `items`. Any other object counts as a single record.
    pub fn records(&self) -> Vec<&Value> {
        match self.as_json() {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(obj @ Value::Object(map)) => {
                for wrapper in ["data", "results", "items"] {
                    if let Some(Value::Array(items)) = map.get(wrapper) {
                        return items.iter().collect();
                    }
                }
                vec![obj]
            }
            _ => Vec::new(),
        }
    }

    /// First numeric field among `names`, at top level or under `data`.
    pub fn number_field(&self, names: &[&str]) -> Option<u64> {
        let root = self.as_json()?;
        let scopes = [Some(root), root.get("data")];
        scopes.into_iter().flatten().find_map(|scope| {
            names
                .iter()
                .find_map(|name| scope.get(*name).and_then(as_count))
        })
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One `(method, url)` pair that was actually sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriedAttempt {
    pub method: Method,
    pub url: String,
}

impl fmt::Display for TriedAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

impl Serialize for TriedAttempt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptOutcome {
    pub status_code: Option<u16>,
    pub classification: Classification,
    pub body: ResponseBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tried: Vec<TriedAttempt>,
    #[serde(skip)]
    pub headers: HashMap<String, String>,
    /// Set when the transport could not connect at all.
    #[serde(skip)]
    pub host_unreachable: bool,
}

impl AttemptOutcome {
    fn failed(classification: Classification, error: String, tried: TriedAttempt) -> Self {
        Self {
            status_code: None,
            classification,
            body: ResponseBody::None,
            error: Some(error),
            tried: vec![tried],
            headers: HashMap::new(),
            host_unreachable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.classification.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Row count advertised by pagination headers.
    pub fn total_count_header(&self) -> Option<u64> {
        ["x-total-count", "x-total"]
            .iter()
            .find_map(|h| self.header(h).and_then(|v| v.trim().parse().ok()))
    }

    pub fn tried_strings(&self) -> Vec<String> {
        self.tried.iter().map(ToString::to_string).collect()
    }
}

// ------------------------------------------------------------------ //
//  Fetcher                                                            //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Replaces the registry token for this call.
    pub bearer: Option<AuthToken>,
}

impl FetchRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            bearer: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_bearer(mut self, bearer: Option<AuthToken>) -> Self {
        self.bearer = bearer;
        self
    }
}

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform exactly one call against `endpoint`.
    pub async fn fetch(&self, endpoint: &EndpointDescriptor, request: FetchRequest) -> AttemptOutcome {
        let tried = TriedAttempt {
            method: request.method,
            url: request.url.clone(),
        };
        let bearer = request
            .bearer
            .or_else(|| Some(endpoint.auth_token().clone()))
            .filter(|t| !t.is_empty());

        let transport_request = TransportRequest {
            method: request.method,
            url: request.url,
            query: request.query,
            bearer,
            body: request.body,
            timeout: self.timeout,
        };

        debug!(service = endpoint.name(), attempt = %tried, "upstream call");
        let sent = tokio::time::timeout(self.timeout, self.transport.send(transport_request)).await;

        match sent {
            Err(_) | Ok(Err(TransportFailure::Timeout)) => {
                warn!(service = endpoint.name(), attempt = %tried, timeout_ms = self.timeout.as_millis() as u64, "upstream call timed out");
                AttemptOutcome::failed(
                    Classification::Timeout,
                    format!("timed out after {:?}", self.timeout),
                    tried,
                )
            }
            Ok(Err(failure @ TransportFailure::Connect(_))) => {
                warn!(service = endpoint.name(), attempt = %tried, error = %failure, "upstream unreachable");
                let mut outcome =
                    AttemptOutcome::failed(Classification::Unreachable, failure.to_string(), tried);
                outcome.host_unreachable = true;
                outcome
            }
            Ok(Err(failure)) => {
                warn!(service = endpoint.name(), attempt = %tried, error = %failure, "upstream call failed");
                AttemptOutcome::failed(Classification::Unreachable, failure.to_string(), tried)
            }
            Ok(Ok(resp)) => {
                let classification = Classification::from_status(resp.status);
                debug!(service = endpoint.name(), attempt = %tried, status = resp.status, ?classification, "upstream call classified");
                AttemptOutcome {
                    status_code: Some(resp.status),
                    classification,
                    body: ResponseBody::parse(&resp.body),
                    error: None,
                    tried: vec![tried],
                    headers: resp.headers,
                    host_unreachable: false,
                }
            }
        }
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
