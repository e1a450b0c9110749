//! HTTP transport port.
//!
//! [`ReqwestTransport`] is the production implementation; [`FakeTransport`]
//! serves scripted replies so the resolver and aggregators can be exercised
//! without a network.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::registry::AuthToken;

// ------------------------------------------------------------------ //
//  Request / response types                                           //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<AuthToken>,
    pub body: RequestBody,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailure {
    /// The host could not be reached at all.
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure>;
}

// ------------------------------------------------------------------ //
//  reqwest implementation                                             //
// ------------------------------------------------------------------ //

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(50)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    fn classify_error(e: &reqwest::Error) -> TransportFailure {
        if e.is_timeout() {
            TransportFailure::Timeout
        } else if e.is_connect() {
            TransportFailure::Connect(e.to_string())
        } else {
            TransportFailure::Other(e.to_string())
        }
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure> {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url)
            .timeout(request.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = request.bearer.as_ref().filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token.expose());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(pairs) => builder.form(&pairs),
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| Self::classify_error(&e))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Self::classify_error(&e))?
            .to_vec();

        debug!(url = request.url, status, "upstream responded");
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

// ------------------------------------------------------------------ //
//  FakeTransport (for tests)                                          //
// ------------------------------------------------------------------ //

/// Scripted reply for one `(method, url)` route.
#[derive(Debug, Clone)]
pub enum FakeReply {
    Respond(TransportResponse),
    Fail(TransportFailure),
    /// Answers after the delay.
    Slow(Duration, TransportResponse),
    /// Never answers; the caller's timeout has to fire.
    Hang,
}

impl FakeReply {
    pub fn status(status: u16) -> Self {
        FakeReply::Respond(TransportResponse {
            status,
            ..Default::default()
        })
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        FakeReply::Respond(TransportResponse {
            status,
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: body.to_string().into_bytes(),
        })
    }

    pub fn text(status: u16, body: &str) -> Self {
        FakeReply::Respond(TransportResponse {
            status,
            headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: body.as_bytes().to_vec(),
        })
    }

    pub fn delayed(self, delay: Duration) -> Self {
        match self {
            FakeReply::Respond(resp) => FakeReply::Slow(delay, resp),
            other => other,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let FakeReply::Respond(resp) = &mut self {
            resp.headers
                .insert(name.to_ascii_lowercase(), value.to_string());
        }
        self
    }
}

/// In-memory transport keyed by method and URL (query string ignored).
///
/// Unknown routes fail with [`TransportFailure::Connect`], which is what a
/// dead host looks like.
#[derive(Debug, Default, Clone)]
pub struct FakeTransport {
    routes: Arc<Mutex<HashMap<(Method, String), FakeReply>>>,
    calls: Arc<Mutex<Vec<TransportRequest>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, method: Method, url: &str, reply: FakeReply) -> &Self {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((method, url.to_string()), reply);
        self
    }

    /// Every request seen so far, in arrival order.
    pub fn calls(&self) -> Vec<TransportRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, method: Method, url: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.method == method && c.url == url)
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure> {
        let key = (request.method, request.url.clone());
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let reply = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        match reply {
            Some(FakeReply::Respond(resp)) => Ok(resp),
            Some(FakeReply::Fail(failure)) => Err(failure),
            Some(FakeReply::Slow(delay, resp)) => {
                tokio::time::sleep(delay).await;
                Ok(resp)
            }
            Some(FakeReply::Hang) => std::future::pending().await,
            None => Err(TransportFailure::Connect(format!("no route to {}", key.1))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, url: &str) -> TransportRequest {
        TransportRequest {
            method,
            url: url.to_string(),
            query: vec![],
            bearer: None,
            body: RequestBody::Empty,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn fake_serves_scripted_reply_and_records_calls() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, "http://a/health", FakeReply::status(204));

        let resp = fake.send(request(Method::Get, "http://a/health")).await.unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(fake.call_count(Method::Get, "http://a/health"), 1);
    }

    #[tokio::test]
    async fn fake_unknown_route_looks_like_dead_host() {
        let fake = FakeTransport::new();
        let err = fake.send(request(Method::Put, "http://nowhere/x")).await.unwrap_err();
        assert!(matches!(err, TransportFailure::Connect(_)));
    }

    #[test]
    fn header_names_are_lowercased() {
        let reply = FakeReply::status(200).with_header("X-Total-Count", "7");
        let FakeReply::Respond(resp) = reply else {
            panic!("expected a response");
        };
        assert_eq!(resp.headers.get("x-total-count").map(String::as_str), Some("7"));
    }
}
