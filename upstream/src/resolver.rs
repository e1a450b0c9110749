//! Request-pattern resolution for upstreams with an unknown contract.
//!
//! Each [`LogicalOp`] owns a static, ordered list of [`AttemptDescriptor`]s:
//! the REST conventions an upstream is most likely to accept for that
//! operation. [`PatternResolver::resolve`] sends them one at a time and stops
//! at the first 2xx.
//!
//! Mutating operations are **not idempotent** across candidates: an upstream
//! may partially apply a request it then answers with a "wrong shape" status,
//! after which a later candidate applies it again. Fixing that needs a
//! stable upstream contract, so the risk is accepted here.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::fetcher::{AttemptOutcome, Classification, FetchRequest, Fetcher};
use crate::registry::{AuthToken, EndpointDescriptor};
use crate::transport::{Method, RequestBody};

// ------------------------------------------------------------------ //
//  Candidate descriptors                                              //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    Json,
    Form,
    /// Fields go into the query string.
    Query,
    None,
}

/// One concrete guess at the request shape an upstream accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptDescriptor {
    pub method: Method,
    /// Relative to the endpoint's API base; `{collection}` and `{id}` are
    /// substituted.
    pub path_template: &'static str,
    pub body_encoding: BodyEncoding,
}

impl AttemptDescriptor {
    pub const fn new(method: Method, path_template: &'static str, body_encoding: BodyEncoding) -> Self {
        Self {
            method,
            path_template,
            body_encoding,
        }
    }

    pub fn render_path(&self, collection: &str, id: &str) -> String {
        self.path_template
            .replace("{collection}", collection.trim_matches('/'))
            .replace("{id}", id)
    }

    fn build_request(&self, url: String, fields: &Map<String, Value>, bearer: Option<AuthToken>) -> FetchRequest {
        let request = FetchRequest::new(self.method, url).with_bearer(bearer);
        match self.body_encoding {
            BodyEncoding::Json => request.with_body(RequestBody::Json(Value::Object(fields.clone()))),
            BodyEncoding::Form => request.with_body(RequestBody::Form(flatten(fields))),
            BodyEncoding::Query => flatten(fields)
                .into_iter()
                .fold(request, |req, (k, v)| req.with_query(&k, v)),
            BodyEncoding::None => request,
        }
    }
}

/// Flat `key=value` pairs for form and query encodings. Strings are sent
/// without quotes, nested values as compact JSON, nulls are dropped.
fn flatten(fields: &Map<String, Value>) -> Vec<(String, String)> {
    fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

const UPDATE_ENTITY: &[AttemptDescriptor] = &[
    AttemptDescriptor::new(Method::Put, "/{collection}/{id}", BodyEncoding::Json),
    AttemptDescriptor::new(Method::Patch, "/{collection}/{id}", BodyEncoding::Json),
    AttemptDescriptor::new(Method::Post, "/{collection}/{id}/update", BodyEncoding::Json),
    AttemptDescriptor::new(Method::Post, "/{collection}/{id}", BodyEncoding::Form),
];

const LIST_USERS: &[AttemptDescriptor] = &[
    AttemptDescriptor::new(Method::Get, "/admin/users", BodyEncoding::Query),
    AttemptDescriptor::new(Method::Get, "/users", BodyEncoding::Query),
];

const VERIFY_TOKEN: &[AttemptDescriptor] = &[
    AttemptDescriptor::new(Method::Post, "/auth/verify", BodyEncoding::Json),
    AttemptDescriptor::new(Method::Post, "/auth/verify", BodyEncoding::Form),
    AttemptDescriptor::new(Method::Get, "/auth/verify", BodyEncoding::None),
    AttemptDescriptor::new(Method::Get, "/auth/verify", BodyEncoding::Query),
];

/// Logical operations the gateway performs against upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// Partial update of one record in `collection`.
    UpdateEntity { collection: &'static str },
    /// One page of users, admin listing first.
    ListUsers,
    /// Bearer token verification against the user service.
    VerifyToken,
}

impl LogicalOp {
    pub fn name(self) -> &'static str {
        match self {
            LogicalOp::UpdateEntity { .. } => "update_entity",
            LogicalOp::ListUsers => "list_users",
            LogicalOp::VerifyToken => "verify_token",
        }
    }

    pub fn candidates(self) -> &'static [AttemptDescriptor] {
        match self {
            LogicalOp::UpdateEntity { .. } => UPDATE_ENTITY,
            LogicalOp::ListUsers => LIST_USERS,
            LogicalOp::VerifyToken => VERIFY_TOKEN,
        }
    }

    /// Statuses meaning "wrong shape, try the next candidate".
    pub fn retry_statuses(self) -> &'static [u16] {
        match self {
            LogicalOp::UpdateEntity { .. } => &[404, 405, 501],
            LogicalOp::ListUsers => &[404, 405],
            LogicalOp::VerifyToken => &[400, 401, 404, 405, 415, 422],
        }
    }

    fn collection(self) -> &'static str {
        match self {
            LogicalOp::UpdateEntity { collection } => collection,
            _ => "",
        }
    }

    fn needs_entity_id(self) -> bool {
        matches!(self, LogicalOp::UpdateEntity { .. })
    }
}

// ------------------------------------------------------------------ //
//  Request / errors                                                   //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub op: LogicalOp,
    pub entity_id: String,
    pub fields: Map<String, Value>,
    /// Sent instead of the registry token when set.
    pub bearer: Option<AuthToken>,
}

impl ResolveRequest {
    pub fn new(op: LogicalOp) -> Self {
        Self {
            op,
            entity_id: String::new(),
            fields: Map::new(),
            bearer: None,
        }
    }

    pub fn entity(mut self, id: impl Into<String>) -> Self {
        self.entity_id = id.into();
        self
    }

    pub fn fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn bearer(mut self, token: AuthToken) -> Self {
        self.bearer = Some(token);
        self
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Every candidate was tried; `outcome` is the last attempt's.
    #[error("upstream `{service}` does not support `{operation}` (tried {} request shapes)", .outcome.tried.len())]
    ExhaustedCandidates {
        service: String,
        operation: &'static str,
        outcome: Box<AttemptOutcome>,
    },
    /// The upstream understood the request shape and refused it.
    #[error("upstream `{service}` rejected `{operation}` with status {status}")]
    Rejected {
        service: String,
        operation: &'static str,
        status: u16,
        outcome: Box<AttemptOutcome>,
    },
    #[error("upstream `{service}` is unreachable")]
    Unreachable {
        service: String,
        operation: &'static str,
        outcome: Box<AttemptOutcome>,
    },
    #[error("invalid entity id `{0}`")]
    InvalidEntityId(String),
}

impl ResolveError {
    pub fn outcome(&self) -> Option<&AttemptOutcome> {
        match self {
            ResolveError::ExhaustedCandidates { outcome, .. }
            | ResolveError::Rejected { outcome, .. }
            | ResolveError::Unreachable { outcome, .. } => Some(outcome.as_ref()),
            ResolveError::InvalidEntityId(_) => None,
        }
    }
}

fn valid_entity_id(id: &str) -> bool {
    !id.is_empty()
        && !id
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '%'))
}

// ------------------------------------------------------------------ //
//  Executor                                                           //
// ------------------------------------------------------------------ //

#[derive(Clone)]
pub struct PatternResolver {
    fetcher: Fetcher,
}

impl PatternResolver {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Run `request.op`'s candidate list against `endpoint`.
    pub async fn resolve(
        &self,
        endpoint: &EndpointDescriptor,
        request: ResolveRequest,
    ) -> Result<AttemptOutcome, ResolveError> {
        self.resolve_with(endpoint, request.op.candidates(), request).await
    }

    /// Same as [`resolve`](Self::resolve) with an explicit candidate list.
    pub async fn resolve_with(
        &self,
        endpoint: &EndpointDescriptor,
        candidates: &[AttemptDescriptor],
        request: ResolveRequest,
    ) -> Result<AttemptOutcome, ResolveError> {
        let op = request.op;
        if op.needs_entity_id() && !valid_entity_id(&request.entity_id) {
            return Err(ResolveError::InvalidEntityId(request.entity_id));
        }

        let service = endpoint.name().to_string();
        let retry_on = op.retry_statuses();
        let mut tried = Vec::with_capacity(candidates.len());
        let mut last: Option<AttemptOutcome> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let path = candidate.render_path(op.collection(), &request.entity_id);
            let fetch = candidate.build_request(
                endpoint.api_url(&path),
                &request.fields,
                request.bearer.clone(),
            );

            let mut outcome = self.fetcher.fetch(endpoint, fetch).await;
            tried.append(&mut outcome.tried);
            outcome.tried = tried.clone();

            info!(
                service = service.as_str(),
                operation = op.name(),
                attempt = index + 1,
                method = %candidate.method,
                encoding = ?candidate.body_encoding,
                status = ?outcome.status_code,
                classification = ?outcome.classification,
                "resolver attempt"
            );

            match outcome.classification {
                Classification::Success => return Ok(outcome),
                Classification::Unreachable if outcome.host_unreachable => {
                    return Err(ResolveError::Unreachable {
                        service,
                        operation: op.name(),
                        outcome: Box::new(outcome),
                    });
                }
                Classification::ClientRejected => {
                    let status = outcome.status_code.unwrap_or_default();
                    if !retry_on.contains(&status) {
                        return Err(ResolveError::Rejected {
                            service,
                            operation: op.name(),
                            status,
                            outcome: Box::new(outcome),
                        });
                    }
                }
                Classification::Unreachable | Classification::Timeout => {}
            }
            last = Some(outcome);
        }

        match last {
            Some(outcome) => {
                warn!(
                    service = service.as_str(),
                    operation = op.name(),
                    tried = ?outcome.tried_strings(),
                    status = ?outcome.status_code,
                    "resolver exhausted all candidates"
                );
                Err(ResolveError::ExhaustedCandidates {
                    service,
                    operation: op.name(),
                    outcome: Box::new(outcome),
                })
            }
            None => Err(ResolveError::ExhaustedCandidates {
                service,
                operation: op.name(),
                outcome: Box::new(AttemptOutcome {
                    status_code: None,
                    classification: Classification::ClientRejected,
                    body: Default::default(),
                    error: Some("no request shapes configured".to_string()),
                    tried: Vec::new(),
                    headers: Default::default(),
                    host_unreachable: false,
                }),
            }),
        }
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
