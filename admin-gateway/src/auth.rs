//! Admin authentication.
//!
//! Admin routes require `Authorization: Bearer <token>`. The token is handed
//! to a [`TokenVerifier`]; in production that is the user service, asked
//! through the resolver's `verify_token` shapes since nobody agrees on how a
//! token should be submitted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use upstream::{AuthToken, EndpointDescriptor, LogicalOp, PatternResolver, ResolveError, ResolveRequest};

use crate::error::GatewayError;
use crate::state::AppState;

const ID_FIELDS: &[&str] = &["id", "_id", "user_id", "sub", "uid"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid or expired token")]
    Invalid,
    #[error("admin role required")]
    Forbidden,
    #[error("token verification unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Missing | AuthError::Invalid => GatewayError::Unauthorized(err.to_string()),
            AuthError::Forbidden => GatewayError::Forbidden(err.to_string()),
            AuthError::Unavailable(_) => GatewayError::Unavailable(err.to_string()),
        }
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

// ------------------------------------------------------------------ //
//  Upstream verifier                                                  //
// ------------------------------------------------------------------ //

pub struct UpstreamVerifier {
    resolver: PatternResolver,
    endpoint: EndpointDescriptor,
}

impl UpstreamVerifier {
    pub fn new(resolver: PatternResolver, endpoint: EndpointDescriptor) -> Self {
        Self { resolver, endpoint }
    }
}

#[async_trait]
impl TokenVerifier for UpstreamVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let request = ResolveRequest::new(LogicalOp::VerifyToken)
            .field("token", token)
            .bearer(AuthToken::new(token));

        match self.resolver.resolve(&self.endpoint, request).await {
            Ok(outcome) => outcome
                .body
                .as_json()
                .and_then(identity_from_body)
                .ok_or(AuthError::Invalid),
            Err(ResolveError::Unreachable { service, .. }) => {
                warn!(service, "token verification endpoint unreachable");
                Err(AuthError::Unavailable(service))
            }
            Err(e) => {
                debug!(error = %e, "token rejected");
                Err(AuthError::Invalid)
            }
        }
    }
}

/// Identity from `{"user": {...}}`, `{"data": {...}}` or a flat body.
pub fn identity_from_body(body: &Value) -> Option<Identity> {
    let user = ["user", "data"]
        .iter()
        .find_map(|k| body.get(*k).filter(|v| v.is_object()))
        .unwrap_or(body);

    let id = ID_FIELDS.iter().find_map(|k| match user.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })?;
    let role = user
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let email = user.get("email").and_then(Value::as_str).map(str::to_string);

    Some(Identity { id, role, email })
}

// ------------------------------------------------------------------ //
//  Static verifier (for tests and local runs)                         //
// ------------------------------------------------------------------ //

#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: &str, id: &str, role: &str) -> Self {
        self.tokens.insert(
            token.to_string(),
            Identity {
                id: id.to_string(),
                role: role.to_string(),
                email: None,
            },
        );
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::Invalid)
    }
}

// ------------------------------------------------------------------ //
//  Extractor                                                          //
// ------------------------------------------------------------------ //

/// A verified caller with the admin role.
#[derive(Debug, Clone)]
pub struct AdminIdentity(pub Identity);

fn bearer_token(parts: &Parts) -> Option<&str> {
    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminIdentity {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::Missing)?;
        let identity = state.verifier.verify(token).await?;
        if !identity.is_admin() {
            debug!(user_id = identity.id, "non-admin caller rejected");
            return Err(AuthError::Forbidden.into());
        }
        Ok(AdminIdentity(identity))
    }
}
