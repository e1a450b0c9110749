//! Error type returned by handlers and its JSON envelope.
//!
//! Every error renders as `{"error": {"code": .., "message": .., ...}}`.
//! Resolver failures carry their diagnostics (service, operation, last
//! status, last body, every request shape tried) so admins can see what
//! the upstream actually said.

use axum::{http::StatusCode, response::IntoResponse, Json};
use refresh_cache::CacheError;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;
use upstream::{Classification, RegistryError, ResolveError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tried: Option<Vec<String>>,
}

impl ErrorBody {
    fn plain(code: &'static str, message: String) -> Self {
        Self {
            code,
            message,
            service: None,
            operation: None,
            status_code: None,
            body: None,
            tried: None,
        }
    }
}

impl GatewayError {
    fn parts(&self) -> (StatusCode, ErrorBody) {
        let message = self.to_string();
        match self {
            GatewayError::Resolve(err) => resolve_parts(err, message),
            GatewayError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorBody::plain("bad_request", message)),
            GatewayError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, ErrorBody::plain("unauthorized", message)),
            GatewayError::Forbidden(_) => (StatusCode::FORBIDDEN, ErrorBody::plain("forbidden", message)),
            GatewayError::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::plain("upstream_unreachable", message),
            ),
            GatewayError::Cache(_) | GatewayError::Registry(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::plain("internal_error", message),
            ),
        }
    }
}

fn resolve_parts(err: &ResolveError, message: String) -> (StatusCode, ErrorBody) {
    let (status, code, service, operation) = match err {
        ResolveError::InvalidEntityId(_) => {
            return (StatusCode::BAD_REQUEST, ErrorBody::plain("invalid_entity_id", message));
        }
        ResolveError::ExhaustedCandidates {
            service,
            operation,
            outcome,
        } if outcome.classification == Classification::Timeout => {
            (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", service, *operation)
        }
        ResolveError::ExhaustedCandidates { service, operation, .. } => {
            (StatusCode::BAD_GATEWAY, "upstream_unsupported", service, *operation)
        }
        ResolveError::Rejected {
            service,
            operation,
            status,
            ..
        } => {
            let passed = StatusCode::from_u16(*status)
                .ok()
                .filter(StatusCode::is_client_error)
                .unwrap_or(StatusCode::BAD_GATEWAY);
            (passed, "upstream_rejected", service, *operation)
        }
        ResolveError::Unreachable { service, operation, .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "upstream_unreachable", service, *operation)
        }
    };

    let outcome = err.outcome();
    (
        status,
        ErrorBody {
            code,
            message,
            service: Some(service.clone()),
            operation: Some(operation),
            status_code: outcome.and_then(|o| o.status_code),
            body: outcome.and_then(|o| o.body.to_value()),
            tried: outcome.map(|o| o.tried_strings()),
        },
    )
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = self.parts();
        if status.is_server_error() {
            error!(code = body.code, error = %self, "request failed");
        }
        (status, Json(ErrorEnvelope { error: body })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use upstream::fetcher::TriedAttempt;
    use upstream::{AttemptOutcome, Method, ResponseBody};

    fn outcome(status: Option<u16>, classification: Classification) -> Box<AttemptOutcome> {
        Box::new(AttemptOutcome {
            status_code: status,
            classification,
            body: ResponseBody::Text("nope".into()),
            error: None,
            tried: vec![TriedAttempt {
                method: Method::Put,
                url: "http://u/api/v1/users/1".into(),
            }],
            headers: Default::default(),
            host_unreachable: false,
        })
    }

    fn render(err: GatewayError) -> (StatusCode, Value) {
        let (status, body) = err.parts();
        (status, serde_json::to_value(ErrorEnvelope { error: body }).unwrap())
    }

    #[test]
    fn exhausted_is_bad_gateway_with_diagnostics() {
        let (status, body) = render(
            ResolveError::ExhaustedCandidates {
                service: "user_management".into(),
                operation: "update_entity",
                outcome: outcome(Some(501), Classification::ClientRejected),
            }
            .into(),
        );
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "upstream_unsupported");
        assert_eq!(body["error"]["status_code"], 501);
        assert_eq!(body["error"]["body"], json!({"message": "nope"}));
        assert_eq!(body["error"]["tried"], json!(["PUT http://u/api/v1/users/1"]));
    }

    #[test]
    fn rejection_passes_client_status_through() {
        let rejected = |status| {
            render(
                ResolveError::Rejected {
                    service: "user_management".into(),
                    operation: "update_entity",
                    status,
                    outcome: outcome(Some(status), Classification::ClientRejected),
                }
                .into(),
            )
        };
        let (status, body) = rejected(422);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "upstream_rejected");

        let (status, _) = rejected(500);
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn transport_failures_map_to_503_and_504() {
        let (status, body) = render(
            ResolveError::Unreachable {
                service: "s".into(),
                operation: "update_entity",
                outcome: outcome(None, Classification::Unreachable),
            }
            .into(),
        );
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "upstream_unreachable");
        assert!(body["error"].get("status_code").is_none());

        let (status, body) = render(
            ResolveError::ExhaustedCandidates {
                service: "s".into(),
                operation: "update_entity",
                outcome: outcome(None, Classification::Timeout),
            }
            .into(),
        );
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"]["code"], "upstream_timeout");
    }

    #[test]
    fn local_errors() {
        let (status, body) = render(GatewayError::Forbidden("admin role required".into()));
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["message"], "admin role required");
        assert!(body["error"].get("tried").is_none());

        let (status, _) = render(ResolveError::InvalidEntityId("a/b".into()).into());
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
