//! Admin gateway library: configuration, application state and the router.
//!
//! The binary in `main.rs` only wires production implementations together;
//! everything reachable over HTTP lives here so it can be driven in tests.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod refresh;
pub mod reports;
pub mod secrets;
pub mod state;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        request::Parts,
        HeaderValue, Method,
    },
    routing::{get, put},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the HTTP router.
///
/// Browser callers are accepted from `https://*<cors_origin_suffix>` only.
pub fn router(state: Arc<AppState>, cors_origin_suffix: &str) -> Router {
    Router::new()
        // Liveness, no auth
        .route("/healthz", get(handlers::healthz))
        // Aggregates (cached)
        .route("/api/v1/admin/health", get(handlers::admin_health))
        .route("/api/v1/admin/metrics/totals", get(handlers::metrics_totals))
        .route("/api/v1/admin/reports/users", get(handlers::user_report))
        // Mutations (never cached)
        .route("/api/v1/admin/users/:user_id", put(handlers::update_user))
        .layer(cors_layer(cors_origin_suffix))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(suffix: &str) -> CorsLayer {
    let suffix = if suffix.starts_with('.') {
        suffix.to_string()
    } else {
        format!(".{suffix}")
    };
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
            origin
                .to_str()
                .map(|origin| origin_allowed(origin, &suffix))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

/// `https://<label>.<suffix>` with a non-empty label.
pub fn origin_allowed(origin: &str, suffix: &str) -> bool {
    origin
        .strip_prefix("https://")
        .and_then(|host| host.strip_suffix(suffix))
        .is_some_and(|label| !label.is_empty() && !label.contains('/'))
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use upstream::transport::{FakeReply, FakeTransport};

    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::testing::{self, ADMIN_TOKEN, TENANT_TOKEN};

    const SUFFIX: &str = ".huggingface.co";

    fn app(fake: &FakeTransport, audit: &MemoryAuditLog) -> Router {
        router(testing::state(fake, audit), SUFFIX)
    }

    fn get_as(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        req.body(Body::empty()).unwrap()
    }

    fn put_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn liveness_needs_no_token() {
        let (status, body) = send(
            app(&FakeTransport::new(), &MemoryAuditLog::new()),
            get_as("/healthz", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn admin_routes_require_an_admin() {
        let fake = FakeTransport::new();
        let audit = MemoryAuditLog::new();

        let (status, body) = send(app(&fake, &audit), get_as("/api/v1/admin/health", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");

        let (status, _) = send(app(&fake, &audit), get_as("/api/v1/admin/health", Some("forged"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            app(&fake, &audit),
            get_as("/api/v1/admin/metrics/totals", Some(TENANT_TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "forbidden");
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn health_report_over_http() {
        let fake = FakeTransport::new();
        fake.route(
            upstream::Method::Get,
            "http://users.local/api/v1/health",
            FakeReply::json(200, json!({"status": "ok"})),
        );

        let (status, body) = send(
            app(&fake, &MemoryAuditLog::new()),
            get_as("/api/v1/admin/health?verbose=true", Some(ADMIN_TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overall_status"], "degraded");
        assert_eq!(
            body["summary"],
            json!({"ok": 1, "errors": 1, "total": 2, "optional_ignored": 1})
        );
        assert_eq!(
            body["services"]["notification"]["tried"],
            json!(["GET http://notify.local/health"])
        );
    }

    #[tokio::test]
    async fn update_user_walks_shapes_and_audits() {
        let fake = FakeTransport::new();
        fake.route(upstream::Method::Put, "http://users.local/api/v1/admin/users/42", FakeReply::status(404));
        fake.route(
            upstream::Method::Patch,
            "http://users.local/api/v1/admin/users/42",
            FakeReply::json(200, json!({"id": "42", "is_active": false})),
        );
        let audit = MemoryAuditLog::new();

        let (status, body) = send(
            app(&fake, &audit),
            put_json("/api/v1/admin/users/42", json!({"is_active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"id": "42", "is_active": false}));

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].admin_id, "admin-1");
        assert_eq!(entries[0].action, "update_user");
        assert_eq!(entries[0].entity_id, "42");
    }

    #[tokio::test]
    async fn unsupported_update_reports_every_shape() {
        let fake = FakeTransport::new();
        let url = "http://users.local/api/v1/admin/users/7";
        fake.route(upstream::Method::Put, url, FakeReply::status(405));
        fake.route(upstream::Method::Patch, url, FakeReply::status(405));
        fake.route(upstream::Method::Post, url, FakeReply::status(404));
        fake.route(
            upstream::Method::Post,
            "http://users.local/api/v1/admin/users/7/update",
            FakeReply::status(404),
        );
        let audit = MemoryAuditLog::new();

        let (status, body) = send(app(&fake, &audit), put_json("/api/v1/admin/users/7", json!({"role": "agent"}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "upstream_unsupported");
        assert_eq!(body["error"]["service"], "user_management");
        assert_eq!(body["error"]["operation"], "update_entity");
        assert_eq!(body["error"]["status_code"], 404);
        assert_eq!(body["error"]["tried"].as_array().map(Vec::len), Some(4));
        assert!(audit.entries().is_empty());
    }

    #[tokio::test]
    async fn user_report_in_amharic() {
        let fake = FakeTransport::new();
        fake.route(
            upstream::Method::Get,
            "http://users.local/api/v1/admin/users",
            FakeReply::json(200, json!({"results": [{"is_active": true}]})),
        );

        let (status, body) = send(
            app(&fake, &MemoryAuditLog::new()),
            get_as("/api/v1/admin/reports/users?lang=am", Some(ADMIN_TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "የተጠቃሚ መረጃ ሪፖርት");
        assert_eq!(body["total_users"], 1);
    }

    #[tokio::test]
    async fn cors_allows_configured_suffix_only() {
        let preflight = |origin: &str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/api/v1/admin/health")
                .header("origin", origin)
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap()
        };
        let fake = FakeTransport::new();
        let audit = MemoryAuditLog::new();

        let resp = app(&fake, &audit)
            .oneshot(preflight("https://team-space.huggingface.co"))
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "https://team-space.huggingface.co"
        );

        let resp = app(&fake, &audit)
            .oneshot(preflight("https://evil.example.com"))
            .await
            .unwrap();
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[test]
    fn origin_matching() {
        assert!(origin_allowed("https://a.huggingface.co", SUFFIX));
        assert!(!origin_allowed("http://a.huggingface.co", SUFFIX));
        assert!(!origin_allowed("https://huggingface.co", SUFFIX));
        assert!(!origin_allowed("https://evilhuggingface.co", SUFFIX));
    }
}
