//! Whole-layer scenarios against a scripted transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use upstream::health::HealthSummary;
use upstream::registry::services;
use upstream::transport::{FakeReply, FakeTransport};
use upstream::{
    AuthToken, Classification, EndpointDescriptor, EndpointRegistry, Fetcher, HealthAggregator,
    LogicalOp, Method, OverallStatus, PatternResolver, ResolveRequest,
};

fn fetcher(fake: &FakeTransport) -> Fetcher {
    Fetcher::new(Arc::new(fake.clone()), Duration::from_secs(2))
}

#[tokio::test]
async fn failing_optional_service_degrades_the_report() {
    let fake = FakeTransport::new();
    fake.route(
        Method::Get,
        "http://users.local/api/v1/health",
        FakeReply::json(200, json!({"status": "ok"})),
    );
    fake.route(Method::Get, "http://payments.local/health", FakeReply::text(200, "OK"));
    // notification.local has no route and looks like a dead host.

    let registry = EndpointRegistry::new(vec![
        EndpointDescriptor::new(
            services::USER_MANAGEMENT,
            "http://users.local/api/v1",
            AuthToken::new("u"),
            false,
        )
        .unwrap(),
        EndpointDescriptor::new(
            services::PAYMENT_PROCESSING,
            "http://payments.local/docs",
            AuthToken::new("p"),
            false,
        )
        .unwrap(),
        EndpointDescriptor::new(
            services::NOTIFICATION,
            "http://notification.local",
            AuthToken::default(),
            true,
        )
        .unwrap(),
    ])
    .unwrap();

    let report = HealthAggregator::new(registry, fetcher(&fake))
        .aggregate(true)
        .await;

    assert_eq!(report.overall_status(), OverallStatus::Degraded);
    assert_eq!(
        report.summary(),
        HealthSummary {
            ok: 2,
            errors: 1,
            total: 3,
            optional_ignored: 1,
        }
    );
    let notification = &report.services()[services::NOTIFICATION];
    assert_eq!(notification.classification, Classification::Unreachable);
    assert_eq!(
        notification.tried.as_deref(),
        Some(&["GET http://notification.local/health".to_string()][..])
    );

    let wire = serde_json::to_value(&report).unwrap();
    assert_eq!(wire["overall_status"], "degraded");
    assert_eq!(wire["services"]["payment_processing"]["data"]["message"], "OK");
}

#[tokio::test]
async fn update_settles_on_third_request_shape() {
    let fake = FakeTransport::new();
    fake.route(Method::Put, "http://users.local/api/v1/admin/users/42", FakeReply::status(404));
    fake.route(Method::Patch, "http://users.local/api/v1/admin/users/42", FakeReply::status(405));
    fake.route(
        Method::Post,
        "http://users.local/api/v1/admin/users/42/update",
        FakeReply::json(200, json!({"id": 42, "role": "admin"})),
    );

    let endpoint = EndpointDescriptor::new(
        services::USER_MANAGEMENT,
        "http://users.local",
        AuthToken::new("internal"),
        false,
    )
    .unwrap();

    let outcome = PatternResolver::new(fetcher(&fake))
        .resolve(
            &endpoint,
            ResolveRequest::new(LogicalOp::UpdateEntity { collection: "admin/users" })
                .entity("42")
                .field("role", "admin"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.classification, Classification::Success);
    assert_eq!(outcome.status_code, Some(200));
    assert_eq!(
        outcome.tried_strings(),
        vec![
            "PUT http://users.local/api/v1/admin/users/42",
            "PATCH http://users.local/api/v1/admin/users/42",
            "POST http://users.local/api/v1/admin/users/42/update",
        ]
    );
    assert_eq!(
        fake.call_count(Method::Post, "http://users.local/api/v1/admin/users/42"),
        0
    );
}
