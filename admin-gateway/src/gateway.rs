//! The gateway's operations over the upstream layer and the cache.
//!
//! Aggregate reads (health, metrics totals, user report) go through the
//! cache. User updates are mutating and always hit the upstream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use refresh_cache::{keys, CacheError, CacheManager};
use serde_json::{Map, Value};
use tracing::warn;
use upstream::metrics::SAMPLE_LIMIT;
use upstream::registry::services;
use upstream::{
    AttemptOutcome, EndpointRegistry, Fetcher, HealthAggregator, HealthReport, LogicalOp,
    MetricsAggregator, MetricsTotals, PatternResolver, ResolveRequest,
};

use crate::config::normalize_lang;
use crate::error::GatewayError;
use crate::reports::UserReport;

const USERS_COLLECTION: &str = "admin/users";
const WRAPPER_TOTAL_FIELDS: &[&str] = &["total", "count", "total_count"];
const DEFAULT_REPORT_LANG: &str = "en";

#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub health: Duration,
    pub metrics: Duration,
    pub report: Duration,
}

#[derive(Clone)]
pub struct GatewayServices {
    registry: EndpointRegistry,
    health: HealthAggregator,
    metrics: MetricsAggregator,
    resolver: PatternResolver,
    cache: Arc<CacheManager>,
    ttls: CacheTtls,
    report_langs: Arc<[String]>,
}

impl GatewayServices {
    pub fn new(registry: EndpointRegistry, fetcher: Fetcher, cache: Arc<CacheManager>, ttls: CacheTtls) -> Self {
        Self {
            health: HealthAggregator::new(registry.clone(), fetcher.clone()),
            metrics: MetricsAggregator::new(registry.clone(), fetcher.clone()),
            resolver: PatternResolver::new(fetcher),
            registry,
            cache,
            ttls,
            report_langs: Arc::from([DEFAULT_REPORT_LANG.to_string()]),
        }
    }

    /// Languages that get their own cached user report. Any other language
    /// is served the default one.
    pub fn with_report_langs(mut self, langs: &[String]) -> Self {
        self.report_langs = langs.iter().cloned().collect();
        self
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &PatternResolver {
        &self.resolver
    }

    // ---------------------------------------------------------------- //
    //  Health / metrics                                                 //
    // ---------------------------------------------------------------- //

    pub async fn health_report(&self, verbose: bool) -> Result<HealthReport, GatewayError> {
        let health = &self.health;
        let report = self
            .cache
            .get_or_compute(keys::health_report(verbose), self.ttls.health, || async move {
                Ok(health.aggregate(verbose).await)
            })
            .await?;
        Ok(report)
    }

    pub async fn refresh_health(&self) -> Result<(), CacheError> {
        let health = &self.health;
        self.cache
            .refresh(keys::HEALTH_REPORT, self.ttls.health, || async move {
                Ok(health.aggregate(false).await)
            })
            .await
            .map(|_: HealthReport| ())
    }

    /// Totals reuse the cached health report for the service counts.
    pub async fn metrics_totals(&self) -> Result<MetricsTotals, GatewayError> {
        let totals = self
            .cache
            .get_or_compute(keys::METRICS_TOTALS, self.ttls.metrics, || async {
                let health = self.health_report(false).await?;
                Ok::<_, anyhow::Error>(self.metrics.aggregate_totals_with(&health).await)
            })
            .await?;
        Ok(totals)
    }

    // ---------------------------------------------------------------- //
    //  User report                                                      //
    // ---------------------------------------------------------------- //

    /// Cached per configured language. When the user listing cannot be
    /// fetched and nothing is cached, an all-zero report is returned (and not
    /// cached).
    pub async fn user_report(&self, lang: &str) -> Result<UserReport, GatewayError> {
        let lang = normalize_lang(lang).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        let lang = if self.report_langs.contains(&lang) {
            lang
        } else {
            DEFAULT_REPORT_LANG.to_string()
        };
        let key = keys::user_report(&lang);

        match self
            .cache
            .get_or_compute(&key, self.ttls.report, || self.compute_user_report(&lang))
            .await
        {
            Ok(report) => Ok(report),
            Err(CacheError::Compute { cause, .. }) => {
                warn!(lang, error = %format!("{cause:#}"), "user listing unavailable, serving empty report");
                Ok(UserReport::empty(&lang, Utc::now()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn refresh_user_report(&self, lang: &str) -> Result<(), CacheError> {
        self.cache
            .refresh(&keys::user_report(lang), self.ttls.report, || self.compute_user_report(lang))
            .await
            .map(|_| ())
    }

    async fn compute_user_report(&self, lang: &str) -> anyhow::Result<UserReport> {
        let endpoint = self.registry.require(services::USER_MANAGEMENT)?;
        let outcome = self
            .resolver
            .resolve(
                endpoint,
                ResolveRequest::new(LogicalOp::ListUsers)
                    .field("limit", SAMPLE_LIMIT)
                    .field("skip", 0),
            )
            .await
            .context("listing users")?;

        let advertised = outcome.total_count_header().or_else(|| match outcome.body.as_json() {
            Some(Value::Object(_)) => outcome.body.number_field(WRAPPER_TOTAL_FIELDS),
            _ => None,
        });
        Ok(UserReport::from_listing(&outcome.body, advertised, lang, Utc::now()))
    }

    // ---------------------------------------------------------------- //
    //  Mutations                                                        //
    // ---------------------------------------------------------------- //

    /// Apply `fields` to user `user_id`, whatever verb the service accepts.
    ///
    /// Not idempotent: a request shape that looked rejected may still have
    /// been applied upstream before the next shape is tried.
    pub async fn update_user(&self, user_id: &str, fields: Map<String, Value>) -> Result<AttemptOutcome, GatewayError> {
        let endpoint = self.registry.require(services::USER_MANAGEMENT)?;
        let outcome = self
            .resolver
            .resolve(
                endpoint,
                ResolveRequest::new(LogicalOp::UpdateEntity {
                    collection: USERS_COLLECTION,
                })
                .entity(user_id)
                .fields(fields),
            )
            .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use upstream::transport::{FakeReply, FakeTransport};
    use upstream::Method;

    use super::*;
    use crate::testing;

    const USERS: &str = "http://users.local/api/v1/admin/users";

    #[tokio::test]
    async fn user_report_is_cached_per_language() {
        let fake = FakeTransport::new();
        fake.route(
            Method::Get,
            USERS,
            FakeReply::json(200, json!({"data": [{"is_active": true}, {"is_active": false}], "total": 2})),
        );
        let gateway = testing::services(&fake);

        let en = gateway.user_report("EN").await.unwrap();
        assert_eq!(en.lang, "en");
        assert_eq!(en.total_users, 2);
        assert_eq!(en.active_users, 1);
        gateway.user_report("en").await.unwrap();
        assert_eq!(fake.call_count(Method::Get, USERS), 1);

        let am = gateway.user_report("am").await.unwrap();
        assert_eq!(am.title, "የተጠቃሚ መረጃ ሪፖርት");
        assert_eq!(fake.call_count(Method::Get, USERS), 2);
    }

    #[tokio::test]
    async fn user_report_falls_back_to_public_listing() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, USERS, FakeReply::status(404));
        fake.route(
            Method::Get,
            "http://users.local/api/v1/users",
            FakeReply::json(200, json!([{"id": 1}])).with_header("X-Total-Count", "9"),
        );

        let report = testing::services(&fake).user_report("en").await.unwrap();
        assert_eq!(report.total_users, 9);
    }

    #[tokio::test]
    async fn unavailable_listing_gives_empty_report() {
        let fake = FakeTransport::new();
        let gateway = testing::services(&fake);

        let report = gateway.user_report("en").await.unwrap();
        assert_eq!(report.total_users, 0);
        assert_eq!(report.title, "User Report");

        let err = gateway.user_report("e-n").await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unconfigured_language_gets_default_report() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, USERS, FakeReply::json(200, json!([{"is_active": true}])));
        let gateway = testing::services(&fake);

        let en = gateway.user_report("en").await.unwrap();
        for lang in ["fr", "de", "xyzzy"] {
            let report = gateway.user_report(lang).await.unwrap();
            assert_eq!(report.lang, "en");
            assert_eq!(report.generated_at, en.generated_at);
        }
        assert_eq!(fake.call_count(Method::Get, USERS), 1);
    }

    #[tokio::test]
    async fn update_targets_admin_user_route() {
        let fake = FakeTransport::new();
        fake.route(
            Method::Put,
            "http://users.local/api/v1/admin/users/42",
            FakeReply::json(200, json!({"id": "42"})),
        );
        let gateway = testing::services(&fake);

        let mut fields = Map::new();
        fields.insert("role".into(), json!("agent"));
        let outcome = gateway.update_user("42", fields).await.unwrap();

        assert_eq!(outcome.tried_strings(), vec!["PUT http://users.local/api/v1/admin/users/42"]);
        assert_eq!(fake.call_count(Method::Put, "http://users.local/api/v1/users/42"), 0);
    }

    #[tokio::test]
    async fn metrics_reuse_cached_health() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, "http://users.local/api/v1/health", FakeReply::status(200));
        let gateway = testing::services(&fake);

        let health = gateway.health_report(false).await.unwrap();
        let totals = gateway.metrics_totals().await.unwrap();
        assert_eq!(totals.healthy_services, health.summary().ok);
        assert_eq!(totals.total_services, gateway.registry().len());
        assert_eq!(fake.call_count(Method::Get, "http://users.local/api/v1/health"), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_cached_health() {
        let fake = FakeTransport::new();
        let gateway = testing::services(&fake);

        let before = gateway.health_report(false).await.unwrap();
        assert_eq!(before.summary().ok, 0);

        fake.route(Method::Get, "http://users.local/api/v1/health", FakeReply::status(200));
        gateway.refresh_health().await.unwrap();
        let after = gateway.health_report(false).await.unwrap();
        assert_eq!(after.summary().ok, 1);
    }
}
