//! System-wide health from per-service probes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::fetcher::{AttemptOutcome, Classification, FetchRequest, Fetcher};
use crate::registry::{EndpointDescriptor, EndpointRegistry};

/// Statuses meaning "this host has no health route".
const NO_HEALTH_ROUTE: &[u16] = &[404, 405, 501];

// ------------------------------------------------------------------ //
//  Types                                                              //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub optional: bool,
    pub classification: Classification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServiceHealth {
    fn from_outcome(endpoint: &EndpointDescriptor, outcome: &AttemptOutcome, verbose: bool) -> Self {
        Self {
            name: endpoint.name().to_string(),
            optional: endpoint.is_optional(),
            classification: outcome.classification,
            status_code: outcome.status_code,
            error: outcome.error.clone(),
            tried: verbose.then(|| outcome.tried_strings()),
            data: outcome.body.to_value(),
        }
    }

    fn lost(endpoint: &EndpointDescriptor, reason: String) -> Self {
        Self::failed(endpoint, Classification::Unreachable, reason)
    }

    fn failed(endpoint: &EndpointDescriptor, classification: Classification, reason: String) -> Self {
        Self {
            name: endpoint.name().to_string(),
            optional: endpoint.is_optional(),
            classification,
            status_code: None,
            error: Some(reason),
            tried: None,
            data: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.classification.is_success()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub ok: usize,
    pub errors: usize,
    pub total: usize,
    /// Failing optional services.
    pub optional_ignored: usize,
}

/// Aggregate health document.
///
/// `overall_status` and `summary` are always derived from `services`, also
/// when the report is read back from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "HealthReportWire")]
pub struct HealthReport {
    services: BTreeMap<String, ServiceHealth>,
    overall_status: OverallStatus,
    summary: HealthSummary,
    checked_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct HealthReportWire {
    services: BTreeMap<String, ServiceHealth>,
    checked_at: DateTime<Utc>,
}

impl From<HealthReportWire> for HealthReport {
    fn from(wire: HealthReportWire) -> Self {
        HealthReport::new(wire.services, wire.checked_at)
    }
}

impl HealthReport {
    pub fn new(services: BTreeMap<String, ServiceHealth>, checked_at: DateTime<Utc>) -> Self {
        let overall_status = derive_overall(services.values());
        let summary = summarize(services.values());
        Self {
            services,
            overall_status,
            summary,
            checked_at,
        }
    }

    pub fn services(&self) -> &BTreeMap<String, ServiceHealth> {
        &self.services
    }

    pub fn overall_status(&self) -> OverallStatus {
        self.overall_status
    }

    pub fn summary(&self) -> HealthSummary {
        self.summary
    }

    pub fn checked_at(&self) -> DateTime<Utc> {
        self.checked_at
    }
}

/// `down` if a required service fails, `degraded` if only optional ones do.
pub fn derive_overall<'a>(services: impl IntoIterator<Item = &'a ServiceHealth>) -> OverallStatus {
    let mut overall = OverallStatus::Ok;
    for service in services {
        if service.is_healthy() {
            continue;
        }
        if !service.optional {
            return OverallStatus::Down;
        }
        overall = OverallStatus::Degraded;
    }
    overall
}

pub fn summarize<'a>(services: impl IntoIterator<Item = &'a ServiceHealth>) -> HealthSummary {
    let mut summary = HealthSummary::default();
    for service in services {
        summary.total += 1;
        if service.is_healthy() {
            summary.ok += 1;
        } else {
            summary.errors += 1;
            if service.optional {
                summary.optional_ignored += 1;
            }
        }
    }
    summary
}

// ------------------------------------------------------------------ //
//  Aggregator                                                         //
// ------------------------------------------------------------------ //

#[derive(Clone)]
pub struct HealthAggregator {
    registry: EndpointRegistry,
    fetcher: Fetcher,
}

impl HealthAggregator {
    pub fn new(registry: EndpointRegistry, fetcher: Fetcher) -> Self {
        Self { registry, fetcher }
    }

    /// Probe every endpoint concurrently and merge the results.
    ///
    /// Each probe chain, fallback included, shares one fetcher timeout, so
    /// the report never takes longer than a single call could.
    pub async fn aggregate(&self, verbose: bool) -> HealthReport {
        let mut probes = JoinSet::new();
        for endpoint in self.registry.iter() {
            let endpoint = endpoint.clone();
            let fetcher = self.fetcher.clone();
            probes.spawn(async move {
                let budget = fetcher.timeout();
                match tokio::time::timeout(budget, probe(&fetcher, &endpoint, verbose)).await {
                    Ok(health) => health,
                    Err(_) => ServiceHealth::failed(
                        &endpoint,
                        Classification::Timeout,
                        format!("health probes exceeded {}ms", budget.as_millis()),
                    ),
                }
            });
        }

        let mut services = BTreeMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(health) => {
                    services.insert(health.name.clone(), health);
                }
                Err(e) => error!(error = %e, "health probe task failed"),
            }
        }

        // A probe that died still has to show up as a failure.
        for endpoint in self.registry.iter() {
            if !services.contains_key(endpoint.name()) {
                services.insert(
                    endpoint.name().to_string(),
                    ServiceHealth::lost(endpoint, "health probe did not complete".to_string()),
                );
            }
        }

        let report = HealthReport::new(services, Utc::now());
        info!(
            overall = ?report.overall_status(),
            ok = report.summary().ok,
            errors = report.summary().errors,
            "health aggregated"
        );
        report
    }
}

/// `{base}/health`, then `{root}/health` when the base carries `/api/v1`.
///
/// A host answering every probe with "no such route" is reachable, which
/// counts as healthy.
async fn probe(fetcher: &Fetcher, endpoint: &EndpointDescriptor, verbose: bool) -> ServiceHealth {
    let mut urls = vec![endpoint.url("/health")];
    if endpoint.has_api_prefix() {
        urls.push(format!("{}/health", endpoint.root_url()));
    }

    let mut tried = Vec::new();
    let mut all_missing = true;
    let mut last = None;

    for url in urls {
        let mut outcome = fetcher.fetch(endpoint, FetchRequest::get(url)).await;
        tried.append(&mut outcome.tried);
        outcome.tried = tried.clone();

        match outcome.classification {
            Classification::Success => return ServiceHealth::from_outcome(endpoint, &outcome, verbose),
            Classification::Unreachable | Classification::Timeout => {
                return ServiceHealth::from_outcome(endpoint, &outcome, verbose);
            }
            Classification::ClientRejected => {
                let status = outcome.status_code.unwrap_or_default();
                all_missing &= NO_HEALTH_ROUTE.contains(&status);
            }
        }
        last = Some(outcome);
    }

    match last {
        Some(outcome) if all_missing => {
            let mut health = ServiceHealth::from_outcome(endpoint, &outcome, verbose);
            health.classification = Classification::Success;
            health.data = Some(json!({ "status": "reachable" }));
            health
        }
        Some(outcome) => ServiceHealth::from_outcome(endpoint, &outcome, verbose),
        None => ServiceHealth::lost(endpoint, "no health probe configured".to_string()),
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::registry::AuthToken;
    use crate::transport::{FakeReply, FakeTransport, Method};

    fn service(name: &str, optional: bool, healthy: bool) -> ServiceHealth {
        ServiceHealth {
            name: name.to_string(),
            optional,
            classification: if healthy {
                Classification::Success
            } else {
                Classification::Unreachable
            },
            status_code: None,
            error: None,
            tried: None,
            data: None,
        }
    }

    fn endpoint(name: &str, url: &str, optional: bool) -> EndpointDescriptor {
        EndpointDescriptor::new(name, url, AuthToken::new("t"), optional).unwrap()
    }

    fn aggregator(fake: &FakeTransport, endpoints: Vec<EndpointDescriptor>) -> HealthAggregator {
        HealthAggregator::new(
            EndpointRegistry::new(endpoints).unwrap(),
            Fetcher::new(Arc::new(fake.clone()), Duration::from_secs(3)),
        )
    }

    /// Every success pattern over k optional and m required services.
    #[test]
    fn overall_status_truth_table() {
        for k in 0..=2usize {
            for m in 0..=2usize {
                for mask in 0..(1u32 << (k + m)) {
                    let healthy = |i: usize| mask & (1 << i) != 0;
                    let services: Vec<_> = (0..k)
                        .map(|i| service(&format!("opt{i}"), true, healthy(i)))
                        .chain((0..m).map(|i| service(&format!("req{i}"), false, healthy(k + i))))
                        .collect();

                    let required_failing = (0..m).any(|i| !healthy(k + i));
                    let all_ok = (0..k + m).all(healthy);
                    let expected = if required_failing {
                        OverallStatus::Down
                    } else if all_ok {
                        OverallStatus::Ok
                    } else {
                        OverallStatus::Degraded
                    };

                    assert_eq!(derive_overall(&services), expected, "k={k} m={m} mask={mask:b}");
                }
            }
        }
    }

    #[test]
    fn summary_counts_buckets() {
        let services = [
            service("a", false, true),
            service("b", false, false),
            service("c", true, false),
            service("d", true, true),
        ];
        assert_eq!(
            summarize(&services),
            HealthSummary {
                ok: 2,
                errors: 2,
                total: 4,
                optional_ignored: 1,
            }
        );
    }

    #[test]
    fn cached_report_recomputes_derived_fields() {
        let report = HealthReport::new(
            BTreeMap::from([("a".to_string(), service("a", false, false))]),
            Utc::now(),
        );
        let mut wire = serde_json::to_value(&report).unwrap();
        wire["overall_status"] = json!("ok");
        wire["summary"]["ok"] = json!(99);

        let back: HealthReport = serde_json::from_value(wire).unwrap();
        assert_eq!(back.overall_status(), OverallStatus::Down);
        assert_eq!(back.summary().ok, 0);
        assert_eq!(back, report);
    }

    #[tokio::test]
    async fn missing_health_route_means_reachable() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, "http://a/api/v1/health", FakeReply::status(404));
        fake.route(Method::Get, "http://a/health", FakeReply::status(404));

        let report = aggregator(&fake, vec![endpoint("a", "http://a/api/v1", false)])
            .aggregate(true)
            .await;

        let a = &report.services()["a"];
        assert_eq!(a.classification, Classification::Success);
        assert_eq!(a.data, Some(json!({"status": "reachable"})));
        assert_eq!(a.tried.as_ref().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn root_health_used_when_api_prefixed_probe_fails() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, "http://a/api/v1/health", FakeReply::status(500));
        fake.route(Method::Get, "http://a/health", FakeReply::text(200, "OK"));

        let report = aggregator(&fake, vec![endpoint("a", "http://a/api/v1", false)])
            .aggregate(false)
            .await;

        let a = &report.services()["a"];
        assert!(a.is_healthy());
        assert_eq!(a.data, Some(json!({"message": "OK"})));
        assert_eq!(a.tried, None);
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, "http://a/health", FakeReply::status(503));

        let report = aggregator(&fake, vec![endpoint("a", "http://a", false)])
            .aggregate(false)
            .await;

        assert_eq!(report.services()["a"].classification, Classification::ClientRejected);
        assert_eq!(report.services()["a"].status_code, Some(503));
        assert_eq!(report.overall_status(), OverallStatus::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_does_not_hold_back_the_rest() {
        let fake = FakeTransport::new();
        fake.route(Method::Get, "http://fast/health", FakeReply::json(200, json!({"status": "ok"})));
        fake.route(Method::Get, "http://slow/health", FakeReply::Hang);

        let started = tokio::time::Instant::now();
        let report = aggregator(
            &fake,
            vec![endpoint("fast", "http://fast", false), endpoint("slow", "http://slow", true)],
        )
        .aggregate(false)
        .await;

        assert!(started.elapsed() <= Duration::from_secs(4));
        assert_eq!(report.services()["slow"].classification, Classification::Timeout);
        assert_eq!(report.overall_status(), OverallStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn root_fallback_shares_the_probe_timeout() {
        let fake = FakeTransport::new();
        fake.route(
            Method::Get,
            "http://a/api/v1/health",
            FakeReply::status(503).delayed(Duration::from_millis(2900)),
        );
        fake.route(Method::Get, "http://a/health", FakeReply::Hang);

        let started = tokio::time::Instant::now();
        let report = aggregator(&fake, vec![endpoint("a", "http://a/api/v1", false)])
            .aggregate(true)
            .await;

        assert!(started.elapsed() < Duration::from_millis(3100));
        assert_eq!(fake.call_count(Method::Get, "http://a/health"), 1);
        assert_eq!(report.services()["a"].classification, Classification::Timeout);
        assert_eq!(report.overall_status(), OverallStatus::Down);
    }
}
