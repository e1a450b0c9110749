//! Totals across services, each field served by a fallback chain of sources.
//!
//! Upstreams disagree about where their numbers live. A field is asked of its
//! sources in order and the first one that yields a value wins:
//!
//! | Kind           | Request                               | Reads                                  |
//! |----------------|---------------------------------------|----------------------------------------|
//! | `summary`      | GET metrics endpoint                  | JSON number field or exposition family |
//! | `header_count` | GET list endpoint, `limit=1`          | `X-Total-Count` / wrapper `total`      |
//! | `list_sample`  | GET list endpoint, `limit=1000`       | local count, grouped by a status field |
//!
//! A chain with no answering source reports `0` and source `none`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::exposition;
use crate::fetcher::{AttemptOutcome, FetchRequest, Fetcher, ResponseBody};
use crate::health::{HealthAggregator, HealthReport};
use crate::registry::{services, EndpointDescriptor, EndpointRegistry};

/// Page size used when counting locally.
pub const SAMPLE_LIMIT: u32 = 1000;

const WRAPPER_TOTAL_FIELDS: &[&str] = &["total", "count", "total_count"];
const UNKNOWN_STATUS: &str = "unknown";

// ------------------------------------------------------------------ //
//  Source description                                                 //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathScope {
    /// Relative to the configured base URL as-is.
    Base,
    /// Relative to the `/api/v1` base.
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Users,
    Properties,
    Payments,
}

impl MetricField {
    pub fn total_key(self) -> &'static str {
        match self {
            MetricField::Users => "total_users",
            MetricField::Properties => "total_properties",
            MetricField::Payments => "total_payments",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Summary,
    HeaderCount,
    ListSample,
    None,
}

#[derive(Debug, Clone)]
pub enum MetricSource {
    /// Dedicated metrics endpoint. `fields` are JSON keys, or metric family
    /// names when the body is text exposition.
    Summary {
        service: &'static str,
        scope: PathScope,
        path: &'static str,
        fields: &'static [&'static str],
    },
    HeaderCount {
        service: &'static str,
        path: &'static str,
    },
    ListSample {
        service: &'static str,
        path: &'static str,
        status_fields: &'static [&'static str],
    },
}

impl MetricSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            MetricSource::Summary { .. } => SourceKind::Summary,
            MetricSource::HeaderCount { .. } => SourceKind::HeaderCount,
            MetricSource::ListSample { .. } => SourceKind::ListSample,
        }
    }

    fn service(&self) -> &'static str {
        match self {
            MetricSource::Summary { service, .. }
            | MetricSource::HeaderCount { service, .. }
            | MetricSource::ListSample { service, .. } => service,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricChain {
    pub field: MetricField,
    pub sources: Vec<MetricSource>,
}

/// Chains used by the gateway.
pub fn default_chains() -> Vec<MetricChain> {
    const STATUS_FIELDS: &[&str] = &["status", "state", "is_active"];
    vec![
        MetricChain {
            field: MetricField::Users,
            sources: vec![
                MetricSource::Summary {
                    service: services::USER_MANAGEMENT,
                    scope: PathScope::Api,
                    path: "/admin/users/metrics",
                    fields: &["total_users", "total", "count"],
                },
                MetricSource::HeaderCount {
                    service: services::USER_MANAGEMENT,
                    path: "/users",
                },
                MetricSource::ListSample {
                    service: services::USER_MANAGEMENT,
                    path: "/users",
                    status_fields: STATUS_FIELDS,
                },
            ],
        },
        MetricChain {
            field: MetricField::Properties,
            sources: vec![
                MetricSource::Summary {
                    service: services::PROPERTY_LISTING,
                    scope: PathScope::Api,
                    path: "/properties/metrics",
                    fields: &["total_properties", "total", "count"],
                },
                MetricSource::HeaderCount {
                    service: services::PROPERTY_LISTING,
                    path: "/properties",
                },
                MetricSource::ListSample {
                    service: services::PROPERTY_LISTING,
                    path: "/properties",
                    status_fields: &["status", "state", "listing_status"],
                },
            ],
        },
        MetricChain {
            field: MetricField::Payments,
            sources: vec![
                MetricSource::Summary {
                    service: services::PAYMENT_PROCESSING,
                    scope: PathScope::Base,
                    path: "/metrics",
                    fields: &[
                        "payments_total",
                        "total_payments",
                        "payment_transactions_total",
                        "total",
                    ],
                },
                MetricSource::HeaderCount {
                    service: services::PAYMENT_PROCESSING,
                    path: "/payments",
                },
                MetricSource::ListSample {
                    service: services::PAYMENT_PROCESSING,
                    path: "/payments",
                    status_fields: &["status", "state", "payment_status"],
                },
            ],
        },
    ]
}

// ------------------------------------------------------------------ //
//  Result types                                                       //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    pub total: u64,
    pub by_status: Option<BTreeMap<String, u64>>,
    pub source: SourceKind,
}

impl MetricValue {
    fn missing() -> Self {
        Self {
            total: 0,
            by_status: None,
            source: SourceKind::None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsTotals {
    pub total_users: u64,
    pub total_properties: u64,
    pub total_payments: u64,
    pub total_services: usize,
    pub healthy_services: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_by_status: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties_by_status: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments_by_status: Option<BTreeMap<String, u64>>,
    /// `total_*` field → source kind that served it.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceKind>,
}

impl MetricsTotals {
    fn set(&mut self, field: MetricField, value: MetricValue) {
        self.sources.insert(field.total_key().to_string(), value.source);
        match field {
            MetricField::Users => {
                self.total_users = value.total;
                self.users_by_status = value.by_status;
            }
            MetricField::Properties => {
                self.total_properties = value.total;
                self.properties_by_status = value.by_status;
            }
            MetricField::Payments => {
                self.total_payments = value.total;
                self.payments_by_status = value.by_status;
            }
        }
    }
}

// ------------------------------------------------------------------ //
//  Aggregator                                                         //
// ------------------------------------------------------------------ //

#[derive(Clone)]
pub struct MetricsAggregator {
    registry: EndpointRegistry,
    fetcher: Fetcher,
    chains: Arc<[MetricChain]>,
}

impl MetricsAggregator {
    pub fn new(registry: EndpointRegistry, fetcher: Fetcher) -> Self {
        Self::with_chains(registry, fetcher, default_chains())
    }

    pub fn with_chains(registry: EndpointRegistry, fetcher: Fetcher, chains: Vec<MetricChain>) -> Self {
        Self {
            registry,
            fetcher,
            chains: chains.into(),
        }
    }

    /// Probe health and evaluate every chain, all at once.
    pub async fn aggregate_totals(&self) -> MetricsTotals {
        let health = HealthAggregator::new(self.registry.clone(), self.fetcher.clone());
        let (report, totals) = tokio::join!(health.aggregate(false), self.evaluate_chains());
        self.finish(totals, &report)
    }

    /// Same as [`aggregate_totals`](Self::aggregate_totals) with an existing
    /// health report.
    pub async fn aggregate_totals_with(&self, health: &HealthReport) -> MetricsTotals {
        let totals = self.evaluate_chains().await;
        self.finish(totals, health)
    }

    fn finish(&self, mut totals: MetricsTotals, health: &HealthReport) -> MetricsTotals {
        totals.total_services = self.registry.len();
        totals.healthy_services = health.summary().ok;
        info!(
            users = totals.total_users,
            properties = totals.total_properties,
            payments = totals.total_payments,
            healthy = totals.healthy_services,
            "metrics aggregated"
        );
        totals
    }

    async fn evaluate_chains(&self) -> MetricsTotals {
        let mut set = JoinSet::new();
        for index in 0..self.chains.len() {
            let this = self.clone();
            set.spawn(async move {
                let chain = &this.chains[index];
                (chain.field, this.evaluate_chain(chain).await)
            });
        }

        let mut totals = MetricsTotals::default();
        for chain in self.chains.iter() {
            totals.set(chain.field, MetricValue::missing());
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((field, value)) => totals.set(field, value),
                Err(e) => error!(error = %e, "metric chain task failed"),
            }
        }
        totals
    }

    async fn evaluate_chain(&self, chain: &MetricChain) -> MetricValue {
        for source in &chain.sources {
            let Some(endpoint) = self.registry.get(source.service()) else {
                debug!(service = source.service(), "metric source service not registered");
                continue;
            };
            if let Some(value) = self.evaluate_source(endpoint, source).await {
                debug!(field = chain.field.total_key(), source = ?value.source, total = value.total, "metric resolved");
                return value;
            }
        }
        info!(field = chain.field.total_key(), "no metric source answered");
        MetricValue::missing()
    }

    async fn evaluate_source(&self, endpoint: &EndpointDescriptor, source: &MetricSource) -> Option<MetricValue> {
        let (url, limit) = match source {
            MetricSource::Summary {
                scope: PathScope::Base,
                path,
                ..
            } => (endpoint.url(path), None),
            MetricSource::Summary {
                scope: PathScope::Api,
                path,
                ..
            } => (endpoint.api_url(path), None),
            MetricSource::HeaderCount { path, .. } => (endpoint.api_url(path), Some(1)),
            MetricSource::ListSample { path, .. } => (endpoint.api_url(path), Some(SAMPLE_LIMIT)),
        };

        let mut request = FetchRequest::get(url);
        if let Some(limit) = limit {
            request = request.with_query("limit", limit);
        }
        let outcome = self.fetcher.fetch(endpoint, request).await;
        if !outcome.is_success() {
            return None;
        }

        let (total, by_status) = match source {
            MetricSource::Summary { fields, .. } => read_summary(&outcome.body, fields)?,
            MetricSource::HeaderCount { .. } => (read_header_count(&outcome)?, None),
            MetricSource::ListSample { status_fields, .. } => read_sample(&outcome.body, status_fields)?,
        };
        Some(MetricValue {
            total,
            by_status,
            source: source.kind(),
        })
    }
}

// ------------------------------------------------------------------ //
//  Readers                                                            //
// ------------------------------------------------------------------ //

type Reading = (u64, Option<BTreeMap<String, u64>>);

fn read_summary(body: &ResponseBody, fields: &[&str]) -> Option<Reading> {
    match body {
        ResponseBody::Json(value) => {
            let total = body.number_field(fields)?;
            let by_status = value
                .get("by_status")
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                        .collect::<BTreeMap<_, _>>()
                })
                .filter(|m| !m.is_empty());
            Some((total, by_status))
        }
        ResponseBody::Text(text) => {
            let samples = exposition::parse(text);
            fields.iter().find_map(|family| {
                let total = exposition::sum(&samples, family)?;
                let groups = exposition::group_by_label(&samples, family, "status");
                let by_status = (!groups.is_empty()).then(|| {
                    groups
                        .into_iter()
                        .map(|(k, v)| (k, v.max(0.0) as u64))
                        .collect()
                });
                Some((total.max(0.0) as u64, by_status))
            })
        }
        ResponseBody::None => None,
    }
}

fn read_header_count(outcome: &AttemptOutcome) -> Option<u64> {
    outcome.total_count_header().or_else(|| match outcome.body.as_json() {
        Some(Value::Object(_)) => outcome.body.number_field(WRAPPER_TOTAL_FIELDS),
        _ => None,
    })
}

fn read_sample(body: &ResponseBody, status_fields: &[&str]) -> Option<Reading> {
    body.as_json()?;
    let records = body.records();
    let mut groups = BTreeMap::new();
    for record in &records {
        *groups.entry(status_of(record, status_fields)).or_insert(0u64) += 1;
    }
    let by_status = (!groups.is_empty()).then_some(groups);
    Some((records.len() as u64, by_status))
}

fn status_of(record: &Value, status_fields: &[&str]) -> String {
    status_fields
        .iter()
        .find_map(|field| match record.get(*field)? {
            Value::Null => None,
            Value::String(s) => Some(s.to_lowercase()),
            other => Some(other.to_string()),
        })
        .unwrap_or_else(|| UNKNOWN_STATUS.to_string())
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
