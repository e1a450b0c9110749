//! Gateway configuration, read once at start-up from the environment.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use upstream::registry::services;
use upstream::{AuthToken, EndpointDescriptor, EndpointRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("report language `{0}` must be 2 to 8 ASCII letters")]
    InvalidLanguage(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Environment variables, lower-cased by the `config` crate.
#[derive(Debug, Deserialize)]
struct RawConfig {
    gateway_addr: String,

    user_management_url: String,
    property_listing_url: String,
    payment_url: String,
    search_filters_url: String,
    ai_recommendation_url: Option<String>,
    notification_url: Option<String>,

    user_token: String,
    property_token: String,
    payment_token: String,
    search_token: String,
    notification_token: String,
    ai_token: String,

    optional_services: String,
    redis_url: Option<String>,
    database_url: Option<String>,

    upstream_timeout_secs: u64,
    refresh_interval_secs: u64,
    health_ttl_secs: u64,
    metrics_ttl_secs: u64,
    report_ttl_secs: u64,
    stale_grace_secs: u64,

    report_langs: String,
    cors_origin_suffix: String,
}

/// One upstream as configured, before validation.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: &'static str,
    pub url: String,
    pub token: AuthToken,
    /// Bitwarden secret id that may override `token`.
    pub token_secret_id: &'static str,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: String,
    pub upstreams: Vec<UpstreamConfig>,
    pub optional_services: Vec<String>,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub upstream_timeout: Duration,
    pub refresh_interval: Duration,
    pub health_ttl: Duration,
    pub metrics_ttl: Duration,
    pub report_ttl: Duration,
    pub stale_grace: Duration,
    pub report_langs: Vec<String>,
    pub cors_origin_suffix: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(None)
    }

    /// Build from an explicit variable map instead of the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_source(Some(vars))
    }

    fn from_source(vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let raw: RawConfig = config::Config::builder()
            .set_default("gateway_addr", "0.0.0.0:8080")?
            .set_default("user_token", "")?
            .set_default("property_token", "")?
            .set_default("payment_token", "")?
            .set_default("search_token", "")?
            .set_default("notification_token", "")?
            .set_default("ai_token", "")?
            .set_default("optional_services", "ai_recommendation,notification")?
            .set_default("upstream_timeout_secs", 5)?
            .set_default("refresh_interval_secs", 300)?
            .set_default("health_ttl_secs", 60)?
            .set_default("metrics_ttl_secs", 120)?
            .set_default("report_ttl_secs", 3600)?
            .set_default("stale_grace_secs", 600)?
            .set_default("report_langs", "en,am")?
            .set_default("cors_origin_suffix", ".huggingface.co")?
            .add_source(config::Environment::default().source(vars))
            .build()?
            .try_deserialize()?;

        let report_langs = split_list(&raw.report_langs)
            .into_iter()
            .map(|lang| normalize_lang(&lang))
            .collect::<Result<Vec<_>, _>>()?;

        let mut upstreams = vec![
            upstream(services::USER_MANAGEMENT, raw.user_management_url, raw.user_token, "user-token"),
            upstream(services::PROPERTY_LISTING, raw.property_listing_url, raw.property_token, "property-token"),
            upstream(services::PAYMENT_PROCESSING, raw.payment_url, raw.payment_token, "payment-token"),
            upstream(services::SEARCH_FILTERS, raw.search_filters_url, raw.search_token, "search-token"),
        ];
        if let Some(url) = non_empty(raw.ai_recommendation_url) {
            upstreams.push(upstream(services::AI_RECOMMENDATION, url, raw.ai_token, "ai-token"));
        }
        if let Some(url) = non_empty(raw.notification_url) {
            upstreams.push(upstream(
                services::NOTIFICATION,
                url,
                raw.notification_token,
                "notification-token",
            ));
        }

        Ok(Self {
            addr: raw.gateway_addr,
            upstreams,
            optional_services: split_list(&raw.optional_services),
            redis_url: non_empty(raw.redis_url),
            database_url: non_empty(raw.database_url),
            upstream_timeout: Duration::from_secs(raw.upstream_timeout_secs.max(1)),
            refresh_interval: Duration::from_secs(raw.refresh_interval_secs.max(1)),
            health_ttl: Duration::from_secs(raw.health_ttl_secs),
            metrics_ttl: Duration::from_secs(raw.metrics_ttl_secs),
            report_ttl: Duration::from_secs(raw.report_ttl_secs),
            stale_grace: Duration::from_secs(raw.stale_grace_secs),
            report_langs,
            cors_origin_suffix: raw.cors_origin_suffix,
        })
    }

    pub fn is_optional(&self, name: &str) -> bool {
        self.optional_services.iter().any(|s| s == name)
    }

    /// Validate every configured upstream into the registry.
    pub fn registry(&self) -> Result<EndpointRegistry, ConfigError> {
        let endpoints = self
            .upstreams
            .iter()
            .map(|u| EndpointDescriptor::new(u.name, &u.url, u.token.clone(), self.is_optional(u.name)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EndpointRegistry::new(endpoints)?)
    }
}

fn upstream(name: &'static str, url: String, token: String, token_secret_id: &'static str) -> UpstreamConfig {
    UpstreamConfig {
        name,
        url,
        token: AuthToken::new(token),
        token_secret_id,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lower-cased language code, 2 to 8 ASCII letters.
pub fn normalize_lang(lang: &str) -> Result<String, ConfigError> {
    let lang = lang.trim();
    if (2..=8).contains(&lang.len()) && lang.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(lang.to_ascii_lowercase())
    } else {
        Err(ConfigError::InvalidLanguage(lang.to_string()))
    }
}
