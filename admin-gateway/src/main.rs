//! Admin gateway: HTTP API in front of the platform's upstream services.
//!
//! Aggregates health and metrics across the upstreams, builds user reports
//! and forwards user updates through the request-shape resolver. Aggregate
//! views are cached (Redis when configured) and hot keys are refreshed in
//! the background.
//!
//! # Configuration
//! Upstream tokens are resolved via Bitwarden Secrets Manager (when
//! `BWS_ACCESS_TOKEN` is set) or plain environment variables.
//!
//! | Env var                                         | Default                          |
//! |-------------------------------------------------|----------------------------------|
//! | `GATEWAY_ADDR`                                  | `0.0.0.0:8080`                   |
//! | `USER_MANAGEMENT_URL`                           | required                         |
//! | `PROPERTY_LISTING_URL`                          | required                         |
//! | `PAYMENT_URL`                                   | required                         |
//! | `SEARCH_FILTERS_URL`                            | required                         |
//! | `AI_RECOMMENDATION_URL`, `NOTIFICATION_URL`     | unset (service not registered)   |
//! | `USER_TOKEN`, `PROPERTY_TOKEN`, `PAYMENT_TOKEN` | empty                            |
//! | `SEARCH_TOKEN`, `NOTIFICATION_TOKEN`, `AI_TOKEN`| empty                            |
//! | `OPTIONAL_SERVICES`                             | `ai_recommendation,notification` |
//! | `REDIS_URL`                                     | unset (in-memory cache)          |
//! | `DATABASE_URL`                                  | unset (audit to log only)        |
//! | `UPSTREAM_TIMEOUT_SECS`                         | `5`                              |
//! | `REFRESH_INTERVAL_SECS`                         | `300`                            |
//! | `HEALTH_TTL_SECS` / `METRICS_TTL_SECS`          | `60` / `120`                     |
//! | `REPORT_TTL_SECS`                               | `3600`                           |
//! | `STALE_GRACE_SECS`                              | `600`                            |
//! | `REPORT_LANGS`                                  | `en,am`                          |
//! | `CORS_ORIGIN_SUFFIX`                            | `.huggingface.co`                |

use std::sync::Arc;

use admin_gateway::{
    audit::{AuditLog, LogAuditLog, PgAuditLog},
    auth::UpstreamVerifier,
    config::GatewayConfig,
    gateway::{CacheTtls, GatewayServices},
    refresh,
    secrets::SecretsClient,
    state::AppState,
};
use anyhow::Result;
use refresh_cache::{spawn_refresh_loop, CacheManager, CacheStore, Clock, MemoryStore, RedisStore, SystemClock};
use tracing::{info, warn};
use upstream::registry::services;
use upstream::{Fetcher, ReqwestTransport};

// ------------------------------------------------------------------ //
//  Entry point                                                        //
// ------------------------------------------------------------------ //

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("admin_gateway=info".parse()?),
        )
        .json()
        .init();

    let mut config = GatewayConfig::from_env()?;
    SecretsClient::from_env()
        .resolve_upstream_tokens(&mut config)
        .await;

    let registry = config.registry()?;
    for endpoint in registry.iter() {
        info!(
            service = endpoint.name(),
            base_url = endpoint.base_url(),
            optional = endpoint.is_optional(),
            "upstream registered"
        );
    }

    let transport = ReqwestTransport::new(config.upstream_timeout)?;
    let fetcher = Fetcher::new(Arc::new(transport), config.upstream_timeout);

    // Redis when configured and reachable, process memory otherwise.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CacheStore> = match config.redis_url.as_deref() {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!("Redis cache connected");
                Arc::new(store)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-memory cache");
                Arc::new(MemoryStore::new(clock.clone()))
            }
        },
        None => Arc::new(MemoryStore::new(clock.clone())),
    };
    let cache = Arc::new(CacheManager::new(store, clock, config.stale_grace));

    let gateway = GatewayServices::new(
        registry,
        fetcher,
        cache,
        CacheTtls {
            health: config.health_ttl,
            metrics: config.metrics_ttl,
            report: config.report_ttl,
        },
    )
    .with_report_langs(&config.report_langs);

    // Optionally persist the audit trail in Postgres.
    let audit: Arc<dyn AuditLog> = match config.database_url.as_deref() {
        Some(url) => match connect_audit(url).await {
            Ok(log) => {
                info!("Audit Postgres pool connected");
                Arc::new(log)
            }
            Err(e) => {
                warn!(error = %e, "audit database unavailable, logging admin actions only");
                Arc::new(LogAuditLog)
            }
        },
        None => Arc::new(LogAuditLog),
    };

    let verifier = Arc::new(UpstreamVerifier::new(
        gateway.resolver().clone(),
        gateway.registry().require(services::USER_MANAGEMENT)?.clone(),
    ));

    spawn_refresh_loop(
        refresh::hot_key_jobs(&gateway, &config.report_langs),
        config.refresh_interval,
    );
    info!(
        every_secs = config.refresh_interval.as_secs(),
        langs = ?config.report_langs,
        "background refresh started"
    );

    let state = Arc::new(AppState {
        gateway,
        verifier,
        audit,
    });
    let app = admin_gateway::router(state, &config.cors_origin_suffix);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!(addr = config.addr, "admin gateway listening");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn connect_audit(url: &str) -> Result<PgAuditLog> {
    let log = PgAuditLog::connect(url).await?;
    log.migrate().await?;
    Ok(log)
}
