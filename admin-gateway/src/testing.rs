//! Wiring shared by the crate's tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use refresh_cache::{CacheManager, ManualClock, MemoryStore};
use upstream::registry::services;
use upstream::transport::FakeTransport;
use upstream::{AuthToken, EndpointDescriptor, EndpointRegistry, Fetcher};

use crate::audit::MemoryAuditLog;
use crate::auth::StaticTokenVerifier;
use crate::gateway::{CacheTtls, GatewayServices};
use crate::state::AppState;

pub const ADMIN_TOKEN: &str = "admin-token";
pub const TENANT_TOKEN: &str = "tenant-token";

/// `user_management` (required) and `notification` (optional).
pub fn services(fake: &FakeTransport) -> GatewayServices {
    let registry = EndpointRegistry::new(vec![
        EndpointDescriptor::new(
            services::USER_MANAGEMENT,
            "http://users.local/api/v1",
            AuthToken::new("internal"),
            false,
        )
        .unwrap(),
        EndpointDescriptor::new(services::NOTIFICATION, "http://notify.local", AuthToken::default(), true)
            .unwrap(),
    ])
    .unwrap();

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache = CacheManager::new(Arc::new(MemoryStore::new(clock.clone())), clock, Duration::from_secs(600));

    GatewayServices::new(
        registry,
        Fetcher::new(Arc::new(fake.clone()), Duration::from_secs(2)),
        Arc::new(cache),
        CacheTtls {
            health: Duration::from_secs(60),
            metrics: Duration::from_secs(120),
            report: Duration::from_secs(3600),
        },
    )
    .with_report_langs(&["en".to_string(), "am".to_string()])
}

pub fn state(fake: &FakeTransport, audit: &MemoryAuditLog) -> Arc<AppState> {
    Arc::new(AppState {
        gateway: services(fake),
        verifier: Arc::new(
            StaticTokenVerifier::new()
                .with(ADMIN_TOKEN, "admin-1", "admin")
                .with(TENANT_TOKEN, "tenant-1", "tenant"),
        ),
        audit: Arc::new(audit.clone()),
    })
}
