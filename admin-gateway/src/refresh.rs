//! Hot keys kept warm by the background refresh loop.

use std::sync::Arc;

use async_trait::async_trait;
use refresh_cache::{keys, CacheError, RefreshJob};

use crate::gateway::GatewayServices;

/// Non-verbose health report.
pub struct HealthRefresh {
    gateway: GatewayServices,
}

#[async_trait]
impl RefreshJob for HealthRefresh {
    fn key(&self) -> String {
        keys::HEALTH_REPORT.to_string()
    }

    async fn run(&self) -> Result<(), CacheError> {
        self.gateway.refresh_health().await
    }
}

/// User report for one language.
pub struct UserReportRefresh {
    gateway: GatewayServices,
    lang: String,
}

#[async_trait]
impl RefreshJob for UserReportRefresh {
    fn key(&self) -> String {
        keys::user_report(&self.lang)
    }

    async fn run(&self) -> Result<(), CacheError> {
        self.gateway.refresh_user_report(&self.lang).await
    }
}

pub fn hot_key_jobs(gateway: &GatewayServices, langs: &[String]) -> Vec<Arc<dyn RefreshJob>> {
    let mut jobs: Vec<Arc<dyn RefreshJob>> = vec![Arc::new(HealthRefresh {
        gateway: gateway.clone(),
    })];
    for lang in langs {
        jobs.push(Arc::new(UserReportRefresh {
            gateway: gateway.clone(),
            lang: lang.clone(),
        }));
    }
    jobs
}

#[cfg(test)]
mod tests {
    use refresh_cache::schedule::run_round;
    use serde_json::json;
    use upstream::transport::{FakeReply, FakeTransport};
    use upstream::Method;

    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn round_warms_every_hot_key() {
        let fake = FakeTransport::new();
        fake.route(
            Method::Get,
            "http://users.local/api/v1/admin/users",
            FakeReply::json(200, json!([{"is_active": true}])),
        );
        let gateway = testing::services(&fake);
        let jobs = hot_key_jobs(&gateway, &["en".to_string(), "am".to_string()]);

        let keys: Vec<_> = jobs.iter().map(|j| j.key()).collect();
        assert_eq!(keys, vec!["health:report", "report:users:en", "report:users:am"]);
        assert_eq!(run_round(&jobs).await, 3);

        // Served from the cache, no new listing call.
        let report = gateway.user_report("am").await.unwrap();
        assert_eq!(report.active_users, 1);
        assert_eq!(fake.call_count(Method::Get, "http://users.local/api/v1/admin/users"), 2);
    }

    #[tokio::test]
    async fn failed_listing_fails_the_job() {
        let gateway = testing::services(&FakeTransport::new());
        let jobs = hot_key_jobs(&gateway, &["en".to_string()]);
        assert_eq!(run_round(&jobs).await, 1);
    }
}
