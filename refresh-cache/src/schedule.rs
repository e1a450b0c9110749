//! Background refresh of hot keys.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::manager::CacheError;

/// One hot key and how to recompute it.
///
/// Implementations are expected to go through [`CacheManager::refresh`] so
/// refreshes share the single-flight guard with regular reads.
///
/// [`CacheManager::refresh`]: crate::manager::CacheManager::refresh
#[async_trait]
pub trait RefreshJob: Send + Sync {
    fn key(&self) -> String;

    async fn run(&self) -> Result<(), CacheError>;
}

/// Run every job once, concurrently. Failures are logged, never propagated.
pub async fn run_round(jobs: &[Arc<dyn RefreshJob>]) -> usize {
    let mut set = JoinSet::new();
    for job in jobs {
        let job = job.clone();
        set.spawn(async move {
            let key = job.key();
            let result = job.run().await;
            (key, result)
        });
    }

    let mut refreshed = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => refreshed += 1,
            Ok((key, Err(e))) => warn!(key, error = %e, "refresh failed, keeping previous value"),
            Err(e) => error!(error = %e, "refresh task failed"),
        }
    }
    refreshed
}

/// Refresh `jobs` every `every`, starting immediately.
pub fn spawn_refresh_loop(jobs: Vec<Arc<dyn RefreshJob>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let refreshed = run_round(&jobs).await;
            info!(refreshed, total = jobs.len(), "refresh round finished");
        }
    })
}
