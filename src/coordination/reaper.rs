//! Periodic eviction of rendezvous entries whose callback never arrived

use super::registry::PendingRegistry;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Background task closing stale waiters so they unblock and memory stays bounded
pub struct StaleReaper {
    registry: Arc<PendingRegistry>,
    /// Entries older than this are closed
    ttl: Duration,
    /// Time between scans
    period: Duration,
    shutdown: Arc<RwLock<bool>>,
}

impl StaleReaper {
    pub fn new(registry: Arc<PendingRegistry>, ttl: Duration, period: Duration) -> Self {
        Self {
            registry,
            ttl,
            period,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the reaper in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Stale-entry reaper started (ttl {:?}, period {:?})",
                self.ttl, self.period
            );
            self.run().await;
            info!("Stale-entry reaper stopped");
        })
    }

    async fn run(&self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if *self.shutdown.read().await {
                break;
            }

            self.reap_once().await;
        }
    }

    /// Run one scan, returning the number of evicted entries
    pub async fn reap_once(&self) -> usize {
        let evicted = self.registry.evict_stale(self.ttl).await;

        for entry in &evicted {
            warn!(
                "Cleaned up stale pending request: transfer {}, block {} (age {:?})",
                entry.request_id, entry.block_id, entry.age
            );
        }

        crate::metrics::record_reaped(evicted.len());
        crate::metrics::set_pending_rendezvous(self.registry.len().await);
        evicted.len()
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Stale-entry reaper shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::registry::{CallbackResult, WaitOutcome};
    use tokio::time::Instant;

    const TTL: Duration = Duration::from_secs(600);
    const PERIOD: Duration = Duration::from_secs(120);

    #[tokio::test(start_paused = true)]
    async fn test_reap_once_respects_ttl() {
        let registry = Arc::new(PendingRegistry::new());
        let reaper = StaleReaper::new(registry.clone(), TTL, PERIOD);
        let _pending = registry.register("t1", "b1").await.unwrap();

        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(reaper.reap_once().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reaper.reap_once().await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_unblocks_within_ttl_plus_period() {
        let registry = Arc::new(PendingRegistry::new());
        let reaper = Arc::new(StaleReaper::new(registry.clone(), TTL, PERIOD));
        let handle = reaper.clone().start();

        let started = Instant::now();
        let mut pending = registry.register("t2", "b2").await.unwrap();

        let outcome = pending.wait(Duration::from_secs(24 * 3600)).await;
        assert_eq!(outcome, WaitOutcome::Closed);
        assert!(started.elapsed() > TTL);
        assert!(started.elapsed() <= TTL + PERIOD);
        assert!(registry.is_empty().await);

        reaper.stop().await;
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_loses_race_to_delivery() {
        let registry = Arc::new(PendingRegistry::new());
        let reaper = StaleReaper::new(registry.clone(), TTL, PERIOD);
        let _pending = registry.register("t3", "b3").await.unwrap();

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let claimed = registry.claim("b3").await.unwrap();

        assert_eq!(reaper.reap_once().await, 0);
        assert_eq!(claimed.request_id(), "t3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reap_deliver_and_cancel_race_on_stale_entry() {
        let registry = Arc::new(PendingRegistry::new());
        // Every entry is stale as soon as any time has passed
        let reaper = Arc::new(StaleReaper::new(registry.clone(), Duration::ZERO, PERIOD));

        for i in 0..200 {
            let block_id = format!("b{}", i);
            let mut pending = registry
                .register(&format!("t{}", i), &block_id)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;

            let reap = tokio::spawn({
                let reaper = reaper.clone();
                async move { reaper.reap_once().await }
            });
            let deliver = tokio::spawn({
                let registry = registry.clone();
                let block_id = block_id.clone();
                async move {
                    let result = CallbackResult {
                        success: true,
                        message: "Block finalized".to_string(),
                        data: serde_json::Value::Null,
                        error: String::new(),
                        block_id: block_id.clone(),
                        contract_data: None,
                    };
                    registry.deliver(&block_id, result).await
                }
            });
            let cancel = tokio::spawn({
                let registry = registry.clone();
                let block_id = block_id.clone();
                async move { registry.cancel(&block_id).await }
            });

            let reaped = reap.await.unwrap();
            let delivered = deliver.await.unwrap();
            let cancelled = cancel.await.unwrap();
            assert_eq!(
                reaped + usize::from(delivered) + usize::from(cancelled),
                1,
                "exactly one removal must win"
            );

            let outcome = pending.wait(Duration::from_secs(1)).await;
            if delivered {
                assert!(matches!(outcome, WaitOutcome::Confirmed(_)));
            } else {
                assert_eq!(outcome, WaitOutcome::Closed);
            }
        }

        assert!(registry.is_empty().await);
    }
}
