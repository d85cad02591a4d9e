//! Pending-rendezvous registry keyed by block id
//!
//! Every entry owns the sending half of a oneshot channel. Whoever removes
//! the entry under the lock (callback delivery, waiter timeout or the reaper)
//! owns the sender, so exactly one of them can signal the waiter.

use crate::error::{TransferError, TransferResult};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Outcome reported by the blockchain node for a finalized block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub block_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_data: Option<String>,
}

struct PendingEntry {
    request_id: String,
    slot: oneshot::Sender<CallbackResult>,
    created_at: Instant,
}

/// An entry removed from the registry; the holder alone may signal the waiter
#[derive(Debug)]
pub struct ClaimedRendezvous {
    request_id: String,
    block_id: String,
    slot: oneshot::Sender<CallbackResult>,
    created_at: Instant,
}

impl ClaimedRendezvous {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Hand the result to the waiter. Returns false if the waiter is gone.
    pub fn fulfil(self, result: CallbackResult) -> bool {
        match self.slot.send(result) {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    "Waiter for transfer {} (block {}) already left",
                    self.request_id, self.block_id
                );
                false
            }
        }
    }

    /// Close the slot without a value; the waiter observes a timeout
    pub fn close(self) {
        drop(self.slot);
    }
}

/// Entry evicted by the reaper
#[derive(Debug, Clone, PartialEq)]
pub struct EvictedEntry {
    pub request_id: String,
    pub block_id: String,
    pub age: Duration,
}

/// Caller side of a rendezvous
#[derive(Debug)]
pub struct PendingTransfer {
    request_id: String,
    block_id: String,
    slot: oneshot::Receiver<CallbackResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Confirmed(CallbackResult),
    /// Slot closed by a cancel or the reaper
    Closed,
    DeadlineElapsed,
}

impl PendingTransfer {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    /// Wait for the callback, at most `deadline`
    pub async fn wait(&mut self, deadline: Duration) -> WaitOutcome {
        match timeout(deadline, &mut self.slot).await {
            Ok(Ok(result)) => WaitOutcome::Confirmed(result),
            Ok(Err(_)) => WaitOutcome::Closed,
            Err(_) => WaitOutcome::DeadlineElapsed,
        }
    }

    /// Resolve the slot after `wait` hit its deadline.
    ///
    /// Only call once the entry has left the registry: the sender is then
    /// either dropped or held by a callback about to fulfil it, so this
    /// returns promptly. Must not be called after `Confirmed` or `Closed`.
    pub async fn settle(&mut self) -> Option<CallbackResult> {
        (&mut self.slot).await.ok()
    }
}

/// Registry of callers waiting on a block callback
pub struct PendingRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter for `block_id`
    pub async fn register(
        &self,
        request_id: &str,
        block_id: &str,
    ) -> TransferResult<PendingTransfer> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(block_id) {
            return Err(TransferError::AlreadyRegistered {
                block_id: block_id.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            block_id.to_string(),
            PendingEntry {
                request_id: request_id.to_string(),
                slot: tx,
                created_at: Instant::now(),
            },
        );
        drop(entries);

        debug!(
            "Registered pending request: transfer {}, block {}",
            request_id, block_id
        );

        Ok(PendingTransfer {
            request_id: request_id.to_string(),
            block_id: block_id.to_string(),
            slot: rx,
        })
    }

    /// Atomically remove the entry for `block_id` and take ownership of it
    pub async fn claim(&self, block_id: &str) -> Option<ClaimedRendezvous> {
        let entry = self.entries.lock().await.remove(block_id)?;
        Some(ClaimedRendezvous {
            request_id: entry.request_id,
            block_id: block_id.to_string(),
            slot: entry.slot,
            created_at: entry.created_at,
        })
    }

    /// Deliver a callback result. False when nobody was waiting on the block.
    pub async fn deliver(&self, block_id: &str, result: CallbackResult) -> bool {
        match self.claim(block_id).await {
            Some(claimed) => {
                claimed.fulfil(result);
                true
            }
            None => false,
        }
    }

    /// Remove the entry and close its slot without a value
    pub async fn cancel(&self, block_id: &str) -> bool {
        match self.claim(block_id).await {
            Some(claimed) => {
                debug!(
                    "Cancelled pending request: transfer {}, block {}",
                    claimed.request_id(),
                    block_id
                );
                claimed.close();
                true
            }
            None => false,
        }
    }

    /// Close and remove every entry older than `ttl`
    pub async fn evict_stale(&self, ttl: Duration) -> Vec<EvictedEntry> {
        let mut entries = self.entries.lock().await;
        let mut evicted = Vec::new();

        entries.retain(|block_id, entry| {
            let age = entry.created_at.elapsed();
            if age > ttl {
                evicted.push(EvictedEntry {
                    request_id: entry.request_id.clone(),
                    block_id: block_id.clone(),
                    age,
                });
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Number of callers currently waiting
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn success(block_id: &str) -> CallbackResult {
        CallbackResult {
            success: true,
            message: "Block finalized".to_string(),
            data: serde_json::json!({ "points": 40 }),
            error: String::new(),
            block_id: block_id.to_string(),
            contract_data: None,
        }
    }

    #[tokio::test]
    async fn test_register_then_deliver() {
        let registry = PendingRegistry::new();
        let mut pending = registry.register("t1", "b1").await.unwrap();
        assert_eq!(registry.len().await, 1);

        assert!(registry.deliver("b1", success("b1")).await);
        assert!(registry.is_empty().await);

        match pending.wait(Duration::from_secs(1)).await {
            WaitOutcome::Confirmed(result) => assert_eq!(result, success("b1")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_registration_rejected() {
        let registry = PendingRegistry::new();
        let _pending = registry.register("t1", "b1").await.unwrap();

        let err = registry.register("t2", "b1").await.unwrap_err();
        assert!(matches!(err, TransferError::AlreadyRegistered { .. }));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_deliver_unknown_block() {
        let registry = PendingRegistry::new();
        assert!(!registry.deliver("b404", success("b404")).await);
        assert!(!registry.cancel("b404").await);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let registry = PendingRegistry::new();
        let _pending = registry.register("t1", "b1").await.unwrap();

        assert!(registry.deliver("b1", success("b1")).await);
        assert!(!registry.deliver("b1", success("b1")).await);
    }

    #[tokio::test]
    async fn test_cancel_closes_slot() {
        let registry = PendingRegistry::new();
        let mut pending = registry.register("t1", "b1").await.unwrap();

        assert!(registry.cancel("b1").await);
        assert!(!registry.deliver("b1", success("b1")).await);
        assert_eq!(
            pending.wait(Duration::from_secs(1)).await,
            WaitOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_deliver_after_waiter_left_still_claims() {
        let registry = PendingRegistry::new();
        let pending = registry.register("t1", "b1").await.unwrap();
        drop(pending);

        assert!(registry.deliver("b1", success("b1")).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline() {
        let registry = PendingRegistry::new();
        let mut pending = registry.register("t1", "b1").await.unwrap();

        assert_eq!(
            pending.wait(Duration::from_secs(30)).await,
            WaitOutcome::DeadlineElapsed
        );
        // Entry stays until the waiter cancels it
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_after_deadline_waits_for_claimer() {
        let registry = PendingRegistry::new();
        let mut pending = registry.register("t1", "b1").await.unwrap();
        let claimed = registry.claim("b1").await.unwrap();

        assert_eq!(
            pending.wait(Duration::from_secs(30)).await,
            WaitOutcome::DeadlineElapsed
        );

        let fulfil = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            claimed.fulfil(success("b1"))
        });

        assert_eq!(pending.settle().await, Some(success("b1")));
        assert!(fulfil.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_after_cancel_is_empty() {
        let registry = PendingRegistry::new();
        let mut pending = registry.register("t1", "b1").await.unwrap();

        assert_eq!(
            pending.wait(Duration::from_secs(30)).await,
            WaitOutcome::DeadlineElapsed
        );
        assert!(registry.cancel("b1").await);
        assert_eq!(pending.settle().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale_only_removes_old_entries() {
        let registry = PendingRegistry::new();
        let mut old = registry.register("t1", "b1").await.unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;
        let _fresh = registry.register("t2", "b2").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        let evicted = registry.evict_stale(Duration::from_secs(600)).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].request_id, "t1");
        assert_eq!(evicted[0].block_id, "b1");
        assert_eq!(registry.len().await, 1);

        assert_eq!(old.wait(Duration::from_secs(1)).await, WaitOutcome::Closed);
        assert!(!registry.cancel("b1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_removals_have_one_winner() {
        let registry = Arc::new(PendingRegistry::new());

        for i in 0..200 {
            let block_id = format!("b{}", i);
            let mut pending = registry.register(&format!("t{}", i), &block_id).await.unwrap();

            let deliver = tokio::spawn({
                let registry = registry.clone();
                let block_id = block_id.clone();
                async move { registry.deliver(&block_id, success(&block_id)).await }
            });
            let cancel = tokio::spawn({
                let registry = registry.clone();
                let block_id = block_id.clone();
                async move { registry.cancel(&block_id).await }
            });

            let delivered = deliver.await.unwrap();
            let cancelled = cancel.await.unwrap();
            assert!(delivered ^ cancelled, "exactly one removal must win");

            let outcome = pending.wait(Duration::from_secs(1)).await;
            if delivered {
                assert!(matches!(outcome, WaitOutcome::Confirmed(_)));
            } else {
                assert_eq!(outcome, WaitOutcome::Closed);
            }
        }

        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_callback_result_wire_format() {
        let result: CallbackResult = serde_json::from_str(
            r#"{"success": false, "message": "reverted", "error": "out of gas", "block_id": "b7"}"#,
        )
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.error, "out of gas");
        assert_eq!(result.data, serde_json::Value::Null);
        assert!(result.contract_data.is_none());
    }
}
