//! Transfer coordinator: keeps the status store and the rendezvous registry in step

use super::registry::{CallbackResult, PendingRegistry, PendingTransfer, WaitOutcome};
use crate::error::{TransferError, TransferResult};
use crate::metrics;
use crate::state::{StatusStore, StatusUpdate, TransferState, TransferStatus, UpdateOutcome};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const INITIATED_MESSAGE: &str = "Transfer initiated, waiting for blockchain confirmation";
pub const TIMEOUT_MESSAGE: &str =
    "Transfer confirmation timed out (blockchain may still be processing)";
pub const RESTART_MESSAGE: &str =
    "Transfer wait interrupted by a restart (blockchain may still be processing)";

/// Everything needed to open a transfer
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub request_id: String,
    pub block_id: String,
    pub contract_hash: String,
    pub activity_ids: Vec<String>,
    pub user_did: String,
    pub admin_did: String,
    pub reward_points: i64,
}

/// How a block callback was matched
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackDisposition {
    /// A waiting caller was released
    Delivered { request_id: String },
    /// No waiter; the row was found through its block id
    Recorded { request_id: String },
    Unmatched,
}

impl CallbackDisposition {
    pub fn delivered(&self) -> bool {
        matches!(self, CallbackDisposition::Delivered { .. })
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            CallbackDisposition::Delivered { request_id }
            | CallbackDisposition::Recorded { request_id } => Some(request_id),
            CallbackDisposition::Unmatched => None,
        }
    }
}

/// What the waiting caller ends up with
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Confirmed(CallbackResult),
    /// The row reached a terminal state without the result passing through the waiter
    Recorded(TransferStatus),
    TimedOut,
}

pub struct TransferCoordinator {
    store: Arc<StatusStore>,
    registry: Arc<PendingRegistry>,
}

impl TransferCoordinator {
    pub fn new(store: Arc<StatusStore>, registry: Arc<PendingRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// Write a pending row, then register a waiter for its block.
    ///
    /// If registration fails the row stays pending; a callback can still
    /// resolve it through the block-id fallback.
    pub async fn initiate(&self, transfer: NewTransfer) -> TransferResult<PendingTransfer> {
        let now = Utc::now();
        let status = TransferStatus {
            request_id: transfer.request_id,
            block_id: transfer.block_id,
            activity_ids: transfer.activity_ids,
            user_did: transfer.user_did,
            admin_did: transfer.admin_did,
            contract_hash: transfer.contract_hash,
            reward_points: transfer.reward_points,
            status: TransferState::Pending,
            message: INITIATED_MESSAGE.to_string(),
            error_details: String::new(),
            created_at: now,
            updated_at: now,
        };

        self.store.create(&status).await?;
        metrics::record_transfer_initiated();

        match self
            .registry
            .register(&status.request_id, &status.block_id)
            .await
        {
            Ok(pending) => {
                metrics::set_pending_rendezvous(self.registry.len().await);
                info!(
                    "Transfer {} initiated, waiting on block {}",
                    status.request_id, status.block_id
                );
                Ok(pending)
            }
            Err(e) => {
                warn!(
                    "Transfer {} stored but its waiter could not be registered: {}",
                    status.request_id, e
                );
                Err(e)
            }
        }
    }

    /// Record a block callback and release its waiter, if any.
    ///
    /// The store is always updated, so late callbacks are never dropped.
    pub async fn on_callback(&self, block_id: &str, result: CallbackResult) -> CallbackDisposition {
        let update = update_for_callback(&result);

        if let Some(claimed) = self.registry.claim(block_id).await {
            let request_id = claimed.request_id().to_string();
            debug!(
                "Found pending request for block {}: transfer {}",
                block_id, request_id
            );
            metrics::record_confirmation_latency(claimed.age().as_secs_f64());

            self.apply(&request_id, &update, "callback").await;
            claimed.fulfil(result);

            metrics::record_callback("delivered");
            metrics::set_pending_rendezvous(self.registry.len().await);
            return CallbackDisposition::Delivered { request_id };
        }

        info!(
            "No pending request for block {}, updating status store directly",
            block_id
        );

        match self.store.get_by_block_id(block_id).await {
            Ok(row) => {
                self.apply(&row.request_id, &update, "callback_fallback")
                    .await;
                metrics::record_callback("fallback");
                CallbackDisposition::Recorded {
                    request_id: row.request_id,
                }
            }
            Err(TransferError::NotFound { .. }) => {
                warn!("No transfer found for block {}, dropping callback", block_id);
                metrics::record_callback("unmatched");
                CallbackDisposition::Unmatched
            }
            Err(e) => {
                error!("Failed to look up transfer for block {}: {}", block_id, e);
                metrics::record_store_write_failure("callback_lookup");
                metrics::record_callback("unmatched");
                CallbackDisposition::Unmatched
            }
        }
    }

    /// Mark the transfer as timed out and drop its waiter.
    ///
    /// The registry entry is removed even when the store write fails.
    pub async fn on_wait_timeout(&self, request_id: &str, block_id: &str) -> TransferResult<()> {
        let update = StatusUpdate::to_state(TransferState::Timeout).with_message(TIMEOUT_MESSAGE);
        let written = self.store.update(request_id, &update).await;

        if self.registry.cancel(block_id).await {
            info!(
                "Cleaned up timed out request: transfer {}, block {}",
                request_id, block_id
            );
        }
        metrics::set_pending_rendezvous(self.registry.len().await);

        match written {
            Ok(UpdateOutcome::Applied) => {
                metrics::record_transfer_outcome(TransferState::Timeout.as_str());
                Ok(())
            }
            Ok(UpdateOutcome::TerminalUnchanged) => {
                debug!(
                    "Transfer {} resolved before its timeout was recorded",
                    request_id
                );
                metrics::record_terminal_noop();
                Ok(())
            }
            Err(e) => {
                metrics::record_store_write_failure("timeout");
                Err(e)
            }
        }
    }

    /// Block until the callback arrives, the slot is closed or `deadline` passes.
    ///
    /// A row that is already `success` or `failed` is reported as such, never
    /// as a timeout.
    pub async fn await_confirmation(
        &self,
        mut pending: PendingTransfer,
        deadline: Duration,
    ) -> TransferOutcome {
        // The callback may have resolved the row before the waiter was registered
        if let Some(row) = self.terminal_row(pending.request_id()).await {
            self.registry.cancel(pending.block_id()).await;
            metrics::set_pending_rendezvous(self.registry.len().await);
            debug!(
                "Transfer {} was {} before its waiter started",
                row.request_id, row.status
            );
            return TransferOutcome::Recorded(row);
        }

        let result = match pending.wait(deadline).await {
            WaitOutcome::Confirmed(result) => return TransferOutcome::Confirmed(result),
            WaitOutcome::Closed => {
                self.record_wait_timeout(&pending).await;
                None
            }
            WaitOutcome::DeadlineElapsed => {
                self.record_wait_timeout(&pending).await;
                // The entry is gone now, so the sender is dropped or about to be fulfilled
                pending.settle().await
            }
        };

        if let Some(result) = result {
            return TransferOutcome::Confirmed(result);
        }

        match self.terminal_row(pending.request_id()).await {
            Some(row) => TransferOutcome::Recorded(row),
            None => {
                warn!(
                    "No confirmation for transfer {} (block {}) within {:?}",
                    pending.request_id(),
                    pending.block_id(),
                    deadline
                );
                TransferOutcome::TimedOut
            }
        }
    }

    async fn record_wait_timeout(&self, pending: &PendingTransfer) {
        if let Err(e) = self
            .on_wait_timeout(pending.request_id(), pending.block_id())
            .await
        {
            error!(
                "Failed to record timeout for transfer {}: {}",
                pending.request_id(),
                e
            );
        }
    }

    async fn terminal_row(&self, request_id: &str) -> Option<TransferStatus> {
        match self.store.get_by_request_id(request_id).await {
            Ok(row) if row.status.is_terminal() => Some(row),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read back transfer {}: {}", request_id, e);
                None
            }
        }
    }

    /// Resolve rows left pending by a previous process.
    ///
    /// Their waiters died with the old registry; a later callback can still
    /// overwrite the resulting `timeout`.
    pub async fn recover_orphaned(&self) -> TransferResult<u64> {
        let recovered = self.store.expire_pending(RESTART_MESSAGE).await?;
        if recovered > 0 {
            warn!(
                "Marked {} transfers left pending by a previous run as timed out",
                recovered
            );
        }
        Ok(recovered)
    }

    async fn apply(&self, request_id: &str, update: &StatusUpdate, operation: &str) {
        match self.store.update(request_id, update).await {
            Ok(UpdateOutcome::Applied) => {
                if let Some(state) = update.status {
                    metrics::record_transfer_outcome(state.as_str());
                    info!("Transfer {} is now {}", request_id, state);
                }
            }
            Ok(UpdateOutcome::TerminalUnchanged) => {
                metrics::record_terminal_noop();
                info!(
                    "Transfer {} already terminal, ignoring {} update",
                    request_id, operation
                );
            }
            Err(e) => {
                error!(
                    "Failed to update transfer {} during {}: {}",
                    request_id, operation, e
                );
                metrics::record_store_write_failure(operation);
            }
        }
    }
}

fn update_for_callback(result: &CallbackResult) -> StatusUpdate {
    if result.success {
        StatusUpdate::to_state(TransferState::Success).with_message(result.message.clone())
    } else {
        StatusUpdate::to_state(TransferState::Failed)
            .with_message(result.message.clone())
            .with_error_details(result.error.clone())
    }
}
