//! End-to-end reward transfer: node submission, block lookup and confirmation wait

use super::coordinator::{NewTransfer, TransferCoordinator, TransferOutcome, TIMEOUT_MESSAGE};
use super::registry::CallbackResult;
use crate::config::{CoordinatorConfig, NodeResolver};
use crate::error::{TransferError, TransferResult};
use crate::node::NodeClient;
use crate::state::TransferState;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Inbound transfer request
#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    /// Caller-assigned id; generated when absent
    #[serde(default)]
    pub request_id: Option<String>,
    pub node_name: String,
    pub contract_hash: String,
    /// Opaque contract input forwarded to the node
    pub contract_input: String,
    pub user_did: String,
    pub admin_did: String,
    #[serde(default)]
    pub activity_ids: Vec<String>,
    pub reward_points: i64,
}

impl TransferRequest {
    fn validate(&self) -> TransferResult<()> {
        let required = [
            ("node_name", &self.node_name),
            ("contract_hash", &self.contract_hash),
            ("user_did", &self.user_did),
            ("admin_did", &self.admin_did),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(TransferError::InvalidRequest(format!("{} is required", field)));
            }
        }
        if self.reward_points < 0 {
            return Err(TransferError::InvalidRequest(
                "reward_points must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the caller gets back once the wait is over
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub request_id: String,
    pub block_id: String,
    pub status: TransferState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallbackResult>,
}

pub struct TransferService {
    coordinator: Arc<TransferCoordinator>,
    node: Arc<dyn NodeClient>,
    nodes: Arc<dyn NodeResolver>,
    config: CoordinatorConfig,
}

impl TransferService {
    pub fn new(
        coordinator: Arc<TransferCoordinator>,
        node: Arc<dyn NodeClient>,
        nodes: Arc<dyn NodeResolver>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            coordinator,
            node,
            nodes,
            config,
        }
    }

    /// Execute the reward contract and wait for its block callback
    pub async fn execute(&self, request: TransferRequest) -> TransferResult<TransferReceipt> {
        request.validate()?;

        let request_id = request
            .request_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Cheap early rejection; the insert enforces uniqueness anyway
        if self
            .coordinator
            .store()
            .get_by_request_id(&request_id)
            .await
            .is_ok()
        {
            return Err(TransferError::DuplicateRequestId { request_id });
        }

        let node_url = self
            .nodes
            .resolve(&request.node_name)
            .ok_or_else(|| TransferError::UnknownNode {
                node: request.node_name.clone(),
            })?;

        let node_request_id = self
            .node
            .submit_contract(
                &request.contract_hash,
                &request.admin_did,
                &request.contract_input,
                &node_url,
            )
            .await?;
        debug!(
            "Transfer {} submitted to {} as {}",
            request_id, node_url, node_request_id
        );

        // The block appears shortly after the signature is accepted
        tokio::time::sleep(self.config.block_fetch_delay()).await;
        let block_id = self
            .node
            .fetch_latest_block(&request.contract_hash, &node_url)
            .await?;

        let pending = self
            .coordinator
            .initiate(NewTransfer {
                request_id: request_id.clone(),
                block_id: block_id.clone(),
                contract_hash: request.contract_hash,
                activity_ids: request.activity_ids,
                user_did: request.user_did,
                admin_did: request.admin_did,
                reward_points: request.reward_points,
            })
            .await?;

        let receipt = match self
            .coordinator
            .await_confirmation(pending, self.config.wait_timeout())
            .await
        {
            TransferOutcome::Confirmed(result) => TransferReceipt {
                request_id,
                block_id,
                status: if result.success {
                    TransferState::Success
                } else {
                    TransferState::Failed
                },
                message: result.message.clone(),
                result: Some(result),
            },
            TransferOutcome::Recorded(row) => TransferReceipt {
                request_id,
                block_id,
                status: row.status,
                message: row.message,
                result: None,
            },
            TransferOutcome::TimedOut => TransferReceipt {
                request_id,
                block_id,
                status: TransferState::Timeout,
                message: TIMEOUT_MESSAGE.to_string(),
                result: None,
            },
        };

        info!(
            "Transfer {} finished waiting: {}",
            receipt.request_id, receipt.status
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::coordination::registry::PendingRegistry;
    use crate::node::MockNodeClient;
    use crate::state::testing::{pending_status, test_store};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn nodes() -> Arc<dyn NodeResolver> {
        let mut nodes = HashMap::new();
        nodes.insert(
            "node2".to_string(),
            NodeConfig {
                host: "localhost".to_string(),
                port: 20002,
            },
        );
        Arc::new(nodes)
    }

    fn config(wait_timeout_secs: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            wait_timeout_secs,
            block_fetch_delay_ms: 0,
            ..Default::default()
        }
    }

    fn request(request_id: Option<&str>, node_name: &str) -> TransferRequest {
        TransferRequest {
            request_id: request_id.map(str::to_string),
            node_name: node_name.to_string(),
            contract_hash: "QmContract".to_string(),
            contract_input: "{\"transfer\":25}".to_string(),
            user_did: "bafybmiuser".to_string(),
            admin_did: "bafybmiadmin".to_string(),
            activity_ids: vec!["quiz-7".to_string()],
            reward_points: 25,
        }
    }

    async fn service(
        node: MockNodeClient,
        config: CoordinatorConfig,
    ) -> (TransferService, Arc<TransferCoordinator>, TempDir) {
        let (store, dir) = test_store().await;
        let coordinator = Arc::new(TransferCoordinator::new(
            Arc::new(store),
            Arc::new(PendingRegistry::new()),
        ));
        let service = TransferService::new(coordinator.clone(), Arc::new(node), nodes(), config);
        (service, coordinator, dir)
    }

    fn node_returning_block(block_id: &'static str) -> MockNodeClient {
        let mut node = MockNodeClient::new();
        node.expect_submit_contract()
            .withf(|hash, executor, _, url| {
                hash == "QmContract" && executor == "bafybmiadmin" && url == "http://localhost:20002"
            })
            .times(1)
            .returning(|_, _, _, _| Ok("node-req-1".to_string()));
        node.expect_fetch_latest_block()
            .times(1)
            .returning(move |_, _| Ok(block_id.to_string()));
        node
    }

    #[tokio::test]
    async fn test_execute_until_confirmed() {
        let (service, coordinator, _dir) =
            service(node_returning_block("B100"), config(5)).await;

        let callback_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                while coordinator.registry().is_empty().await {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                coordinator
                    .on_callback(
                        "B100",
                        CallbackResult {
                            success: true,
                            message: "Reward transferred".to_string(),
                            data: serde_json::Value::Null,
                            error: String::new(),
                            block_id: "B100".to_string(),
                            contract_data: None,
                        },
                    )
                    .await
            }
        });

        let receipt = service.execute(request(Some("T100"), "node2")).await.unwrap();
        assert!(callback_task.await.unwrap().delivered());

        assert_eq!(receipt.request_id, "T100");
        assert_eq!(receipt.block_id, "B100");
        assert_eq!(receipt.status, TransferState::Success);
        assert_eq!(receipt.message, "Reward transferred");

        let row = coordinator.store().get_by_request_id("T100").await.unwrap();
        assert_eq!(row.status, TransferState::Success);
        assert_eq!(row.activity_ids, vec!["quiz-7"]);
    }

    #[tokio::test]
    async fn test_callback_racing_registration_still_confirms() {
        let (service, coordinator, _dir) =
            service(node_returning_block("B106"), config(1)).await;

        // Fires as soon as the row exists, possibly before the waiter is registered
        let callback_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                while coordinator.store().get_by_request_id("T106").await.is_err() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                coordinator
                    .on_callback(
                        "B106",
                        CallbackResult {
                            success: true,
                            message: "Reward transferred".to_string(),
                            data: serde_json::Value::Null,
                            error: String::new(),
                            block_id: "B106".to_string(),
                            contract_data: None,
                        },
                    )
                    .await
            }
        });

        let receipt = service.execute(request(Some("T106"), "node2")).await.unwrap();
        assert_eq!(callback_task.await.unwrap().request_id(), Some("T106"));

        assert_eq!(receipt.status, TransferState::Success);
        assert_eq!(receipt.message, "Reward transferred");
        assert!(coordinator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let (service, coordinator, _dir) =
            service(node_returning_block("B101"), config(0)).await;

        let receipt = service.execute(request(None, "node2")).await.unwrap();
        assert_eq!(receipt.status, TransferState::Timeout);
        assert!(!receipt.request_id.is_empty());

        let row = coordinator
            .store()
            .get_by_request_id(&receipt.request_id)
            .await
            .unwrap();
        assert_eq!(row.status, TransferState::Timeout);
        assert!(coordinator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_node_skips_submission() {
        let mut node = MockNodeClient::new();
        node.expect_submit_contract().never();
        node.expect_fetch_latest_block().never();
        let (service, _coordinator, _dir) = service(node, config(1)).await;

        let err = service.execute(request(Some("T102"), "node9")).await.unwrap_err();
        assert!(matches!(err, TransferError::UnknownNode { .. }));
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_no_row() {
        let mut node = MockNodeClient::new();
        node.expect_submit_contract()
            .returning(|_, _, _, url| Err(TransferError::upstream(url, "quorum unavailable")));
        node.expect_fetch_latest_block().never();
        let (service, coordinator, _dir) = service(node, config(1)).await;

        let err = service.execute(request(Some("T103"), "node2")).await.unwrap_err();
        assert!(matches!(err, TransferError::Upstream { .. }));
        assert!(matches!(
            coordinator.store().get_by_request_id("T103").await.unwrap_err(),
            TransferError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected_before_submission() {
        let mut node = MockNodeClient::new();
        node.expect_submit_contract().never();
        let (service, coordinator, _dir) = service(node, config(1)).await;
        coordinator
            .store()
            .create(&pending_status("T104", "B104"))
            .await
            .unwrap();

        let err = service.execute(request(Some("T104"), "node2")).await.unwrap_err();
        assert!(matches!(err, TransferError::DuplicateRequestId { .. }));
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let (service, _coordinator, _dir) = service(MockNodeClient::new(), config(1)).await;
        let mut bad = request(Some("T105"), "node2");
        bad.admin_did = " ".to_string();

        let err = service.execute(bad).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));
    }
}
