//! HTTP client for the blockchain node's smart-contract API

use crate::config::NodeClientConfig;
use crate::error::{TransferError, TransferResult};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const EXECUTE_PATH: &str = "/api/execute-smart-contract";
const SIGNATURE_PATH: &str = "/api/signature-response";
const CHAIN_DATA_PATH: &str = "/api/get-smart-contract-token-chain-data";

/// Node operations the transfer flow depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Execute a contract and confirm the signature; returns the node's request id
    async fn submit_contract(
        &self,
        contract_hash: &str,
        executor_did: &str,
        payload: &str,
        node_url: &str,
    ) -> TransferResult<String>;

    /// Id of the most recent block on the contract's token chain
    async fn fetch_latest_block(&self, contract_hash: &str, node_url: &str)
        -> TransferResult<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteContractRequest<'a> {
    comment: &'a str,
    executor_addr: &'a str,
    quorum_type: u8,
    smart_contract_data: &'a str,
    smart_contract_token: &'a str,
}

#[derive(Debug, Serialize)]
struct SignatureRequest<'a> {
    id: &'a str,
    mode: u8,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct ChainDataRequest<'a> {
    latest: bool,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct NodeResponse<T> {
    status: bool,
    #[serde(default)]
    message: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResult {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChainDataResponse {
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(rename = "SCTDataReply", alias = "SCDataReply")]
    blocks: Option<Vec<ChainBlock>>,
}

#[derive(Debug, Deserialize)]
struct ChainBlock {
    #[serde(rename = "BlockId", alias = "blockId", alias = "block_id", default)]
    block_id: String,
}

/// Node client over JSON/HTTP
pub struct HttpNodeClient {
    http: reqwest::Client,
    signature_password: String,
}

impl HttpNodeClient {
    pub fn new(config: &NodeClientConfig) -> TransferResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| TransferError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            signature_password: config.signature_password.clone(),
        })
    }

    async fn post<B, R>(&self, node_url: &str, path: &str, body: &B) -> TransferResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", node_url.trim_end_matches('/'), path);

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransferError::upstream(node_url, format!("{} failed: {}", path, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransferError::upstream(node_url, format!("{} body: {}", path, e)))?;

        if !status.is_success() {
            return Err(TransferError::upstream(
                node_url,
                format!("{} returned {}: {}", path, status, text),
            ));
        }

        serde_json::from_str(&text).map_err(|e| {
            TransferError::upstream(node_url, format!("unreadable {} response: {}", path, e))
        })
    }

    async fn execute_smart_contract(
        &self,
        contract_hash: &str,
        executor_did: &str,
        payload: &str,
        node_url: &str,
    ) -> TransferResult<String> {
        let request = ExecuteContractRequest {
            comment: "Contract execution",
            executor_addr: executor_did,
            quorum_type: 2,
            smart_contract_data: payload,
            smart_contract_token: contract_hash,
        };

        let response: NodeResponse<ExecuteResult> =
            self.post(node_url, EXECUTE_PATH, &request).await?;
        if !response.status {
            return Err(TransferError::upstream(node_url, response.message));
        }

        response
            .result
            .map(|r| r.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransferError::upstream(node_url, "execution returned no request id"))
    }

    async fn confirm_signature(&self, node_url: &str, request_id: &str) -> TransferResult<()> {
        let request = SignatureRequest {
            id: request_id,
            mode: 0,
            password: &self.signature_password,
        };

        let response: NodeResponse<serde_json::Value> =
            self.post(node_url, SIGNATURE_PATH, &request).await?;
        if !response.status {
            return Err(TransferError::upstream(node_url, response.message));
        }

        Ok(())
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn submit_contract(
        &self,
        contract_hash: &str,
        executor_did: &str,
        payload: &str,
        node_url: &str,
    ) -> TransferResult<String> {
        let request_id = self
            .execute_smart_contract(contract_hash, executor_did, payload, node_url)
            .await?;
        debug!("Node {} accepted execution {}", node_url, request_id);

        self.confirm_signature(node_url, &request_id).await?;
        info!(
            "Contract {} executed on {} (request {})",
            contract_hash, node_url, request_id
        );

        Ok(request_id)
    }

    async fn fetch_latest_block(
        &self,
        contract_hash: &str,
        node_url: &str,
    ) -> TransferResult<String> {
        let request = ChainDataRequest {
            latest: true,
            token: contract_hash,
        };

        let response: ChainDataResponse = self.post(node_url, CHAIN_DATA_PATH, &request).await?;
        if !response.status {
            return Err(TransferError::upstream(node_url, response.message));
        }

        let block_id = response
            .blocks
            .unwrap_or_default()
            .pop()
            .map(|block| block.block_id)
            .ok_or_else(|| {
                TransferError::upstream(
                    node_url,
                    format!("no blocks found for contract {}", contract_hash),
                )
            })?;

        if block_id.is_empty() {
            return Err(TransferError::upstream(node_url, "latest block id is empty"));
        }

        debug!("Latest block for contract {}: {}", contract_hash, block_id);
        Ok(block_id)
    }
}
