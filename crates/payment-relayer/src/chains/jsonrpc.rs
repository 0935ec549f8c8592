// Ethereum JSON-RPC implementation of the connectivity provider
//
// Transactions are sent with `eth_sendTransaction` from the configured relayer
// account, so signing happens in the node or the remote signer in front of it.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::registry::ChainRegistry;
use super::{ChainError, ChainProvider, RelayCall, RelayContract, TxReceipt};
use crate::config::RelayConfig;

/// JSON-RPC client bound to one chain's endpoint, contract and relayer account
pub struct EvmRpc {
    client: reqwest::Client,
    key: String,
    chain_id: u64,
    endpoint: String,
    contract: Address,
    from: Address,
    receipt_poll_interval: Duration,
    next_id: AtomicU64,
}

impl EvmRpc {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(chain = %self.key, method, "JSON-RPC request");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Transport(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let mut response_json: Value = response.json().await?;

        if let Some(error) = response_json.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let data = error.get("data").and_then(Value::as_str).map(str::to_string);
            return Err(ChainError::Rpc {
                code,
                message,
                data,
            });
        }

        match response_json.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(ChainError::InvalidResponse(format!(
                "{} response has no result",
                method
            ))),
        }
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let result = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&result, "chainId")
    }

    fn transaction(&self, call: &RelayCall) -> Value {
        json!({
            "from": self.from.to_string(),
            "to": self.contract.to_string(),
            "data": call.calldata.to_string(),
        })
    }
}

#[async_trait]
impl RelayContract for EvmRpc {
    async fn estimate_gas(&self, call: &RelayCall) -> Result<u64, ChainError> {
        let result = self
            .request("eth_estimateGas", json!([self.transaction(call)]))
            .await?;
        parse_quantity(&result, "gas estimate")
    }

    async fn submit(&self, call: &RelayCall, gas_limit: u64) -> Result<B256, ChainError> {
        let mut tx = self.transaction(call);
        tx["gas"] = Value::String(format!("{:#x}", gas_limit));
        let result = self.request("eth_sendTransaction", json!([tx])).await?;
        parse_hash(&result)
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ChainError> {
        loop {
            let result = self
                .request("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
                .await?;
            if result.is_null() {
                tokio::time::sleep(self.receipt_poll_interval).await;
                continue;
            }

            let success = parse_quantity(&result["status"], "receipt status")? == 1;
            return Ok(TxReceipt {
                tx_hash,
                block_number: parse_quantity(&result["blockNumber"], "blockNumber")?,
                gas_used: parse_quantity(&result["gasUsed"], "gasUsed")?,
                success,
                revert_reason: if success {
                    None
                } else {
                    Some(
                        result
                            .get("revertReason")
                            .and_then(Value::as_str)
                            .unwrap_or("execution reverted")
                            .to_string(),
                    )
                },
            });
        }
    }
}

/// Connectivity provider for every chain in the registry
pub struct JsonRpcProvider {
    chains: HashMap<String, Arc<EvmRpc>>,
    readiness_timeout: Duration,
}

impl JsonRpcProvider {
    pub fn new(registry: &ChainRegistry, relay: &RelayConfig) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(relay.submit_timeout().max(relay.readiness_timeout()))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        let mut chains = HashMap::new();
        for chain in registry.iter() {
            let contract = chain
                .config
                .contract()
                .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", chain.key, e)))?;
            let from = chain
                .config
                .relayer()
                .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", chain.key, e)))?;
            chains.insert(
                chain.key.clone(),
                Arc::new(EvmRpc {
                    client: client.clone(),
                    key: chain.key.clone(),
                    chain_id: chain.chain_id(),
                    endpoint: chain.config.rpc_endpoint.clone(),
                    contract,
                    from,
                    receipt_poll_interval: relay.receipt_poll_interval(),
                    next_id: AtomicU64::new(1),
                }),
            );
        }

        Ok(Self {
            chains,
            readiness_timeout: relay.readiness_timeout(),
        })
    }
}

#[async_trait]
impl ChainProvider for JsonRpcProvider {
    async fn is_chain_ready(&self, chain_key: &str) -> bool {
        let Some(rpc) = self.chains.get(chain_key) else {
            return false;
        };

        match tokio::time::timeout(self.readiness_timeout, rpc.chain_id()).await {
            Ok(Ok(id)) if id == rpc.chain_id => true,
            Ok(Ok(id)) => {
                warn!(
                    chain = %chain_key,
                    expected = rpc.chain_id,
                    actual = id,
                    "Endpoint reports a different chain id"
                );
                false
            }
            Ok(Err(e)) => {
                debug!(chain = %chain_key, "Readiness check failed: {}", e);
                false
            }
            Err(_) => {
                debug!(chain = %chain_key, "Readiness check timed out");
                false
            }
        }
    }

    async fn signed_contract(&self, chain_key: &str) -> Result<Arc<dyn RelayContract>, ChainError> {
        let rpc = self
            .chains
            .get(chain_key)
            .ok_or_else(|| ChainError::UnknownChain(chain_key.to_string()))?;
        let handle: Arc<dyn RelayContract> = rpc.clone();
        Ok(handle)
    }
}

fn parse_quantity(value: &Value, what: &str) -> Result<u64, ChainError> {
    let text = value
        .as_str()
        .ok_or_else(|| ChainError::InvalidResponse(format!("{} is not a hex string: {}", what, value)))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainError::InvalidResponse(format!("bad {} {:?}: {}", what, text, e)))
}

fn parse_hash(value: &Value) -> Result<B256, ChainError> {
    let text = value
        .as_str()
        .ok_or_else(|| ChainError::InvalidResponse(format!("tx hash is not a string: {}", value)))?;
    text.parse()
        .map_err(|e| ChainError::InvalidResponse(format!("bad tx hash {:?}: {}", text, e)))
}
