// Connectivity to target chains
//
// The relay engine only sees these two traits; how transactions get signed
// and broadcast is up to the provider behind them.

use std::sync::Arc;

use alloy_primitives::{Bytes, B256, U256};
use async_trait::async_trait;
use thiserror::Error;

pub mod abi;
pub mod jsonrpc;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod registry;

pub use jsonrpc::JsonRpcProvider;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockOutcome, MockProvider};
pub use registry::{ChainRegistry, RegisteredChain};

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("Chain {0} is not ready")]
    NotReady(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("RPC error {code}: {message}{}", rpc_data_suffix(.data))]
    Rpc {
        code: i64,
        message: String,
        /// Hex revert payload or other node detail, kept apart from `message`
        data: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Transaction {tx_hash} reverted: {reason}")]
    Reverted { tx_hash: B256, reason: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

fn rpc_data_suffix(data: &Option<String>) -> String {
    data.as_ref().map(|d| format!(" ({})", d)).unwrap_or_default()
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout {
                operation: "http request".to_string(),
                seconds: 0,
            }
        } else {
            ChainError::Transport(e.to_string())
        }
    }
}

/// One delivery call against a target chain's payment-request contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCall {
    pub request_id: U256,
    pub origin_chain: u64,
    pub target_chain: u64,
    /// ABI-encoded `relayMessage(...)` call
    pub calldata: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
    pub revert_reason: Option<String>,
}

/// Per-chain connectivity plus signing capability
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Whether the chain is reachable and usable right now
    async fn is_chain_ready(&self, chain_key: &str) -> bool;

    /// A contract handle bound to the relay's signing identity on `chain_key`
    async fn signed_contract(&self, chain_key: &str) -> Result<Arc<dyn RelayContract>, ChainError>;
}

/// Signer-bound handle to the payment-request contract on one chain
#[async_trait]
pub trait RelayContract: Send + Sync {
    async fn estimate_gas(&self, call: &RelayCall) -> Result<u64, ChainError>;

    /// Broadcast the call and return its transaction hash
    async fn submit(&self, call: &RelayCall, gas_limit: u64) -> Result<B256, ChainError>;

    /// Resolve once the transaction is mined
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ChainError>;
}
