// One delivery attempt against a target chain
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::classify::{classify, FailureClass, TransientKind};
use crate::chains::{abi, ChainError, ChainProvider, ChainRegistry, RelayCall};
use crate::config::RelayConfig;
use crate::store::RelayMessage;

/// Ephemeral result of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { tx_hash: B256, gas_used: u64 },
    /// Target chain unreachable or no signer; nothing was sent
    ChainNotReady { reason: String },
    Retryable { error: String, kind: TransientKind },
    Fatal { reason: String },
    /// Deadline passed before the attempt started
    Expired,
}

impl RelayOutcome {
    fn from_error(error: ChainError) -> Self {
        match classify(&error) {
            FailureClass::Retryable(kind) => RelayOutcome::Retryable {
                error: error.to_string(),
                kind,
            },
            FailureClass::Fatal => RelayOutcome::Fatal {
                reason: error.to_string(),
            },
        }
    }

    fn timed_out(operation: &str, limit: Duration) -> Self {
        Self::from_error(ChainError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        })
    }
}

/// Runs the delivery algorithm shared by dispatch loops and manual relay
pub struct Deliverer {
    registry: Arc<ChainRegistry>,
    provider: Arc<dyn ChainProvider>,
    readiness_timeout: Duration,
    submit_timeout: Duration,
    receipt_timeout: Duration,
}

impl Deliverer {
    pub fn new(
        registry: Arc<ChainRegistry>,
        provider: Arc<dyn ChainProvider>,
        relay: &RelayConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            readiness_timeout: relay.readiness_timeout(),
            submit_timeout: relay.submit_timeout(),
            receipt_timeout: relay.receipt_timeout(),
        }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub async fn attempt(&self, message: &RelayMessage, now: DateTime<Utc>) -> RelayOutcome {
        if message.is_expired_at(now) {
            return RelayOutcome::Expired;
        }
        if let Err(reason) = message.validate() {
            return RelayOutcome::Fatal {
                reason: format!("invalid message: {}", reason),
            };
        }

        let Some(chain) = self.registry.by_id(message.target_chain) else {
            return RelayOutcome::Fatal {
                reason: ChainError::UnknownChain(message.target_chain.to_string()).to_string(),
            };
        };

        // Readiness and signer lookup share one bound
        let connect = async {
            if !self.provider.is_chain_ready(&chain.key).await {
                return Err(ChainError::NotReady(chain.key.clone()));
            }
            self.provider.signed_contract(&chain.key).await
        };
        let contract = match timeout(self.readiness_timeout, connect).await {
            Ok(Ok(contract)) => contract,
            Ok(Err(e)) => {
                return RelayOutcome::ChainNotReady {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                return RelayOutcome::ChainNotReady {
                    reason: ChainError::Timeout {
                        operation: format!("connecting to {}", chain.key),
                        seconds: self.readiness_timeout.as_secs(),
                    }
                    .to_string(),
                }
            }
        };

        let call = RelayCall {
            request_id: message.request_id,
            origin_chain: message.origin_chain,
            target_chain: message.target_chain,
            calldata: abi::encode_relay_message(message),
        };

        let estimate = match timeout(self.submit_timeout, contract.estimate_gas(&call)).await {
            Ok(Ok(gas)) => gas,
            Ok(Err(e)) => {
                warn!(request_id = %message.request_id, chain = %chain.key, "Gas estimation failed: {}", e);
                return RelayOutcome::from_error(e);
            }
            Err(_) => return RelayOutcome::timed_out("estimate_gas", self.submit_timeout),
        };
        let gas_limit = chain.config.apply_gas_multiplier(estimate);
        debug!(
            request_id = %message.request_id,
            chain = %chain.key,
            estimate,
            gas_limit,
            "Submitting delivery"
        );

        let tx_hash = match timeout(self.submit_timeout, contract.submit(&call, gas_limit)).await {
            Ok(Ok(tx_hash)) => tx_hash,
            Ok(Err(e)) => {
                warn!(request_id = %message.request_id, chain = %chain.key, "Submission failed: {}", e);
                return RelayOutcome::from_error(e);
            }
            Err(_) => return RelayOutcome::timed_out("submit", self.submit_timeout),
        };

        let receipt = match timeout(self.receipt_timeout, contract.wait_for_receipt(tx_hash)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                warn!(request_id = %message.request_id, %tx_hash, "Receipt lookup failed: {}", e);
                return RelayOutcome::from_error(e);
            }
            Err(_) => return RelayOutcome::timed_out("wait_for_receipt", self.receipt_timeout),
        };

        if receipt.success {
            info!(
                request_id = %message.request_id,
                chain = %chain.key,
                %tx_hash,
                gas_used = receipt.gas_used,
                "Message delivered"
            );
            RelayOutcome::Delivered {
                tx_hash,
                gas_used: receipt.gas_used,
            }
        } else {
            RelayOutcome::from_error(ChainError::Reverted {
                tx_hash,
                reason: receipt
                    .revert_reason
                    .unwrap_or_else(|| "execution reverted".to_string()),
            })
        }
    }
}
