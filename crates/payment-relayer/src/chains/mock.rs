// Scripted in-process provider for dispatch tests
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy_primitives::{B256, U256};
use async_trait::async_trait;

use super::{ChainError, ChainProvider, RelayCall, RelayContract, TxReceipt};

/// What the next delivery on a chain does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Mined successfully
    Success { gas_used: u64 },
    /// Mined but reverted
    Revert { reason: String },
    /// `submit` fails with an RPC error
    SubmitError(String),
    /// `estimate_gas` fails with an RPC error
    EstimateError(String),
    /// `submit` never returns
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSubmission {
    pub chain_key: String,
    pub request_id: U256,
    pub target_chain: u64,
    pub gas_limit: u64,
    pub tx_hash: B256,
}

struct MockState {
    not_ready: HashSet<String>,
    no_signer: HashSet<String>,
    scripts: HashMap<String, VecDeque<MockOutcome>>,
    default_outcome: MockOutcome,
    gas_estimate: u64,
    submissions: Vec<MockSubmission>,
    pending: HashMap<B256, MockOutcome>,
    next_tx: u64,
    /// Added to every estimate, submit and receipt call
    call_latency: Duration,
    readiness_latency: Duration,
}

#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Every chain ready, every delivery succeeds
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                not_ready: HashSet::new(),
                no_signer: HashSet::new(),
                scripts: HashMap::new(),
                default_outcome: MockOutcome::Success { gas_used: 52_000 },
                gas_estimate: 60_000,
                submissions: Vec::new(),
                pending: HashMap::new(),
                next_tx: 1,
                call_latency: Duration::ZERO,
                readiness_latency: Duration::ZERO,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_ready(&self, chain_key: &str, ready: bool) {
        let mut state = self.lock();
        if ready {
            state.not_ready.remove(chain_key);
        } else {
            state.not_ready.insert(chain_key.to_string());
        }
    }

    pub fn set_signer_available(&self, chain_key: &str, available: bool) {
        let mut state = self.lock();
        if available {
            state.no_signer.remove(chain_key);
        } else {
            state.no_signer.insert(chain_key.to_string());
        }
    }

    /// Queue an outcome for the next delivery on `chain_key`
    pub fn push_outcome(&self, chain_key: &str, outcome: MockOutcome) {
        self.lock()
            .scripts
            .entry(chain_key.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Outcome used once a chain's script is exhausted
    pub fn set_default_outcome(&self, outcome: MockOutcome) {
        self.lock().default_outcome = outcome;
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.lock().gas_estimate = gas;
    }

    /// Slow down each contract call as a congested node would
    pub fn set_call_latency(&self, latency: Duration) {
        self.lock().call_latency = latency;
    }

    pub fn set_readiness_latency(&self, latency: Duration) {
        self.lock().readiness_latency = latency;
    }

    async fn delay(&self, readiness: bool) {
        let latency = {
            let state = self.lock();
            if readiness {
                state.readiness_latency
            } else {
                state.call_latency
            }
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn is_chain_ready(&self, chain_key: &str) -> bool {
        self.delay(true).await;
        !self.lock().not_ready.contains(chain_key)
    }

    async fn signed_contract(&self, chain_key: &str) -> Result<Arc<dyn RelayContract>, ChainError> {
        if self.lock().no_signer.contains(chain_key) {
            return Err(ChainError::NotReady(format!("no signer for {}", chain_key)));
        }
        Ok(Arc::new(MockContract {
            chain_key: chain_key.to_string(),
            provider: self.clone(),
        }))
    }
}

struct MockContract {
    chain_key: String,
    provider: MockProvider,
}

impl MockContract {
    fn next_outcome(state: &mut MockState, chain_key: &str) -> MockOutcome {
        state
            .scripts
            .get_mut(chain_key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| state.default_outcome.clone())
    }
}

#[async_trait]
impl RelayContract for MockContract {
    async fn estimate_gas(&self, _call: &RelayCall) -> Result<u64, ChainError> {
        self.provider.delay(false).await;
        let mut state = self.provider.lock();
        let next = state
            .scripts
            .get(&self.chain_key)
            .and_then(|script| script.front().cloned());
        if let Some(MockOutcome::EstimateError(message)) = next {
            if let Some(script) = state.scripts.get_mut(&self.chain_key) {
                script.pop_front();
            }
            return Err(ChainError::Rpc {
                code: -32000,
                message,
                data: None,
            });
        }
        Ok(state.gas_estimate)
    }

    async fn submit(&self, call: &RelayCall, gas_limit: u64) -> Result<B256, ChainError> {
        self.provider.delay(false).await;
        let outcome = {
            let mut state = self.provider.lock();
            Self::next_outcome(&mut state, &self.chain_key)
        };

        match outcome {
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(ChainError::Transport("unreachable".to_string()))
            }
            MockOutcome::SubmitError(message) | MockOutcome::EstimateError(message) => {
                Err(ChainError::Rpc {
                    code: -32000,
                    message,
                    data: None,
                })
            }
            outcome => {
                let mut state = self.provider.lock();
                let tx_hash = B256::left_padding_from(&state.next_tx.to_be_bytes());
                state.next_tx += 1;
                state.pending.insert(tx_hash, outcome);
                state.submissions.push(MockSubmission {
                    chain_key: self.chain_key.clone(),
                    request_id: call.request_id,
                    target_chain: call.target_chain,
                    gas_limit,
                    tx_hash,
                });
                Ok(tx_hash)
            }
        }
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ChainError> {
        self.provider.delay(false).await;
        let outcome = self.provider.lock().pending.remove(&tx_hash);
        match outcome {
            Some(MockOutcome::Success { gas_used }) => Ok(TxReceipt {
                tx_hash,
                block_number: 1,
                gas_used,
                success: true,
                revert_reason: None,
            }),
            Some(MockOutcome::Revert { reason }) => Ok(TxReceipt {
                tx_hash,
                block_number: 1,
                gas_used: 30_000,
                success: false,
                revert_reason: Some(reason),
            }),
            _ => Err(ChainError::InvalidResponse(format!(
                "unknown transaction {}",
                tx_hash
            ))),
        }
    }
}
