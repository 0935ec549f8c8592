// Queue record types shared by the store, the dispatch loops and the scheduler
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row identifier of a queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be picked up by a dispatch loop
    Queued,
    /// Owned by exactly one dispatch loop
    Processing,
    /// Waiting for `next_retry_at` before going back to `Queued`
    Retry,
    /// Delivered on the target chain
    Completed,
    /// Permanently failed
    Failed,
    /// Deadline passed before delivery
    Expired,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        MessageStatus::Queued,
        MessageStatus::Processing,
        MessageStatus::Retry,
        MessageStatus::Completed,
        MessageStatus::Failed,
        MessageStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Processing => "processing",
            MessageStatus::Retry => "retry",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }

    /// Terminal records are never written again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Completed | MessageStatus::Failed | MessageStatus::Expired
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(MessageStatus::Queued),
            "processing" => Ok(MessageStatus::Processing),
            "retry" => Ok(MessageStatus::Retry),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            "expired" => Ok(MessageStatus::Expired),
            other => Err(format!("unknown message status: {}", other)),
        }
    }
}

/// A cross-chain payment-request message as discovered on the origin chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    /// Request identifier, unique per origin chain only
    pub request_id: U256,
    /// Content fingerprint checked by the target contract
    pub message_hash: B256,
    pub requester: Address,
    pub target: Address,
    /// Amount in the token's native precision
    pub amount: U256,
    /// Token symbol or address, chain specific
    pub token: String,
    pub origin_chain: u64,
    pub target_chain: u64,
    pub message: String,
    /// Creation time on the origin chain
    pub timestamp: DateTime<Utc>,
    /// No delivery may be attempted at or after this instant
    pub expiry_time: DateTime<Utc>,
    /// Provenance, kept for audit only
    pub origin_chain_key: String,
    pub block_number: u64,
    pub tx_hash: B256,
}

impl RelayMessage {
    /// Check the structural invariants the origin contract is supposed to enforce
    pub fn validate(&self) -> Result<(), String> {
        if self.expiry_time <= self.timestamp {
            return Err(format!(
                "expiry time {} is not after creation time {}",
                self.expiry_time, self.timestamp
            ));
        }
        if self.origin_chain == self.target_chain {
            return Err(format!(
                "origin and target chain are both {}",
                self.origin_chain
            ));
        }
        Ok(())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time <= now
    }
}

/// A message together with its relay-control fields, as persisted in the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: RecordId,
    #[serde(flatten)]
    pub message: RelayMessage,
    pub retry_count: u32,
    pub priority: bool,
    pub status: MessageStatus,
    pub queued_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivery_tx_hash: Option<B256>,
}

/// How a record leaves the queue for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Delivered { tx_hash: B256 },
    Failed { reason: String },
}

impl Completion {
    pub fn success(&self) -> bool {
        matches!(self, Completion::Delivered { .. })
    }

    pub fn status(&self) -> MessageStatus {
        if self.success() {
            MessageStatus::Completed
        } else {
            MessageStatus::Failed
        }
    }
}

/// Active records split by lane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneCounts {
    pub priority: u64,
    pub standard: u64,
}

/// A record waiting in the retry state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRetry {
    pub id: RecordId,
    pub request_id: U256,
    pub origin_chain: u64,
    pub target_chain: u64,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Point-in-time composition of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: u64,
    pub by_status: BTreeMap<MessageStatus, u64>,
    /// Target chain -> status -> count
    pub by_chain: BTreeMap<u64, BTreeMap<MessageStatus, u64>>,
    /// Non-terminal records only
    pub by_priority: LaneCounts,
    /// Soonest retries first
    pub pending_retries: Vec<PendingRetry>,
}

impl QueueStats {
    pub fn count(&self, status: MessageStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn chain_count(&self, chain_id: u64, status: MessageStatus) -> u64 {
        self.by_chain
            .get(&chain_id)
            .and_then(|statuses| statuses.get(&status))
            .copied()
            .unwrap_or(0)
    }
}
