// Status-change notifications
//
// Events are emitted only for rows a conditional update actually changed, so
// each applied transition is published once.

use alloy_primitives::{B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::store::{MessageStatus, QueuedMessage, RecordId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub record_id: RecordId,
    pub request_id: U256,
    pub origin_chain: u64,
    pub target_chain: u64,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub tx_hash: Option<B256>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    /// Event for a record whose status is `status` as of `at`
    pub fn for_record(record: &QueuedMessage, status: MessageStatus, at: DateTime<Utc>) -> Self {
        Self {
            record_id: record.id,
            request_id: record.message.request_id,
            origin_chain: record.message.origin_chain,
            target_chain: record.message.target_chain,
            status,
            retry_count: record.retry_count,
            next_retry_at: record.next_retry_at,
            tx_hash: record.delivery_tx_hash,
            error: record.last_error.clone(),
            at,
        }
    }

    pub fn with_retry(mut self, retry_count: u32, next_retry_at: DateTime<Utc>) -> Self {
        self.retry_count = retry_count;
        self.next_retry_at = Some(next_retry_at);
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: B256) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Broadcast fan-out of status events; slow subscribers lag and lose events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: StatusEvent) {
        trace!(
            record_id = %event.record_id,
            status = %event.status,
            "Status event"
        );
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let event = StatusEvent {
            record_id: RecordId(1),
            request_id: U256::from(1u64),
            origin_chain: 11155111,
            target_chain: 84532,
            status: MessageStatus::Queued,
            retry_count: 0,
            next_retry_at: None,
            tx_hash: None,
            error: None,
            at: Utc::now(),
        };
        bus.emit(event.clone());
        bus.emit(event.clone().with_error("boom"));

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(rx.recv().await.unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(1);
        bus.emit(StatusEvent {
            record_id: RecordId(2),
            request_id: U256::from(2u64),
            origin_chain: 1,
            target_chain: 2,
            status: MessageStatus::Expired,
            retry_count: 0,
            next_retry_at: None,
            tx_hash: None,
            error: None,
            at: Utc::now(),
        });
    }
}
