// Per-chain dispatch loop
//
// Each loop owns at most one in-flight attempt. A tick that finds the previous
// attempt still running is skipped rather than queued up behind it.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::delivery::{Deliverer, RelayOutcome};
use super::retry::{RetryDecision, RetryPolicy};
use crate::events::{EventBus, StatusEvent};
use crate::stats::RelayStats;
use crate::store::{Completion, MessageStatus, QueueStore, QueuedMessage, RecordId, StoreError};

/// Which slice of the queue a dispatcher serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lane {
    /// Messages targeting `chain_id` first, then anything else eligible
    Chain { chain_id: u64, key: String },
    /// Priority messages for any chain
    Priority,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Chain { key, .. } => write!(f, "{}", key),
            Lane::Priority => f.write_str("priority"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Previous attempt still outstanding
    Busy,
    /// Nothing eligible
    Idle,
    /// One record attempted; `status` is where it ended up
    Processed {
        record_id: RecordId,
        status: MessageStatus,
    },
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChainDispatcher {
    lane: Lane,
    store: QueueStore,
    deliverer: Arc<Deliverer>,
    policy: RetryPolicy,
    stats: Arc<RelayStats>,
    events: EventBus,
    busy: AtomicBool,
}

impl ChainDispatcher {
    pub fn new(
        lane: Lane,
        store: QueueStore,
        deliverer: Arc<Deliverer>,
        policy: RetryPolicy,
        stats: Arc<RelayStats>,
        events: EventBus,
    ) -> Self {
        Self {
            lane,
            store,
            deliverer,
            policy,
            stats,
            events,
            busy: AtomicBool::new(false),
        }
    }

    pub fn lane(&self) -> &Lane {
        &self.lane
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Poll on `poll_interval` until shutdown is signalled. The attempt in
    /// progress always finishes before the loop exits.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(lane = %self.lane, "Dispatch loop started");
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Processed { record_id, status }) => {
                            debug!(lane = %self.lane, %record_id, %status, "Attempt finished");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(lane = %self.lane, "Dispatch tick failed: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(lane = %self.lane, "Dispatch loop stopped");
    }

    /// Claim and attempt at most one message
    pub async fn tick(&self) -> Result<TickOutcome, StoreError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Ok(TickOutcome::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        let now = Utc::now();
        let claimed = match &self.lane {
            Lane::Chain { chain_id, .. } => self.store.dequeue_next(Some(*chain_id), now).await?,
            Lane::Priority => self.store.dequeue_next_priority(now).await?,
        };
        let Some(record) = claimed else {
            return Ok(TickOutcome::Idle);
        };

        debug!(
            lane = %self.lane,
            record_id = %record.id,
            request_id = %record.message.request_id,
            target_chain = record.message.target_chain,
            retry_count = record.retry_count,
            "Claimed message"
        );
        self.events
            .emit(StatusEvent::for_record(&record, MessageStatus::Processing, now));

        let started = Instant::now();
        let outcome = self.deliverer.attempt(&record.message, Utc::now()).await;
        let status = self.apply(&record, outcome, started).await?;

        Ok(TickOutcome::Processed {
            record_id: record.id,
            status,
        })
    }

    async fn apply(
        &self,
        record: &QueuedMessage,
        outcome: RelayOutcome,
        started: Instant,
    ) -> Result<MessageStatus, StoreError> {
        let now = Utc::now();
        match outcome {
            RelayOutcome::Delivered { tx_hash, gas_used } => {
                let applied = self
                    .store
                    .mark_completed(record.id, Completion::Delivered { tx_hash }, now)
                    .await?;
                if applied {
                    self.stats.record_delivered(gas_used, started.elapsed());
                    self.events.emit(
                        StatusEvent::for_record(record, MessageStatus::Completed, now)
                            .with_tx_hash(tx_hash),
                    );
                } else {
                    warn!(record_id = %record.id, %tx_hash, "Delivered record was already terminal");
                }
                self.current_status(record.id, MessageStatus::Completed).await
            }
            RelayOutcome::Expired => {
                self.fail(record, "message expired before delivery".to_string(), now)
                    .await
            }
            RelayOutcome::Fatal { reason } => self.fail(record, reason, now).await,
            RelayOutcome::ChainNotReady { reason } => {
                let delay = self.policy.defer_delay();
                if self.store.defer(record.id, delay, &reason, now).await? {
                    self.stats.record_deferred();
                    info!(
                        record_id = %record.id,
                        target_chain = record.message.target_chain,
                        "Target chain unavailable, deferring: {}",
                        reason
                    );
                    self.events.emit(
                        StatusEvent::for_record(record, MessageStatus::Retry, now)
                            .with_retry(record.retry_count, now + chrono_delay(delay))
                            .with_error(reason),
                    );
                }
                self.current_status(record.id, MessageStatus::Retry).await
            }
            RelayOutcome::Retryable { error, kind } => match self.policy.decide(record.retry_count) {
                RetryDecision::GiveUp => {
                    let reason = format!(
                        "retry budget exhausted after {} attempts: {}",
                        record.retry_count + 1,
                        error
                    );
                    self.fail(record, reason, now).await
                }
                RetryDecision::RetryAfter(delay) => {
                    if self.store.schedule_retry(record.id, delay, &error, now).await? {
                        self.stats.record_retry();
                        warn!(
                            record_id = %record.id,
                            request_id = %record.message.request_id,
                            retry_count = record.retry_count + 1,
                            kind = %kind,
                            delay = %humantime::format_duration(delay),
                            "Retryable delivery failure: {}",
                            error
                        );
                        self.events.emit(
                            StatusEvent::for_record(record, MessageStatus::Retry, now)
                                .with_retry(record.retry_count + 1, now + chrono_delay(delay))
                                .with_error(error),
                        );
                    }
                    self.current_status(record.id, MessageStatus::Retry).await
                }
            },
        }
    }

    async fn fail(
        &self,
        record: &QueuedMessage,
        reason: String,
        now: chrono::DateTime<Utc>,
    ) -> Result<MessageStatus, StoreError> {
        let applied = self
            .store
            .mark_completed(
                record.id,
                Completion::Failed {
                    reason: reason.clone(),
                },
                now,
            )
            .await?;
        if applied {
            self.stats.record_failed();
            error!(
                record_id = %record.id,
                request_id = %record.message.request_id,
                target_chain = record.message.target_chain,
                "Delivery failed permanently: {}",
                reason
            );
            self.events.emit(
                StatusEvent::for_record(record, MessageStatus::Failed, now).with_error(reason),
            );
        }
        self.current_status(record.id, MessageStatus::Failed).await
    }

    async fn current_status(
        &self,
        id: RecordId,
        expected: MessageStatus,
    ) -> Result<MessageStatus, StoreError> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(|record| record.status)
            .unwrap_or(expected))
    }
}

pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}
