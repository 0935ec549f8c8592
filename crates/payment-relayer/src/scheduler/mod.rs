// Retry promotion, expiry sweeping and crash recovery
//
// The scheduler only moves records between non-owned states; it never touches
// a `processing` record a live attempt could still hold.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::events::{EventBus, StatusEvent};
use crate::stats::RelayStats;
use crate::store::{MessageStatus, QueueStore, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub recovered: usize,
}

pub struct Scheduler {
    store: QueueStore,
    events: EventBus,
    stats: Arc<RelayStats>,
    promote_interval: Duration,
    sweep_interval: Duration,
    grace_period: Duration,
    stale_processing_age: Duration,
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Scheduler {
    pub fn new(
        store: QueueStore,
        events: EventBus,
        stats: Arc<RelayStats>,
        relay: &RelayConfig,
    ) -> Self {
        Self {
            store,
            events,
            stats,
            promote_interval: relay.retry_promote_interval(),
            sweep_interval: relay.expiry_sweep_interval(),
            grace_period: relay.processing_grace_period(),
            stale_processing_age: relay.stale_processing_age(),
        }
    }

    /// Requeue `processing` records left behind by a previous process.
    ///
    /// Must run before any dispatch loop starts.
    pub async fn startup_recovery(&self) -> Result<usize, StoreError> {
        self.startup_recovery_at(Utc::now()).await
    }

    pub async fn startup_recovery_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let recovered = self
            .store
            .recover_stale_processing(before(now, self.grace_period))
            .await?;
        for record in &recovered {
            warn!(
                record_id = %record.id,
                request_id = %record.message.request_id,
                "Recovered message left in processing by a previous run"
            );
            self.events
                .emit(StatusEvent::for_record(record, MessageStatus::Queued, now));
        }
        if !recovered.is_empty() {
            info!("Startup recovery requeued {} message(s)", recovered.len());
        }
        Ok(recovered.len())
    }

    /// `retry -> queued` for every record whose backoff elapsed
    pub async fn promote_once(&self) -> Result<usize, StoreError> {
        self.promote_at(Utc::now()).await
    }

    pub async fn promote_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let promoted = self.store.promote_due_retries(now).await?;
        for record in &promoted {
            self.events.emit(StatusEvent::for_record(record, MessageStatus::Queued, now));
        }
        if !promoted.is_empty() {
            debug!("Promoted {} retry message(s)", promoted.len());
        }
        Ok(promoted.len())
    }

    /// Expire overdue messages and requeue stale `processing` records
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let expired = self.store.expire_overdue(now).await?;
        for record in &expired {
            info!(
                record_id = %record.id,
                request_id = %record.message.request_id,
                expiry_time = %record.message.expiry_time,
                "Message expired undelivered"
            );
            self.events.emit(StatusEvent::for_record(record, MessageStatus::Expired, now));
        }
        self.stats.record_expired(expired.len() as u64);

        let recovered = self
            .store
            .recover_stale_processing(before(now, self.stale_processing_age))
            .await?;
        for record in &recovered {
            warn!(
                record_id = %record.id,
                request_id = %record.message.request_id,
                "Requeued message stuck in processing"
            );
            self.events.emit(StatusEvent::for_record(record, MessageStatus::Queued, now));
        }

        Ok(SweepReport {
            expired: expired.len(),
            recovered: recovered.len(),
        })
    }

    /// Start the promoter and sweeper timers
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let promoter = {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = interval(scheduler.promote_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.promote_once().await {
                                error!("Retry promotion failed: {}", e);
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Retry promoter stopped");
            })
        };

        let sweeper = {
            let scheduler = self;
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut ticker = interval(scheduler.sweep_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.sweep_once().await {
                                error!("Expiry sweep failed: {}", e);
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Expiry sweeper stopped");
            })
        };

        vec![promoter, sweeper]
    }
}
