// Relay engine: wires the store, dispatch loops, scheduler and stats together
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::U256;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::delivery::{Deliverer, RelayOutcome};
use super::dispatcher::{ChainDispatcher, Lane};
use super::retry::RetryPolicy;
use crate::chains::{ChainProvider, ChainRegistry};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, Result};
use crate::events::{EventBus, StatusEvent};
use crate::scheduler::Scheduler;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::store::{MessageStatus, QueueStore, RelayMessage};

pub struct RelayEngine {
    config: RelayerConfig,
    store: QueueStore,
    registry: Arc<ChainRegistry>,
    deliverer: Arc<Deliverer>,
    stats: Arc<RelayStats>,
    events: EventBus,
    scheduler: Arc<Scheduler>,
    /// One per registered chain
    dispatchers: Vec<Arc<ChainDispatcher>>,
    priority: Option<Arc<ChainDispatcher>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl RelayEngine {
    pub fn new(
        config: RelayerConfig,
        store: QueueStore,
        provider: Arc<dyn ChainProvider>,
    ) -> Result<Self> {
        Self::with_stats(config, store, provider, RelayStats::new())
    }

    pub fn with_stats(
        config: RelayerConfig,
        store: QueueStore,
        provider: Arc<dyn ChainProvider>,
        stats: RelayStats,
    ) -> Result<Self> {
        let registry = Arc::new(ChainRegistry::from_config(&config)?);
        let stats = Arc::new(stats);
        let events = EventBus::new(config.relay.event_channel_capacity);
        let policy = RetryPolicy::from_config(&config.relay);
        let deliverer = Arc::new(Deliverer::new(registry.clone(), provider, &config.relay));

        let dispatchers = registry
            .iter()
            .map(|chain| {
                Arc::new(ChainDispatcher::new(
                    Lane::Chain {
                        chain_id: chain.chain_id(),
                        key: chain.key.clone(),
                    },
                    store.clone(),
                    deliverer.clone(),
                    policy,
                    stats.clone(),
                    events.clone(),
                ))
            })
            .collect();

        let priority = config.relay.priority_lane.then(|| {
            Arc::new(ChainDispatcher::new(
                Lane::Priority,
                store.clone(),
                deliverer.clone(),
                policy,
                stats.clone(),
                events.clone(),
            ))
        });

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            events.clone(),
            stats.clone(),
            &config.relay,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            registry,
            deliverer,
            stats,
            events,
            scheduler,
            dispatchers,
            priority,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Run startup recovery, then spawn every dispatch loop and the scheduler timers
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RelayerError::AlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);

        if let Err(e) = self.scheduler.startup_recovery().await {
            self.running.store(false, Ordering::Release);
            return Err(e.into());
        }

        let poll_interval = self.config.relay.poll_interval();
        let mut tasks = self.tasks.lock().await;
        for dispatcher in self.dispatchers.iter().chain(self.priority.iter()) {
            tasks.push(tokio::spawn(
                dispatcher
                    .clone()
                    .run(poll_interval, self.shutdown_tx.subscribe()),
            ));
        }
        tasks.extend(self.scheduler.clone().spawn(self.shutdown_tx.subscribe()));

        info!(
            chains = self.dispatchers.len(),
            priority_lane = self.priority.is_some(),
            "Relay engine started"
        );
        Ok(())
    }

    /// Signal every task and wait for in-flight attempts to finish
    pub async fn shutdown(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        info!("Shutting down relay engine");
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Relay task ended abnormally: {}", e);
            }
        }
        self.running.store(false, Ordering::Release);
        info!("Relay engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a message discovered by ingestion. `false` means rejected
    /// (expired, invalid or already known), not an error.
    pub async fn enqueue(&self, message: &RelayMessage, is_priority: bool) -> Result<bool> {
        let now = Utc::now();
        let Some(id) = self.store.enqueue(message, is_priority, now).await? else {
            return Ok(false);
        };

        info!(
            record_id = %id,
            request_id = %message.request_id,
            origin_chain = message.origin_chain,
            target_chain = message.target_chain,
            priority = is_priority,
            "Message queued"
        );
        if let Some(record) = self.store.get(id).await? {
            self.events
                .emit(StatusEvent::for_record(&record, MessageStatus::Queued, now));
        }
        Ok(true)
    }

    /// Deliver a message immediately, bypassing the queue.
    ///
    /// On success a matching queued or retrying record is marked completed so
    /// the dispatch loops won't deliver it a second time.
    pub async fn manual_relay(&self, request_id: U256, message: &RelayMessage) -> Result<bool> {
        if message.request_id != request_id {
            return Err(RelayerError::Validation(format!(
                "request id {} does not match message request id {}",
                request_id, message.request_id
            )));
        }

        let started = std::time::Instant::now();
        let outcome = self.deliverer.attempt(message, Utc::now()).await;
        match outcome {
            RelayOutcome::Delivered { tx_hash, gas_used } => {
                self.stats.record_delivered(gas_used, started.elapsed());
                let now = Utc::now();
                if let Some(record) = self.store.find(message.origin_chain, request_id).await? {
                    if self.store.complete_unclaimed(record.id, tx_hash, now).await? {
                        info!(record_id = %record.id, %tx_hash, "Queued copy marked completed after manual relay");
                        self.events.emit(
                            StatusEvent::for_record(&record, MessageStatus::Completed, now)
                                .with_tx_hash(tx_hash),
                        );
                    }
                }
                Ok(true)
            }
            RelayOutcome::ChainNotReady { reason } => {
                self.stats.record_deferred();
                warn!(%request_id, "Manual relay skipped: {}", reason);
                Ok(false)
            }
            RelayOutcome::Retryable { error, .. } => {
                self.stats.record_failed();
                warn!(%request_id, "Manual relay failed: {}", error);
                Ok(false)
            }
            RelayOutcome::Fatal { reason } => {
                self.stats.record_failed();
                warn!(%request_id, "Manual relay failed: {}", reason);
                Ok(false)
            }
            RelayOutcome::Expired => {
                self.stats.record_failed();
                warn!(%request_id, "Manual relay refused: message expired");
                Ok(false)
            }
        }
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let queue = self.store.stats().await?;
        Ok(self.stats.snapshot(queue))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn dispatcher(&self, chain_id: u64) -> Option<Arc<ChainDispatcher>> {
        self.dispatchers
            .iter()
            .find(|d| matches!(d.lane(), Lane::Chain { chain_id: id, .. } if *id == chain_id))
            .cloned()
    }

    pub fn priority_dispatcher(&self) -> Option<Arc<ChainDispatcher>> {
        self.priority.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub fn relay_stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    pub fn config(&self) -> &RelayerConfig {
        &self.config
    }
}
