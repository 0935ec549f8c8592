// Relay counters and the read-side status snapshot
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "metrics")]
use crate::metrics::RelayerMetrics;
use crate::store::QueueStats;

/// Process-lifetime counters, safe for concurrent readers and writers
pub struct RelayStats {
    started: Instant,
    started_at: DateTime<Utc>,
    messages_relayed: AtomicU64,
    failed_relays: AtomicU64,
    deferred_relays: AtomicU64,
    retries_scheduled: AtomicU64,
    expired_messages: AtomicU64,
    total_gas_used: AtomicU64,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<RelayerMetrics>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub messages_relayed: u64,
    pub failed_relays: u64,
    pub deferred_relays: u64,
    pub retries_scheduled: u64,
    pub expired_messages: u64,
    pub total_gas_used: u64,
    /// Percentage of finished attempts that succeeded
    pub success_rate: f64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    /// Human readable, e.g. `2h 3m 4s`
    pub uptime: String,
    pub queue: QueueStats,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            messages_relayed: AtomicU64::new(0),
            failed_relays: AtomicU64::new(0),
            deferred_relays: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            expired_messages: AtomicU64::new(0),
            total_gas_used: AtomicU64::new(0),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Mirror every update into Prometheus collectors
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<Arc<RelayerMetrics>> {
        self.metrics.clone()
    }

    pub fn record_delivered(&self, gas_used: u64, elapsed: Duration) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
        self.total_gas_used.fetch_add(gas_used, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.messages_relayed.inc();
                metrics.gas_used.inc_by(gas_used as f64);
                metrics.relay_duration.observe(elapsed.as_secs_f64());
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = elapsed;
    }

    pub fn record_failed(&self) {
        self.failed_relays.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.relays_failed.inc();
            }
        }
    }

    pub fn record_deferred(&self) {
        self.deferred_relays.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.relays_deferred.inc();
            }
        }
    }

    pub fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.relays_retried.inc();
            }
        }
    }

    pub fn record_expired(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.expired_messages.fetch_add(count, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.messages_expired.inc_by(count as f64);
            }
        }
    }

    pub fn messages_relayed(&self) -> u64 {
        self.messages_relayed.load(Ordering::Relaxed)
    }

    pub fn failed_relays(&self) -> u64 {
        self.failed_relays.load(Ordering::Relaxed)
    }

    /// `relayed / (relayed + failed)` as a percentage, 100 when nothing finished yet
    pub fn success_rate(&self) -> f64 {
        let relayed = self.messages_relayed() as f64;
        let failed = self.failed_relays() as f64;
        if relayed + failed == 0.0 {
            100.0
        } else {
            relayed / (relayed + failed) * 100.0
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Combine the counters with a queue composition read from the store
    pub fn snapshot(&self, queue: QueueStats) -> StatsSnapshot {
        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                metrics.observe_queue(&queue);
            }
        }

        let uptime = Duration::from_secs(self.uptime().as_secs());
        StatsSnapshot {
            messages_relayed: self.messages_relayed(),
            failed_relays: self.failed_relays(),
            deferred_relays: self.deferred_relays.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            expired_messages: self.expired_messages.load(Ordering::Relaxed),
            total_gas_used: self.total_gas_used.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
            started_at: self.started_at,
            uptime_seconds: uptime.as_secs(),
            uptime: humantime::format_duration(uptime).to_string(),
            queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let stats = RelayStats::new();
        assert_eq!(stats.success_rate(), 100.0);

        stats.record_delivered(50_000, Duration::from_secs(3));
        stats.record_delivered(70_000, Duration::from_secs(4));
        stats.record_delivered(30_000, Duration::from_secs(2));
        stats.record_failed();
        assert_eq!(stats.success_rate(), 75.0);

        // Deferrals and retries don't count as finished attempts
        stats.record_deferred();
        stats.record_retry();
        assert_eq!(stats.success_rate(), 75.0);

        let snapshot = stats.snapshot(QueueStats::default());
        assert_eq!(snapshot.messages_relayed, 3);
        assert_eq!(snapshot.failed_relays, 1);
        assert_eq!(snapshot.deferred_relays, 1);
        assert_eq!(snapshot.retries_scheduled, 1);
        assert_eq!(snapshot.total_gas_used, 150_000);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_counters_are_mirrored() {
        let metrics = Arc::new(RelayerMetrics::new().unwrap());
        let stats = RelayStats::new().with_metrics(metrics.clone());

        stats.record_delivered(21_000, Duration::from_millis(800));
        stats.record_expired(2);

        assert_eq!(metrics.messages_relayed.get(), 1.0);
        assert_eq!(metrics.gas_used.get(), 21_000.0);
        assert_eq!(metrics.messages_expired.get(), 2.0);
    }
}
