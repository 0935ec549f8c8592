// Prometheus collectors for the relay engine
pub mod server;

use prometheus::{Counter, GaugeVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

use crate::store::{MessageStatus, QueueStats};

pub struct RelayerMetrics {
    // Delivery outcomes
    pub messages_relayed: Counter,
    pub relays_failed: Counter,
    pub relays_deferred: Counter,
    pub relays_retried: Counter,
    pub messages_expired: Counter,
    pub gas_used: Counter,
    pub relay_duration: Histogram,

    // Queue composition, refreshed on every stats snapshot
    pub queue_depth: GaugeVec,

    registry: Arc<Registry>,
}

impl RelayerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let messages_relayed = Counter::new(
            "payment_relay_messages_relayed_total",
            "Messages delivered on their target chain",
        )?;
        let relays_failed = Counter::new(
            "payment_relay_failed_total",
            "Messages that reached the failed state",
        )?;
        let relays_deferred = Counter::new(
            "payment_relay_deferred_total",
            "Attempts deferred because the target chain was not ready",
        )?;
        let relays_retried = Counter::new(
            "payment_relay_retries_scheduled_total",
            "Retryable failures rescheduled with backoff",
        )?;
        let messages_expired = Counter::new(
            "payment_relay_expired_total",
            "Messages that passed their deadline undelivered",
        )?;
        let gas_used = Counter::new(
            "payment_relay_gas_used_total",
            "Gas consumed by successful deliveries",
        )?;
        let relay_duration = Histogram::with_opts(
            HistogramOpts::new(
                "payment_relay_duration_seconds",
                "Time from dequeue to confirmed delivery",
            )
            .buckets(vec![1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let queue_depth = GaugeVec::new(
            Opts::new("payment_relay_queue_depth", "Queue records by status"),
            &["status"],
        )?;

        registry.register(Box::new(messages_relayed.clone()))?;
        registry.register(Box::new(relays_failed.clone()))?;
        registry.register(Box::new(relays_deferred.clone()))?;
        registry.register(Box::new(relays_retried.clone()))?;
        registry.register(Box::new(messages_expired.clone()))?;
        registry.register(Box::new(gas_used.clone()))?;
        registry.register(Box::new(relay_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            messages_relayed,
            relays_failed,
            relays_deferred,
            relays_retried,
            messages_expired,
            gas_used,
            relay_duration,
            queue_depth,
            registry,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn observe_queue(&self, stats: &QueueStats) {
        for status in MessageStatus::ALL {
            self.queue_depth
                .with_label_values(&[status.as_str()])
                .set(stats.count(status) as f64);
        }
    }

    /// Text exposition of every registered collector
    pub fn render(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = RelayerMetrics::new().unwrap();

        metrics.messages_relayed.inc();
        metrics.relays_failed.inc();
        metrics.gas_used.inc_by(52_000.0);
        metrics.relay_duration.observe(1.5);

        let mut stats = QueueStats::default();
        stats.by_status.insert(MessageStatus::Queued, 4);
        metrics.observe_queue(&stats);

        let families = metrics.registry().gather();
        assert!(!families.is_empty());

        let text = metrics.render().unwrap();
        assert!(text.contains("payment_relay_messages_relayed_total 1"));
        assert!(text.contains("payment_relay_queue_depth{status=\"queued\"} 4"));
        assert!(text.contains("payment_relay_queue_depth{status=\"failed\"} 0"));
    }
}
