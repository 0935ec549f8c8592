// Payment relay library
// Durable cross-chain delivery of payment-request messages

pub mod chains;
pub mod config;
pub mod error;
pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod relay;
pub mod scheduler;
pub mod stats;
pub mod store;

// Re-export commonly used types for convenience
pub use chains::{ChainError, ChainProvider, ChainRegistry, JsonRpcProvider, RelayContract};
pub use config::{ChainConfig, RelayConfig, RelayerConfig};
pub use error::RelayerError;
pub use events::{EventBus, StatusEvent};
#[cfg(feature = "metrics")]
pub use metrics::RelayerMetrics;
pub use relay::{RelayEngine, RelayOutcome, TickOutcome};
pub use stats::{RelayStats, StatsSnapshot};
pub use store::{MessageStatus, QueueStats, QueueStore, QueuedMessage, RecordId, RelayMessage};
