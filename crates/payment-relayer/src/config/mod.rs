use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use thiserror::Error;

/// Prefix for environment overrides, e.g. `RELAYER__RELAY__MAX_RETRY_ATTEMPTS=5`
pub const ENV_PREFIX: &str = "RELAYER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub global: GlobalConfig,
    pub relay: RelayConfig,
    /// Chain key (e.g. `base-sepolia`) -> descriptor
    pub chains: BTreeMap<String, ChainConfig>,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Log level for the relayer
    pub log_level: String,
    /// SQLite file holding the relay queue
    pub database_path: PathBuf,
}

/// Dispatch, retry and expiry timing. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub max_retry_attempts: u32,
    pub submit_timeout_ms: u64,
    pub receipt_timeout_ms: u64,
    pub receipt_poll_interval_ms: u64,
    pub readiness_timeout_ms: u64,
    pub retry_promote_interval_ms: u64,
    pub expiry_sweep_interval_ms: u64,
    /// How long a `processing` record must sit untouched before recovery may requeue it
    pub processing_grace_period_ms: u64,
    /// Run the extra loop that serves the priority lane across all chains
    pub priority_lane: bool,
    pub event_channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Numeric EVM chain id
    pub chain_id: u64,
    /// Display name
    pub name: String,
    /// JSON-RPC endpoint
    pub rpc_endpoint: String,
    /// Payment-request contract that accepts relayed messages
    pub contract_address: String,
    /// Account the node signs delivery transactions with
    pub relayer_address: String,
    /// Applied to every gas estimate, must be >= 1.0
    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
    /// Log scan window for the indexer
    #[serde(default = "default_max_log_block_range")]
    pub max_log_block_range: u64,
    /// Indexer falls back to unfiltered log queries
    #[serde(default)]
    pub disable_event_filters: bool,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics server
    pub enabled: bool,
    /// Metrics server host
    pub host: String,
    /// Metrics server port
    pub port: u16,
}

fn default_gas_multiplier() -> f64 {
    1.2
}

fn default_max_log_block_range() -> u64 {
    10_000
}

fn default_confirmations() -> u64 {
    1
}

impl RelayerConfig {
    /// Load configuration from a TOML file, then apply `RELAYER__*` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: RelayerConfig = settings.try_deserialize()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get chain configuration by key
    pub fn get_chain(&self, key: &str) -> Option<&ChainConfig> {
        self.chains.get(key)
    }

    /// Check everything the relay engine relies on at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("no chains configured".to_string()));
        }

        let mut seen_ids = HashSet::new();
        for (key, chain) in &self.chains {
            if key.trim().is_empty() {
                return Err(ConfigError::Invalid("empty chain key".to_string()));
            }
            if !seen_ids.insert(chain.chain_id) {
                return Err(ConfigError::Invalid(format!(
                    "chain id {} is configured more than once",
                    chain.chain_id
                )));
            }
            chain.validate(key)?;
        }

        let relay = &self.relay;
        let intervals = [
            ("poll_interval_ms", relay.poll_interval_ms),
            ("retry_base_delay_ms", relay.retry_base_delay_ms),
            ("submit_timeout_ms", relay.submit_timeout_ms),
            ("receipt_timeout_ms", relay.receipt_timeout_ms),
            ("receipt_poll_interval_ms", relay.receipt_poll_interval_ms),
            ("readiness_timeout_ms", relay.readiness_timeout_ms),
            ("retry_promote_interval_ms", relay.retry_promote_interval_ms),
            ("expiry_sweep_interval_ms", relay.expiry_sweep_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("relay.{} must be positive", name)));
            }
        }
        if relay.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "relay.event_channel_capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl ChainConfig {
    fn validate(&self, key: &str) -> Result<(), ConfigError> {
        if !self.gas_multiplier.is_finite() || self.gas_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "chain {}: gas_multiplier must be >= 1.0, got {}",
                key, self.gas_multiplier
            )));
        }
        if self.max_log_block_range == 0 {
            return Err(ConfigError::Invalid(format!(
                "chain {}: max_log_block_range must be positive",
                key
            )));
        }
        reqwest::Url::parse(&self.rpc_endpoint).map_err(|e| {
            ConfigError::Invalid(format!("chain {}: bad rpc_endpoint: {}", key, e))
        })?;
        self.contract()
            .map_err(|e| ConfigError::Invalid(format!("chain {}: {}", key, e)))?;
        self.relayer()
            .map_err(|e| ConfigError::Invalid(format!("chain {}: {}", key, e)))?;
        Ok(())
    }

    pub fn contract(&self) -> Result<Address, String> {
        self.contract_address
            .parse()
            .map_err(|e| format!("bad contract_address {:?}: {}", self.contract_address, e))
    }

    pub fn relayer(&self) -> Result<Address, String> {
        self.relayer_address
            .parse()
            .map_err(|e| format!("bad relayer_address {:?}: {}", self.relayer_address, e))
    }

    /// `ceil(estimate * gas_multiplier)`
    pub fn apply_gas_multiplier(&self, estimate: u64) -> u64 {
        let scaled = (estimate as f64 * self.gas_multiplier).ceil();
        if scaled >= u64::MAX as f64 {
            u64::MAX
        } else {
            scaled as u64
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn retry_promote_interval(&self) -> Duration {
        Duration::from_millis(self.retry_promote_interval_ms)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_sweep_interval_ms)
    }

    pub fn processing_grace_period(&self) -> Duration {
        Duration::from_millis(self.processing_grace_period_ms)
    }

    /// Longest a single delivery attempt can run: the connect bound, gas
    /// estimation and submission (each bounded by `submit_timeout`), then
    /// the receipt wait
    pub fn max_attempt_duration(&self) -> Duration {
        self.readiness_timeout() + self.submit_timeout() * 2 + self.receipt_timeout()
    }

    /// Age after which no live attempt can still own a `processing` record
    pub fn stale_processing_age(&self) -> Duration {
        self.max_attempt_duration() + self.processing_grace_period()
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("payment-relayer");
        Self {
            log_level: "info".to_string(),
            database_path: data_dir.join("relay_queue.db"),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            retry_base_delay_ms: 30_000,
            max_retry_attempts: 3,
            submit_timeout_ms: 60_000,
            receipt_timeout_ms: 120_000,
            receipt_poll_interval_ms: 2_000,
            readiness_timeout_ms: 5_000,
            retry_promote_interval_ms: 5_000,
            expiry_sweep_interval_ms: 60_000,
            processing_grace_period_ms: 30_000,
            priority_lane: true,
            event_channel_capacity: 1_024,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 3001,
        }
    }
}

fn testnet_chain(
    chain_id: u64,
    name: &str,
    rpc_endpoint: &str,
    gas_multiplier: f64,
    max_log_block_range: u64,
    disable_event_filters: bool,
) -> ChainConfig {
    ChainConfig {
        chain_id,
        name: name.to_string(),
        rpc_endpoint: rpc_endpoint.to_string(),
        contract_address: Address::ZERO.to_string(),
        relayer_address: Address::ZERO.to_string(),
        gas_multiplier,
        max_log_block_range,
        disable_event_filters,
        confirmations: 1,
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        let mut chains = BTreeMap::new();

        chains.insert(
            "base-sepolia".to_string(),
            testnet_chain(84532, "Base Sepolia", "https://sepolia.base.org", 1.2, 10_000, false),
        );
        chains.insert(
            "sepolia".to_string(),
            testnet_chain(
                11155111,
                "Ethereum Sepolia",
                "https://ethereum-sepolia-rpc.publicnode.com",
                1.2,
                5_000,
                false,
            ),
        );
        chains.insert(
            "arbitrum-sepolia".to_string(),
            testnet_chain(
                421614,
                "Arbitrum Sepolia",
                "https://sepolia-rollup.arbitrum.io/rpc",
                1.5,
                10_000,
                false,
            ),
        );
        chains.insert(
            "optimism-sepolia".to_string(),
            testnet_chain(
                11155420,
                "Optimism Sepolia",
                "https://sepolia.optimism.io",
                1.2,
                10_000,
                false,
            ),
        );
        // Amoy RPCs reject topic filters on wide ranges
        chains.insert(
            "polygon-amoy".to_string(),
            testnet_chain(
                80002,
                "Polygon Amoy",
                "https://rpc-amoy.polygon.technology",
                1.3,
                1_000,
                true,
            ),
        );

        Self {
            global: GlobalConfig::default(),
            relay: RelayConfig::default(),
            chains,
            metrics: MetricsConfig::default(),
        }
    }
}
