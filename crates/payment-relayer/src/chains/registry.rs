// Static table of supported chains, built once from configuration
use std::collections::HashMap;

use crate::config::{ChainConfig, ConfigError, RelayerConfig};

#[derive(Debug, Clone)]
pub struct RegisteredChain {
    /// Human key such as `base-sepolia`
    pub key: String,
    pub config: ChainConfig,
}

impl RegisteredChain {
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

/// Immutable after construction
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: Vec<RegisteredChain>,
    by_id: HashMap<u64, usize>,
    by_key: HashMap<String, usize>,
}

impl ChainRegistry {
    /// Build the registry from a validated configuration
    pub fn from_config(config: &RelayerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut registry = Self::default();
        for (key, chain) in &config.chains {
            let index = registry.chains.len();
            registry.by_id.insert(chain.chain_id, index);
            registry.by_key.insert(key.clone(), index);
            registry.chains.push(RegisteredChain {
                key: key.clone(),
                config: chain.clone(),
            });
        }
        Ok(registry)
    }

    pub fn by_id(&self, chain_id: u64) -> Option<&RegisteredChain> {
        self.by_id.get(&chain_id).map(|&i| &self.chains[i])
    }

    pub fn by_key(&self, key: &str) -> Option<&RegisteredChain> {
        self.by_key.get(key).map(|&i| &self.chains[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredChain> {
        self.chains.iter()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id_and_key() {
        let registry = ChainRegistry::from_config(&RelayerConfig::default()).unwrap();
        assert_eq!(registry.len(), 5);

        let base = registry.by_id(84532).unwrap();
        assert_eq!(base.key, "base-sepolia");
        assert_eq!(registry.by_key("sepolia").unwrap().chain_id(), 11155111);
        assert!(registry.by_id(1).is_none());
        assert!(registry.by_key("mainnet").is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RelayerConfig::default();
        config.chains.clear();
        assert!(ChainRegistry::from_config(&config).is_err());
    }
}
