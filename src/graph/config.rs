//! Graph execution configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult, Status};
use crate::graph::types::MemoryManagerAffinity;

/// Environment variable overriding [`GraphConfig::use_memory_manager`]
pub const ENV_USE_MEMORY_MANAGER: &str = "GRAPHFORGE_USE_MEMORY_MANAGER";
/// Environment variable overriding [`GraphConfig::memory_affinity`]
pub const ENV_MEMORY_AFFINITY: &str = "GRAPHFORGE_MEMORY_AFFINITY";
/// Environment variable overriding [`GraphConfig::num_memory_pools`]
pub const ENV_NUM_MEMORY_POOLS: &str = "GRAPHFORGE_NUM_MEMORY_POOLS";
/// Environment variable overriding [`GraphConfig::tensor_alignment`]
pub const ENV_TENSOR_ALIGNMENT: &str = "GRAPHFORGE_TENSOR_ALIGNMENT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Share backing memory between tensors with disjoint lifetimes
    pub use_memory_manager: bool,
    pub memory_affinity: MemoryManagerAffinity,
    /// Buffer sets allocated per memory manager
    pub num_memory_pools: usize,
    /// Byte alignment of every backing buffer and pool region
    pub tensor_alignment: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            use_memory_manager: true,
            memory_affinity: MemoryManagerAffinity::Buffer,
            num_memory_pools: 1,
            tensor_alignment: 64,
        }
    }
}

impl GraphConfig {
    pub fn with_memory_manager(mut self, enabled: bool) -> Self {
        self.use_memory_manager = enabled;
        self
    }

    pub fn with_memory_affinity(mut self, affinity: MemoryManagerAffinity) -> Self {
        self.memory_affinity = affinity;
        self
    }

    pub fn with_num_memory_pools(mut self, num_pools: usize) -> Self {
        self.num_memory_pools = num_pools;
        self
    }

    pub fn with_tensor_alignment(mut self, alignment: usize) -> Self {
        self.tensor_alignment = alignment;
        self
    }

    pub fn validate(&self) -> Status {
        if self.num_memory_pools == 0 {
            return Err(GraphError::InvalidConfiguration(
                "num_memory_pools must be at least 1".to_string(),
            ));
        }
        if !self.tensor_alignment.is_power_of_two() || self.tensor_alignment < 4 {
            return Err(GraphError::InvalidConfiguration(format!(
                "tensor_alignment must be a power of two >= 4, got {}",
                self.tensor_alignment
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> GraphResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GraphError::InvalidConfiguration(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> GraphResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        tracing::debug!("Loading graph config from {}", path.display());
        Self::from_json_str(&json)
    }

    /// Defaults overridden by `GRAPHFORGE_*` environment variables
    pub fn from_env() -> GraphResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(ENV_USE_MEMORY_MANAGER) {
            config.use_memory_manager = parse_bool(ENV_USE_MEMORY_MANAGER, &value)?;
        }
        if let Ok(value) = std::env::var(ENV_MEMORY_AFFINITY) {
            config.memory_affinity = value.parse()?;
        }
        if let Ok(value) = std::env::var(ENV_NUM_MEMORY_POOLS) {
            config.num_memory_pools = parse_usize(ENV_NUM_MEMORY_POOLS, &value)?;
        }
        if let Ok(value) = std::env::var(ENV_TENSOR_ALIGNMENT) {
            config.tensor_alignment = parse_usize(ENV_TENSOR_ALIGNMENT, &value)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(name: &str, value: &str) -> GraphResult<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GraphError::InvalidConfiguration(format!(
            "{}: expected a boolean, got '{}'",
            name, value
        ))),
    }
}

fn parse_usize(name: &str, value: &str) -> GraphResult<usize> {
    value.trim().parse().map_err(|_| {
        GraphError::InvalidConfiguration(format!("{}: expected an integer, got '{}'", name, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            ENV_USE_MEMORY_MANAGER,
            ENV_MEMORY_AFFINITY,
            ENV_NUM_MEMORY_POOLS,
            ENV_TENSOR_ALIGNMENT,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = GraphConfig::default();
        assert!(config.use_memory_manager);
        assert_eq!(config.memory_affinity, MemoryManagerAffinity::Buffer);
        assert_eq!(config.num_memory_pools, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = GraphConfig::default()
            .with_memory_manager(false)
            .with_memory_affinity(MemoryManagerAffinity::Offset)
            .with_num_memory_pools(2)
            .with_tensor_alignment(128);
        assert!(!config.use_memory_manager);
        assert_eq!(config.num_memory_pools, 2);
        assert_eq!(config.tensor_alignment, 128);
    }

    #[test]
    fn test_validate_rejects_bad_alignment() {
        assert!(GraphConfig::default().with_tensor_alignment(48).validate().is_err());
        assert!(GraphConfig::default().with_tensor_alignment(2).validate().is_err());
        assert!(GraphConfig::default().with_num_memory_pools(0).validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = GraphConfig::from_json_str(r#"{"memory_affinity": "offset"}"#).unwrap();
        assert_eq!(config.memory_affinity, MemoryManagerAffinity::Offset);
        assert!(config.use_memory_manager);
        assert_eq!(config.tensor_alignment, 64);
    }

    #[test]
    fn test_invalid_json() {
        let err = GraphConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, GraphError::InvalidConfiguration(_)));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var(ENV_USE_MEMORY_MANAGER, "false");
        std::env::set_var(ENV_MEMORY_AFFINITY, "offset");
        std::env::set_var(ENV_NUM_MEMORY_POOLS, "3");
        let config = GraphConfig::from_env().unwrap();
        clear_env();

        assert!(!config.use_memory_manager);
        assert_eq!(config.memory_affinity, MemoryManagerAffinity::Offset);
        assert_eq!(config.num_memory_pools, 3);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        std::env::set_var(ENV_TENSOR_ALIGNMENT, "lots");
        let result = GraphConfig::from_env();
        clear_env();
        assert!(result.is_err());
    }
}
