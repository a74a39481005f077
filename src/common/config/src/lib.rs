//! Configuration management for Rivulet.
//!
//! Provides runtime configuration for the execution scheduler and the
//! storage reader.

use common_error::{RivuletError, RivuletResult};
use serde::{Deserialize, Serialize};

/// Global Rivulet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RivuletConfig {
    /// Execution configuration.
    pub execution: ExecutionConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
}

impl RivuletConfig {
    /// Load a configuration from a JSON document.
    pub fn from_json(data: &str) -> RivuletResult<Self> {
        serde_json::from_str(data).map_err(RivuletError::from)
    }
}

/// Execution scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Number of worker threads. `None` means the CPU count.
    pub parallelism: Option<usize>,
    /// Per-query memory limit in bytes (0 = unlimited).
    pub memory_limit: usize,
    /// Bounded channel depth between a dataset and each child
    /// transformation. Backpressure engages when a channel is full.
    pub queue_size: usize,
    /// Query timeout in milliseconds (0 = no timeout).
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            memory_limit: 0,
            queue_size: 16,
            timeout_ms: 0,
        }
    }
}

/// Storage reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Address of the storage RPC service.
    pub address: String,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8082".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RivuletConfig::default();
        assert_eq!(config.execution.queue_size, 16);
        assert_eq!(config.execution.memory_limit, 0);
        assert_eq!(config.storage.address, "localhost:8082");
    }
}
