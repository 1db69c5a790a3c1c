use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::store::{DEFAULT_QUERY_LIMIT, DEFAULT_STORE_CAPACITY, MAX_QUERY_LIMIT};
use crate::stream::DEFAULT_STREAM_CAPACITY;

/// Engine tuning knobs, deserialized from the `engine` settings section
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Events kept by the in-memory store before the oldest are evicted
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,
    /// Buffer size of each live event stream
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
    /// Limit used by queries built through the engine
    #[serde(default = "default_query_limit")]
    pub default_query_limit: usize,
}

fn default_store_capacity() -> usize {
    DEFAULT_STORE_CAPACITY
}

fn default_stream_capacity() -> usize {
    DEFAULT_STREAM_CAPACITY
}

fn default_query_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_capacity: default_store_capacity(),
            stream_capacity: default_stream_capacity(),
            default_query_limit: default_query_limit(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.store_capacity == 0 {
            return Err(EngineError::InvalidConfiguration(
                "store_capacity must be positive".to_string(),
            ));
        }
        if self.stream_capacity == 0 {
            return Err(EngineError::InvalidConfiguration(
                "stream_capacity must be positive".to_string(),
            ));
        }
        if self.default_query_limit == 0 || self.default_query_limit > MAX_QUERY_LIMIT {
            return Err(EngineError::InvalidConfiguration(format!(
                "default_query_limit must be between 1 and {}",
                MAX_QUERY_LIMIT
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"stream_capacity": 8})).unwrap();

        assert_eq!(config.stream_capacity, 8);
        assert_eq!(config.store_capacity, 10_000);
        assert_eq!(config.default_query_limit, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let config = EngineConfig {
            default_query_limit: MAX_QUERY_LIMIT + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            stream_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
