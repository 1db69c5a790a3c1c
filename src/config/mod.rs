use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

use tidings_engine::EngineConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplaySettings {
    /// Speed used when `--speed` is not given (default: 1.0)
    #[serde(default = "default_speed")]
    pub default_speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            default_speed: default_speed(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Log filter used when RUST_LOG is not set (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub replay: ReplaySettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // Environment overrides, e.g. TIDINGS_ENGINE__STREAM_CAPACITY=500
            .add_source(
                Environment::with_prefix("TIDINGS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings
            .engine
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        if !settings.replay.default_speed.is_finite() || settings.replay.default_speed <= 0.0 {
            return Err(ConfigError::Message(format!(
                "replay.default_speed must be positive, got {}",
                settings.replay.default_speed
            )));
        }
        Ok(settings)
    }
}
