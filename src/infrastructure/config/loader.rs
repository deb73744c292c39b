use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("cache.level_capacities must list at least one level")]
    NoCacheLevels,

    #[error("Invalid cache.clusters: {0}. Must be at least 1")]
    InvalidClusters(usize),

    #[error("Invalid {name}: {value}. Must be between 0 and 1")]
    InvalidFraction { name: &'static str, value: f64 },

    #[error("Invalid {name}: {value}. Must be between 0 and 100")]
    InvalidRate { name: &'static str, value: f64 },

    #[error("Invalid learning.threshold: {0}. Must be between 0 and 101")]
    InvalidThreshold(f64),

    #[error("Invalid {0} weights: must be non-negative and not all zero")]
    InvalidWeights(&'static str),

    #[error("Invalid {0}: must be at least 1")]
    ZeroCapacity(&'static str),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error(
        "Invalid retry bounds: retry_after_base_ms ({0}) must not exceed retry_after_max_ms ({1})"
    )]
    InvalidRetryBounds(u64, u64),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .cohort/config.yaml (project config)
    /// 3. .cohort/local.yaml (project local overrides, optional)
    /// 4. Environment variables (COHORT_* prefix, `__` separates nested keys)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".cohort/config.yaml"))
            .merge(Yaml::file(".cohort/local.yaml"))
            .merge(Env::prefixed("COHORT_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honoring `COHORT_*`
    /// environment overrides.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("COHORT_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let scheduler = &config.scheduler;
        check_weights("scheduler.weights", &scheduler.weights.as_array())?;
        check_fraction("scheduler.predictor.alpha", scheduler.predictor.alpha)?;
        check_fraction("scheduler.predictor.beta", scheduler.predictor.beta)?;
        check_fraction("scheduler.feedback_rate", scheduler.feedback_rate)?;
        if scheduler.predictor.window == 0 {
            return Err(ConfigError::ZeroCapacity("scheduler.predictor.window"));
        }
        if scheduler.retry_after_base_ms > scheduler.retry_after_max_ms {
            return Err(ConfigError::InvalidRetryBounds(
                scheduler.retry_after_base_ms,
                scheduler.retry_after_max_ms,
            ));
        }

        let cache = &config.cache;
        if cache.level_capacities.is_empty() {
            return Err(ConfigError::NoCacheLevels);
        }
        if cache.clusters == 0 {
            return Err(ConfigError::InvalidClusters(cache.clusters));
        }
        check_fraction("cache.center_rate", cache.center_rate)?;
        if !(cache.level_span.is_finite() && cache.level_span > 0.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "cache.level_span must be positive, got {}",
                cache.level_span
            )));
        }
        check_weights("cache.eviction", &cache.eviction.as_array())?;
        if cache.key_shards == 0 {
            return Err(ConfigError::ZeroCapacity("cache.key_shards"));
        }
        if cache.feature_window == 0 {
            return Err(ConfigError::ZeroCapacity("cache.feature_window"));
        }

        let learning = &config.learning;
        check_rate("learning.learning_rate", learning.learning_rate)?;
        check_rate("learning.transfer_rate", learning.transfer_rate)?;
        if !(learning.threshold.is_finite() && (0.0..=101.0).contains(&learning.threshold)) {
            return Err(ConfigError::InvalidThreshold(learning.threshold));
        }
        let similarity = &learning.similarity;
        check_weights(
            "learning.similarity",
            &[
                similarity.capability,
                similarity.performance,
                similarity.specialization,
            ],
        )?;
        if learning.max_concurrent_rounds == 0 {
            return Err(ConfigError::ZeroCapacity("learning.max_concurrent_rounds"));
        }

        if config.execution.max_concurrent == 0 {
            return Err(ConfigError::ZeroCapacity("execution.max_concurrent"));
        }
        if config.execution.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("execution.queue_capacity"));
        }
        if config.events.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("events.channel_capacity"));
        }
        if config.snapshot.enabled && config.snapshot.path.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "snapshot.path cannot be empty when snapshots are enabled".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(
                config.logging.rotation.clone(),
            ));
        }

        for seed in &config.agents {
            if seed.agent_type.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "agent seed type cannot be empty".to_string(),
                ));
            }
            if !(seed.max_capacity.is_finite() && seed.max_capacity > 0.0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "agent seed '{}' max_capacity must be positive",
                    seed.agent_type
                )));
            }
        }

        Ok(())
    }
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidFraction { name, value })
    }
}

fn check_rate(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidRate { name, value })
    }
}

fn check_weights(name: &'static str, weights: &[f64]) -> Result<(), ConfigError> {
    let valid = weights.iter().all(|w| w.is_finite() && *w >= 0.0);
    if valid && weights.iter().sum::<f64>() > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidWeights(name))
    }
}
