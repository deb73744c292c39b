//! Configuration loading
//!
//! Layered with figment: serialized defaults, `.cohort/config.yaml`,
//! `.cohort/local.yaml`, then `COHORT_*` environment variables. Every loaded
//! config is validated before use.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
