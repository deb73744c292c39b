//! Infrastructure layer module
//!
//! Adapters behind the domain ports plus process-level concerns:
//! - Configuration management
//! - Logging infrastructure
//! - File-backed snapshot store
//! - Built-in task executors
//!
//! Infrastructure implementations satisfy the port traits defined in the domain layer.

pub mod config;
pub mod executors;
pub mod logging;
pub mod snapshot;
