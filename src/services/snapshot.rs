//! Versioned runtime snapshots and the periodic snapshot daemon.
//!
//! A snapshot is a JSON document carrying `schema_version`, every agent
//! (reservations are dropped on restore), the cache items and the learned
//! pattern centers. Callers treat the encoded bytes as opaque.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::domain::errors::SnapshotError;
use crate::domain::models::Agent;
use crate::domain::ports::SnapshotStore;
use crate::services::cache_manager::CacheSnapshot;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub schema_version: u32,
    pub taken_at: DateTime<Utc>,
    pub next_agent_id: u64,
    pub agents: Vec<Agent>,
    pub cache: CacheSnapshot,
}

#[derive(Deserialize)]
struct SchemaProbe {
    schema_version: u32,
}

impl RuntimeSnapshot {
    pub fn new(next_agent_id: u64, agents: Vec<Agent>, cache: CacheSnapshot) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            taken_at: Utc::now(),
            next_agent_id,
            agents,
            cache,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(|e| SnapshotError::Encode(e.to_string()))
    }

    /// Decode a snapshot, checking the schema version before anything else.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let probe: SchemaProbe =
            serde_json::from_slice(bytes).map_err(|e| SnapshotError::Decode(e.to_string()))?;
        if probe.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(SnapshotError::UnsupportedSchema {
                found: probe.schema_version,
                expected: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| SnapshotError::Decode(e.to_string()))
    }
}

/// Produces encoded snapshots for the daemon.
pub type SnapshotSource = Arc<dyn Fn() -> Result<Vec<u8>, SnapshotError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SnapshotDaemonConfig {
    pub interval: Duration,
}

impl Default for SnapshotDaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDaemonStatus {
    pub running: bool,
    pub snapshots_written: u64,
    pub failures: u64,
    pub last_bytes: usize,
    pub last_error: Option<String>,
}

/// Handle to control the snapshot daemon.
#[derive(Clone)]
pub struct SnapshotDaemonHandle {
    stop_flag: Arc<AtomicBool>,
    status: Arc<RwLock<SnapshotDaemonStatus>>,
}

impl SnapshotDaemonHandle {
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn status(&self) -> SnapshotDaemonStatus {
        self.status.read().clone()
    }
}

/// Background daemon that periodically writes snapshots to a store.
pub struct SnapshotDaemon {
    source: SnapshotSource,
    store: Arc<dyn SnapshotStore>,
    config: SnapshotDaemonConfig,
    stop_flag: Arc<AtomicBool>,
    status: Arc<RwLock<SnapshotDaemonStatus>>,
}

impl SnapshotDaemon {
    pub fn new(
        source: SnapshotSource,
        store: Arc<dyn SnapshotStore>,
        config: SnapshotDaemonConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(SnapshotDaemonStatus::default())),
        }
    }

    pub fn handle(&self) -> SnapshotDaemonHandle {
        SnapshotDaemonHandle {
            stop_flag: Arc::clone(&self.stop_flag),
            status: Arc::clone(&self.status),
        }
    }

    /// Take and store one snapshot.
    pub async fn run_once(&self) -> Result<usize, SnapshotError> {
        let bytes = (self.source)()?;
        self.store.save(&bytes).await?;
        Ok(bytes.len())
    }

    /// Run until stopped, writing one snapshot per interval.
    pub async fn run(self) {
        self.status.write().running = true;
        info!(interval_secs = self.config.interval.as_secs(), "snapshot daemon started");

        let mut timer = interval(self.config.interval.max(Duration::from_millis(1)));
        timer.tick().await;

        while !self.stop_flag.load(Ordering::Acquire) {
            timer.tick().await;
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            match self.run_once().await {
                Ok(bytes) => {
                    let mut status = self.status.write();
                    status.snapshots_written += 1;
                    status.last_bytes = bytes;
                    status.last_error = None;
                    debug!(bytes, "snapshot written");
                }
                Err(e) => {
                    warn!(error = %e, "snapshot failed");
                    let mut status = self.status.write();
                    status.failures += 1;
                    status.last_error = Some(e.to_string());
                }
            }
        }

        self.status.write().running = false;
        info!("snapshot daemon stopped");
    }
}
