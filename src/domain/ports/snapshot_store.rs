use async_trait::async_trait;

use crate::domain::errors::SnapshotError;

/// Port for persisting encoded runtime snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot with `bytes`.
    async fn save(&self, bytes: &[u8]) -> Result<(), SnapshotError>;

    /// Load the stored snapshot, `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Vec<u8>>, SnapshotError>;
}
