//! Durable storage for detections and track versions.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgTrackStore;

use crate::error::StoreError;
use crate::records::{TrackPath, TrackRecord, WriteBatch};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Rows actually inserted by a write; repeats of already stored keys are skipped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub detections: u64,
    pub track_versions: u64,
}

/// Rows removed by a retention purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub detections: u64,
    pub track_versions: u64,
}

/// Storage backend for the persistence writer.
///
/// `write_batch` must be atomic and idempotent: detections are keyed by
/// `(camera_id, message_id, detection_index)` and track versions by
/// `(camera_id, track_id, version)`, and rows whose key already exists are
/// left untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackStore: Send + Sync + 'static {
    async fn write_batch(&self, batch: &WriteBatch) -> Result<WriteSummary, StoreError>;

    /// Highest track id ever stored for a camera
    async fn max_track_id(&self, camera_id: &str) -> Result<Option<u64>, StoreError>;

    /// Message ids stored for a camera within `window` of its newest one,
    /// with the stream time each was applied at, oldest first
    async fn recent_message_ids(
        &self,
        camera_id: &str,
        window: Duration,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError>;

    /// Track versions of a camera updated in `[from, to)`, oldest first
    async fn track_history(
        &self,
        camera_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TrackRecord>, StoreError>;

    /// Observed positions of one track within `[from, to]`, oldest first;
    /// `None` if it has no detections there
    async fn track_path(
        &self,
        camera_id: &str,
        track_id: u64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Option<TrackPath>, StoreError>;

    /// Delete rows older than `cutoff`. Live tracks are never affected.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeSummary, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;
}
