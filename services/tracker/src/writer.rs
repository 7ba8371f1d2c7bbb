use crate::config::PersistenceConfig;
use crate::error::{PersistenceFailure, StoreError};
use crate::records::WriteBatch;
use crate::store::{TrackStore, WriteSummary};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Persistence writer: stores write batches, retrying transient failures
/// with exponential backoff
pub struct TrackWriter {
    store: Arc<dyn TrackStore>,
    config: PersistenceConfig,
}

impl TrackWriter {
    pub fn new(store: Arc<dyn TrackStore>, config: PersistenceConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn TrackStore> {
        &self.store
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_base())
            .with_max_interval(self.config.retry_max())
            .with_max_elapsed_time(None)
            .build()
    }

    /// Store one batch. Gives up after `max_attempts` transient failures or
    /// on the first permanent one.
    #[instrument(skip(self, batch), fields(camera_id = %batch.camera_id, message_id = ?batch.message_id))]
    pub async fn write(&self, batch: &WriteBatch) -> Result<WriteSummary, PersistenceFailure> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.backoff();
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.store.write_batch(batch).await {
                Ok(summary) => {
                    metrics::histogram!("tracker.persist.duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    metrics::counter!("tracker.persist.detections")
                        .increment(summary.detections);
                    metrics::counter!("tracker.persist.track_versions")
                        .increment(summary.track_versions);
                    debug!(
                        attempt = attempt,
                        detections = summary.detections,
                        track_versions = summary.track_versions,
                        "Batch persisted"
                    );
                    return Ok(summary);
                }
                Err(error @ StoreError::Permanent(_)) => {
                    metrics::counter!("tracker.persist.failures").increment(1);
                    return Err(PersistenceFailure {
                        attempts: attempt,
                        source: error,
                    });
                }
                Err(error) if attempt >= max_attempts => {
                    metrics::counter!("tracker.persist.failures").increment(1);
                    return Err(PersistenceFailure {
                        attempts: attempt,
                        source: error,
                    });
                }
                Err(error) => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.retry_max());
                    metrics::counter!("tracker.persist.retries").increment(1);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Persisting batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
