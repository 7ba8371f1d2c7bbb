//! Per-camera lanes.
//!
//! Every camera gets one task that owns its [`Correlator`] and processes that
//! camera's batches strictly in order. Lanes of different cameras run in
//! parallel. A lane answers each batch with the [`HandlerOutcome`] the
//! consumer should apply once persistence has finished.

use crate::config::{LaneConfig, PersistenceConfig, TrackerConfig};
use crate::correlator::{Correlation, Correlator, IngestOutcome};
use crate::error::{FatalInternalError, PersistenceFailure, PipelineError};
use crate::event::DetectionBatch;
use crate::hub::BroadcastHub;
use crate::records::{TrackUpdate, WriteBatch};
use crate::writer::TrackWriter;
use camtrack_pipeline::HandlerOutcome;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Work sent to a lane
pub enum LaneJob {
    Batch {
        batch: DetectionBatch,
        reply: oneshot::Sender<HandlerOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TrackUpdate>>,
    },
}

/// Shared dependencies of all lanes
pub struct LaneContext {
    pub writer: Arc<TrackWriter>,
    pub hub: Arc<BroadcastHub>,
    pub tracker: TrackerConfig,
    pub lanes: LaneConfig,
    pub persistence: PersistenceConfig,
}

/// Routes batches to the lane of their camera, spawning lanes on demand
pub struct LaneRouter {
    ctx: Arc<LaneContext>,
    lanes: Mutex<HashMap<String, mpsc::Sender<LaneJob>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LaneRouter {
    pub fn new(ctx: LaneContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            lanes: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn sender(&self, camera_id: &str) -> mpsc::Sender<LaneJob> {
        let mut lanes = self.lanes.lock();
        if let Some(sender) = lanes.get(camera_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.ctx.lanes.queue_depth.max(1));
        let lane = Lane::new(camera_id.to_string(), self.ctx.clone());
        self.handles.lock().push(tokio::spawn(lane.run(rx)));
        lanes.insert(camera_id.to_string(), tx.clone());

        metrics::gauge!("tracker.lanes.active").set(lanes.len() as f64);
        info!(camera_id = %camera_id, "Started camera lane");

        tx
    }

    /// Queue a batch on its camera's lane, waiting while the lane queue is
    /// full. The receiver resolves once the batch is fully processed.
    pub async fn submit(&self, batch: DetectionBatch) -> oneshot::Receiver<HandlerOutcome> {
        let (reply, outcome) = oneshot::channel();
        let camera_id = batch.camera_id.clone();
        let sender = self.sender(&camera_id);

        if let Err(mpsc::error::SendError(job)) = sender.send(LaneJob::Batch { batch, reply }).await
        {
            self.lanes.lock().remove(&camera_id);
            if let LaneJob::Batch { reply, .. } = job {
                let _ = reply.send(retry(PipelineError::LaneUnavailable(camera_id)));
            }
        }

        outcome
    }

    /// Live tracks of a camera; empty if the camera has no lane yet
    pub async fn snapshot(&self, camera_id: &str) -> Result<Vec<TrackUpdate>, PipelineError> {
        let sender = match self.lanes.lock().get(camera_id) {
            Some(sender) => sender.clone(),
            None => return Ok(Vec::new()),
        };

        let (reply, snapshot) = oneshot::channel();
        sender
            .send(LaneJob::Snapshot { reply })
            .await
            .map_err(|_| PipelineError::LaneUnavailable(camera_id.to_string()))?;
        snapshot
            .await
            .map_err(|_| PipelineError::LaneUnavailable(camera_id.to_string()))
    }

    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Close all lanes and wait for them to flush what they can
    pub async fn shutdown(&self) {
        self.lanes.lock().clear();
        let handles = std::mem::take(&mut *self.handles.lock());
        info!(lanes = handles.len(), "Stopping camera lanes");
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn retry(reason: impl Display) -> HandlerOutcome {
    HandlerOutcome::Retry {
        reason: reason.to_string(),
    }
}

struct Lane {
    camera_id: String,
    ctx: Arc<LaneContext>,
    /// Created on the first batch, once the id counter is seeded from the store
    correlator: Option<Correlator>,
    /// Correlated but not yet persisted, oldest first
    backlog: VecDeque<WriteBatch>,
    poisoned: bool,
    /// Newest message time and when it arrived, for extrapolating stream time
    anchor: Option<(DateTime<Utc>, Instant)>,
}

impl Lane {
    fn new(camera_id: String, ctx: Arc<LaneContext>) -> Self {
        Self {
            camera_id,
            ctx,
            correlator: None,
            backlog: VecDeque::new(),
            poisoned: false,
            anchor: None,
        }
    }

    async fn run(mut self, mut jobs: mpsc::Receiver<LaneJob>) {
        let mut tick = tokio::time::interval(self.ctx.lanes.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                job = jobs.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        if !self.backlog.is_empty() {
            if let Err(e) = self.flush().await {
                warn!(
                    camera_id = %self.camera_id,
                    pending = self.backlog.len(),
                    error = %e,
                    "Lane closed with unflushed batches"
                );
            }
        }
        info!(camera_id = %self.camera_id, "Camera lane stopped");
    }

    async fn handle(&mut self, job: LaneJob) {
        match job {
            LaneJob::Batch { batch, reply } => {
                let outcome = self.process(batch).await;
                let _ = reply.send(outcome);
            }
            LaneJob::Snapshot { reply } => {
                let snapshot = self
                    .correlator
                    .as_ref()
                    .map(Correlator::snapshot)
                    .unwrap_or_default();
                let _ = reply.send(snapshot);
            }
        }
    }

    #[instrument(skip(self, batch), fields(camera_id = %self.camera_id, message_id = %batch.message_id))]
    async fn process(&mut self, batch: DetectionBatch) -> HandlerOutcome {
        if self.poisoned {
            metrics::counter!("tracker.messages.rejected").increment(1);
            return retry(format!("lane for camera {} is poisoned", self.camera_id));
        }

        let correlator = match self.ensure_seeded().await {
            Ok(correlator) => correlator,
            Err(e) => {
                warn!(error = %e, "Could not seed track ids");
                return retry(e);
            }
        };

        if correlator.is_duplicate(&batch.message_id) {
            return self.on_duplicate(&batch.message_id).await;
        }

        let max_backlog = self.ctx.persistence.max_backlog.max(1);
        if self.backlog.len() >= max_backlog {
            if let Err(e) = self.flush().await {
                if self.backlog.len() >= max_backlog {
                    metrics::counter!("tracker.messages.rejected").increment(1);
                    warn!(backlog = self.backlog.len(), error = %e, "Backlog full, refusing batch");
                    return retry(e);
                }
            }
        }

        let ingested = match self.correlator.as_mut() {
            Some(correlator) => correlator.ingest(&batch),
            None => Err(FatalInternalError("correlator missing after seeding".to_string())),
        };

        match ingested {
            Err(fatal) => {
                self.poison(&fatal);
                retry(fatal)
            }
            Ok(IngestOutcome::Duplicate) => self.on_duplicate(&batch.message_id).await,
            Ok(IngestOutcome::Stale { newest }) => {
                metrics::counter!("tracker.messages.stale").increment(1);
                warn!(
                    timestamp = %batch.timestamp,
                    newest = %newest,
                    "Dropping batch older than the dedup window"
                );
                HandlerOutcome::Ack
            }
            Ok(IngestOutcome::Applied(correlation)) => {
                metrics::counter!("tracker.messages.applied").increment(1);
                self.advance_anchor(batch.timestamp);
                self.dispatch(correlation);

                match self.flush().await {
                    Ok(()) => HandlerOutcome::Ack,
                    Err(e) => {
                        warn!(backlog = self.backlog.len(), error = %e, "Persisting batch failed");
                        retry(e)
                    }
                }
            }
        }
    }

    async fn ensure_seeded(&mut self) -> Result<&mut Correlator, PipelineError> {
        let correlator = match self.correlator.take() {
            Some(correlator) => correlator,
            None => {
                let highest = self
                    .ctx
                    .writer
                    .store()
                    .max_track_id(&self.camera_id)
                    .await
                    .map_err(|source| PersistenceFailure {
                        attempts: 1,
                        source,
                    })?;
                let first = highest.map_or(1, |id| id + 1);

                // Stored but possibly uncommitted messages come back as redeliveries
                let applied = self
                    .ctx
                    .writer
                    .store()
                    .recent_message_ids(&self.camera_id, self.ctx.tracker.dedup_window())
                    .await
                    .map_err(|source| PersistenceFailure {
                        attempts: 1,
                        source,
                    })?;

                let mut correlator =
                    Correlator::new(self.camera_id.clone(), self.ctx.tracker.clone(), first);
                for (message_id, applied_at) in &applied {
                    correlator.remember(message_id, *applied_at);
                }
                info!(
                    camera_id = %self.camera_id,
                    first_track_id = first,
                    applied_messages = applied.len(),
                    "Seeded lane from store"
                );
                correlator
            }
        };
        Ok(self.correlator.insert(correlator))
    }

    /// A repeated message is acknowledged once its own batch is stored
    async fn on_duplicate(&mut self, message_id: &str) -> HandlerOutcome {
        metrics::counter!("tracker.messages.duplicate").increment(1);

        let pending = self
            .backlog
            .iter()
            .any(|batch| batch.message_id.as_deref() == Some(message_id));
        if !pending {
            debug!("Duplicate message, already persisted");
            return HandlerOutcome::Ack;
        }

        match self.flush().await {
            Ok(()) => HandlerOutcome::Ack,
            Err(e) => retry(e),
        }
    }

    fn dispatch(&mut self, correlation: Correlation) {
        for update in correlation.updates {
            self.ctx.hub.publish(update);
        }
        if !correlation.write.is_empty() {
            self.backlog.push_back(correlation.write);
        }
    }

    /// Write pending batches in order, stopping at the first failure
    async fn flush(&mut self) -> Result<(), PersistenceFailure> {
        let started = Instant::now();
        let result = loop {
            let Some(front) = self.backlog.front() else {
                break Ok(());
            };
            if let Err(e) = self.ctx.writer.write(front).await {
                break Err(e);
            }
            self.backlog.pop_front();
        };

        metrics::gauge!("tracker.lane.backlog", "camera_id" => self.camera_id.clone())
            .set(self.backlog.len() as f64);
        self.exclude_from_clock(started.elapsed());
        result
    }

    fn advance_anchor(&mut self, timestamp: DateTime<Utc>) {
        let newer = self.anchor.map_or(true, |(newest, _)| timestamp >= newest);
        if newer {
            self.anchor = Some((timestamp, Instant::now()));
        }
    }

    /// Time spent waiting on storage does not advance extrapolated stream time
    fn exclude_from_clock(&mut self, spent: std::time::Duration) {
        if let Some((newest, at)) = self.anchor {
            self.anchor = Some((newest, (at + spent).min(Instant::now())));
        }
    }

    async fn on_tick(&mut self) {
        if self.poisoned {
            return;
        }

        if let (Some((newest, at)), Some(correlator)) = (self.anchor, self.correlator.as_mut()) {
            let elapsed = chrono::Duration::from_std(at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
            match correlator.tick(newest + elapsed) {
                Ok(correlation) if !correlation.is_empty() => self.dispatch(correlation),
                Ok(_) => {}
                Err(fatal) => {
                    self.poison(&fatal);
                    return;
                }
            }
        }

        if !self.backlog.is_empty() {
            if let Err(e) = self.flush().await {
                debug!(
                    camera_id = %self.camera_id,
                    pending = self.backlog.len(),
                    error = %e,
                    "Backlog still unflushed"
                );
            }
        }
    }

    fn poison(&mut self, fatal: &FatalInternalError) {
        self.poisoned = true;
        metrics::counter!("tracker.lane.fatal").increment(1);
        error!(
            camera_id = %self.camera_id,
            error = %fatal,
            "Lane poisoned, rejecting all further batches"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BoundingBox, DetectionEvent};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn router(store: Arc<MemoryStore>, persistence: PersistenceConfig) -> LaneRouter {
        let writer = Arc::new(TrackWriter::new(store, persistence.clone()));
        LaneRouter::new(LaneContext {
            writer,
            hub: Arc::new(BroadcastHub::new(16)),
            tracker: TrackerConfig::default(),
            lanes: LaneConfig::default(),
            persistence,
        })
    }

    fn fast_persistence() -> PersistenceConfig {
        PersistenceConfig {
            max_attempts: 1,
            retry_base_ms: 1,
            retry_max_ms: 1,
            max_backlog: 2,
            ..Default::default()
        }
    }

    fn batch(camera_id: &str, id: &str, secs: i64) -> DetectionBatch {
        let timestamp = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        DetectionBatch {
            camera_id: camera_id.to_string(),
            message_id: id.to_string(),
            timestamp,
            frame_id: None,
            detections: vec![DetectionEvent {
                camera_id: camera_id.to_string(),
                timestamp,
                bbox: BoundingBox::new(10.0, 10.0, 10.0, 10.0),
                class_name: "person".to_string(),
                confidence: 0.9,
                embedding: None,
                message_id: id.to_string(),
                detection_index: 0,
                frame_id: None,
            }],
        }
    }

    async fn outcome(router: &LaneRouter, batch: DetectionBatch) -> HandlerOutcome {
        router.submit(batch).await.await.unwrap()
    }

    #[tokio::test]
    async fn test_batches_are_persisted_before_ack() {
        let store = Arc::new(MemoryStore::new());
        let router = router(store.clone(), fast_persistence());

        assert_eq!(outcome(&router, batch("cam1", "m0", 0)).await, HandlerOutcome::Ack);
        assert_eq!(store.detection_count(), 1);
        assert_eq!(store.track_version_count(), 1);
        assert_eq!(router.active_lanes(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_through_redelivery() {
        let store = Arc::new(MemoryStore::new());
        let router = router(store.clone(), fast_persistence());

        store.fail_next_writes(1);
        assert!(matches!(
            outcome(&router, batch("cam1", "m0", 0)).await,
            HandlerOutcome::Retry { .. }
        ));
        assert_eq!(store.detection_count(), 0);

        // Redelivery is a duplicate whose batch is still pending
        assert_eq!(outcome(&router, batch("cam1", "m0", 0)).await, HandlerOutcome::Ack);
        assert_eq!(store.detection_count(), 1);
        assert_eq!(store.track_version_count(), 1);
    }

    #[tokio::test]
    async fn test_full_backlog_refuses_new_batches() {
        let store = Arc::new(MemoryStore::new());
        let router = router(store.clone(), fast_persistence());

        store.set_available(true);
        outcome(&router, batch("cam1", "m0", 0)).await;
        store.set_available(false);

        for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
            let result = outcome(&router, batch("cam1", id, 1 + i as i64)).await;
            assert!(matches!(result, HandlerOutcome::Retry { .. }));
        }
        // m3 was refused before correlation, so it is not a duplicate later
        store.set_available(true);
        assert_eq!(outcome(&router, batch("cam1", "m3", 3)).await, HandlerOutcome::Ack);
        assert_eq!(store.detection_count(), 4);
    }

    #[tokio::test]
    async fn test_track_ids_continue_after_restart() {
        let store = Arc::new(MemoryStore::new());

        let first = router(store.clone(), fast_persistence());
        outcome(&first, batch("cam1", "m0", 0)).await;
        first.shutdown().await;

        let second = router(store.clone(), fast_persistence());
        let mut far = batch("cam1", "m1", 1);
        far.detections[0].bbox = BoundingBox::new(800.0, 800.0, 10.0, 10.0);
        outcome(&second, far).await;

        assert_eq!(store.detection("cam1", "m0", 0).map(|d| d.track_id), Some(1));
        assert_eq!(store.detection("cam1", "m1", 0).map(|d| d.track_id), Some(2));
    }

    #[tokio::test]
    async fn test_stored_message_is_duplicate_after_restart() {
        let store = Arc::new(MemoryStore::new());

        let first = router(store.clone(), fast_persistence());
        assert_eq!(outcome(&first, batch("cam1", "m0", 0)).await, HandlerOutcome::Ack);
        first.shutdown().await;
        let versions = store.track_version_count();

        // Stored before the crash, never committed, so it is delivered again
        let second = router(store.clone(), fast_persistence());
        assert_eq!(outcome(&second, batch("cam1", "m0", 0)).await, HandlerOutcome::Ack);

        assert_eq!(store.track_version_count(), versions);
        assert_eq!(store.detection_count(), 1);
        assert!(store.versions_of("cam1", 2).is_empty());
        assert!(second.snapshot("cam1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_message_id_on_two_cameras_keeps_both() {
        let store = Arc::new(MemoryStore::new());
        let router = router(store.clone(), fast_persistence());

        assert_eq!(outcome(&router, batch("cam1", "frame-1", 0)).await, HandlerOutcome::Ack);
        assert_eq!(outcome(&router, batch("cam2", "frame-1", 0)).await, HandlerOutcome::Ack);

        assert_eq!(store.detection_count(), 2);
        assert!(store.detection("cam1", "frame-1", 0).is_some());
        assert!(store.detection("cam2", "frame-1", 0).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_camera_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let router = router(store, fast_persistence());

        assert!(router.snapshot("cam9").await.unwrap().is_empty());

        outcome(&router, batch("cam1", "m0", 0)).await;
        let snapshot = router.snapshot("cam1").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].version, 1);
    }
}
