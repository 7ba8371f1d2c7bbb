use super::{PurgeSummary, TrackStore, WriteSummary};
use crate::error::StoreError;
use crate::records::{DetectionRecord, PathPoint, TrackPath, TrackRecord, WriteBatch};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Tables {
    /// (camera_id, message_id, detection_index)
    detections: BTreeMap<(String, String, u32), DetectionRecord>,
    /// (camera_id, track_id, version)
    track_versions: BTreeMap<(String, u64, u64), TrackRecord>,
}

/// In-process store with the same idempotency rules as the PostgreSQL one.
///
/// Used for local runs without a database and in tests, where outages can be
/// simulated with [`MemoryStore::fail_next_writes`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing_writes: Mutex<u32>,
    unavailable: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        *self.failing_writes.lock() = count;
    }

    /// Simulate an outage until switched back
    pub fn set_available(&self, available: bool) {
        *self.unavailable.lock() = !available;
    }

    pub fn detection_count(&self) -> usize {
        self.tables.lock().detections.len()
    }

    pub fn track_version_count(&self) -> usize {
        self.tables.lock().track_versions.len()
    }

    /// All stored versions of one track, oldest first
    pub fn versions_of(&self, camera_id: &str, track_id: u64) -> Vec<TrackRecord> {
        self.tables
            .lock()
            .track_versions
            .range((camera_id.to_string(), track_id, 0)..=(camera_id.to_string(), track_id, u64::MAX))
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn detection(&self, camera_id: &str, message_id: &str, index: u32) -> Option<DetectionRecord> {
        self.tables
            .lock()
            .detections
            .get(&(camera_id.to_string(), message_id.to_string(), index))
            .cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if *self.unavailable.lock() {
            return Err(StoreError::transient("memory store offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl TrackStore for MemoryStore {
    async fn write_batch(&self, batch: &WriteBatch) -> Result<WriteSummary, StoreError> {
        self.check_available()?;
        {
            let mut failing = self.failing_writes.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::transient("injected write failure"));
            }
        }

        let mut tables = self.tables.lock();
        let mut summary = WriteSummary::default();

        for record in &batch.detections {
            let key = (
                record.detection.camera_id.clone(),
                record.detection.message_id.clone(),
                record.detection.detection_index,
            );
            if !tables.detections.contains_key(&key) {
                tables.detections.insert(key, record.clone());
                summary.detections += 1;
            }
        }

        for track in &batch.tracks {
            let key = (track.camera_id.clone(), track.track_id, track.version);
            if !tables.track_versions.contains_key(&key) {
                tables.track_versions.insert(key, track.clone());
                summary.track_versions += 1;
            }
        }

        Ok(summary)
    }

    async fn max_track_id(&self, camera_id: &str) -> Result<Option<u64>, StoreError> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .track_versions
            .keys()
            .filter(|(camera, _, _)| camera == camera_id)
            .map(|(_, track_id, _)| *track_id)
            .max())
    }

    async fn recent_message_ids(
        &self,
        camera_id: &str,
        window: Duration,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock();

        let detections = tables
            .detections
            .values()
            .filter(|d| d.detection.camera_id == camera_id)
            .map(|d| (&d.detection.message_id, d.detection.timestamp));
        let versions = tables
            .track_versions
            .values()
            .filter(|r| r.camera_id == camera_id)
            .filter_map(|r| r.message_id.as_ref().map(|id| (id, r.updated_at)));

        let mut first: HashMap<&String, DateTime<Utc>> = HashMap::new();
        for (id, at) in detections.chain(versions) {
            let entry = first.entry(id).or_insert(at);
            *entry = (*entry).min(at);
        }
        let Some(newest) = first.values().max().copied() else {
            return Ok(Vec::new());
        };

        let mut recent: Vec<(String, DateTime<Utc>)> = first
            .into_iter()
            .filter(|(_, at)| *at >= newest - window)
            .map(|(id, at)| (id.clone(), at))
            .collect();
        recent.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(recent)
    }

    async fn track_history(
        &self,
        camera_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TrackRecord>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock();

        let mut records: Vec<TrackRecord> = tables
            .track_versions
            .values()
            .filter(|r| r.camera_id == camera_id && r.updated_at >= from && r.updated_at < to)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then(a.track_id.cmp(&b.track_id))
                .then(a.version.cmp(&b.version))
        });
        records.truncate(limit.max(0) as usize);

        Ok(records)
    }

    async fn track_path(
        &self,
        camera_id: &str,
        track_id: u64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Option<TrackPath>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock();

        // Keys order detections of equal time by message and index
        let mut observed: Vec<&DetectionRecord> = tables
            .detections
            .values()
            .filter(|d| d.detection.camera_id == camera_id && d.track_id == track_id)
            .filter(|d| from.map_or(true, |from| d.detection.timestamp >= from))
            .filter(|d| to.map_or(true, |to| d.detection.timestamp <= to))
            .collect();
        observed.sort_by_key(|d| d.detection.timestamp);

        let Some(first) = observed.first() else {
            return Ok(None);
        };
        let class_name = first.detection.class_name.clone();
        let points = observed
            .iter()
            .map(|d| {
                let (x, y) = d.detection.bbox.center();
                PathPoint {
                    x,
                    y,
                    timestamp: d.detection.timestamp,
                    confidence: d.detection.confidence,
                }
            })
            .collect();

        Ok(TrackPath::from_points(camera_id, track_id, class_name, points))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeSummary, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        let before = tables.detections.len();
        tables.detections.retain(|_, d| d.detection.timestamp >= cutoff);
        let detections = (before - tables.detections.len()) as u64;

        let mut highest: BTreeMap<String, u64> = BTreeMap::new();
        for (camera, track_id, _) in tables.track_versions.keys() {
            let entry = highest.entry(camera.clone()).or_insert(*track_id);
            *entry = (*entry).max(*track_id);
        }

        let before = tables.track_versions.len();
        tables.track_versions.retain(|(camera, track_id, _), record| {
            record.updated_at >= cutoff || highest.get(camera) == Some(track_id)
        });
        let track_versions = (before - tables.track_versions.len()) as u64;

        Ok(PurgeSummary {
            detections,
            track_versions,
        })
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::TrackState;
    use crate::event::{BoundingBox, DetectionEvent};
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn track(track_id: u64, version: u64, secs: i64) -> TrackRecord {
        TrackRecord {
            camera_id: "cam1".to_string(),
            track_id,
            version,
            prev_version: version.checked_sub(1).filter(|v| *v > 0),
            state: TrackState::Tentative,
            class_name: "person".to_string(),
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            confidence: 0.5,
            velocity_x: 0.0,
            velocity_y: 0.0,
            hits: 1,
            first_seen: at(secs),
            last_seen: at(secs),
            updated_at: at(secs),
            message_id: None,
        }
    }

    fn detection(message_id: &str, secs: i64) -> DetectionRecord {
        DetectionRecord {
            detection: DetectionEvent {
                camera_id: "cam1".to_string(),
                timestamp: at(secs),
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
                class_name: "person".to_string(),
                confidence: 0.5,
                embedding: None,
                message_id: message_id.to_string(),
                detection_index: 0,
                frame_id: None,
            },
            track_id: 1,
        }
    }

    fn batch(detections: Vec<DetectionRecord>, tracks: Vec<TrackRecord>) -> WriteBatch {
        WriteBatch {
            camera_id: "cam1".to_string(),
            message_id: Some("m".to_string()),
            detections,
            tracks,
        }
    }

    #[tokio::test]
    async fn test_rewrite_inserts_nothing() {
        let store = MemoryStore::new();
        let batch = batch(vec![detection("m", 0)], vec![track(1, 1, 0)]);

        let first = store.write_batch(&batch).await.unwrap();
        let second = store.write_batch(&batch).await.unwrap();

        assert_eq!(first, WriteSummary { detections: 1, track_versions: 1 });
        assert_eq!(second, WriteSummary::default());
        assert_eq!(store.detection_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);

        let error = store.write_batch(&WriteBatch::default()).await.unwrap_err();
        assert!(error.is_transient());
        tokio_test::assert_ok!(store.write_batch(&WriteBatch::default()).await);
    }

    #[tokio::test]
    async fn test_history_is_ordered_and_limited() {
        let store = MemoryStore::new();
        store
            .write_batch(&batch(
                vec![],
                vec![track(2, 1, 5), track(1, 2, 3), track(1, 1, 1)],
            ))
            .await
            .unwrap();

        let history = store
            .track_history("cam1", at(0), at(10), 2)
            .await
            .unwrap();
        let keys: Vec<_> = history.iter().map(|r| (r.track_id, r.version)).collect();
        assert_eq!(keys, vec![(1, 1), (1, 2)]);

        assert_eq!(store.max_track_id("cam1").await.unwrap(), Some(2));
        assert_eq!(store.max_track_id("cam9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_rows_and_highest_track() {
        let store = MemoryStore::new();
        store
            .write_batch(&batch(
                vec![detection("old", 0), detection("new", 100)],
                vec![track(1, 1, 0), track(2, 1, 0), track(3, 1, 100)],
            ))
            .await
            .unwrap();

        let purged = store.purge_older_than(at(0) + Duration::seconds(50)).await.unwrap();

        assert_eq!(purged, PurgeSummary { detections: 1, track_versions: 2 });
        assert!(store.detection("cam1", "new", 0).is_some());
        assert_eq!(store.max_track_id("cam1").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_recent_message_ids_cover_window_of_newest() {
        let store = MemoryStore::new();
        let mut tick = track(1, 2, 400);
        tick.message_id = None;
        let mut applied = track(1, 1, 350);
        applied.message_id = Some("tracks-only".to_string());
        store
            .write_batch(&batch(
                vec![detection("old", 0), detection("recent", 200), detection("newest", 400)],
                vec![applied, tick],
            ))
            .await
            .unwrap();

        let recent = store
            .recent_message_ids("cam1", Duration::seconds(300))
            .await
            .unwrap();
        let ids: Vec<_> = recent.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["recent", "tracks-only", "newest"]);
        assert_eq!(recent[0].1, at(200));

        assert!(store
            .recent_message_ids("cam9", Duration::seconds(300))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_track_path_follows_detections_in_time_order() {
        let store = MemoryStore::new();
        let mut moved = detection("b", 2);
        moved.detection.bbox = BoundingBox::new(3.0, 4.0, 1.0, 1.0);
        let mut other = detection("c", 1);
        other.track_id = 2;
        store
            .write_batch(&batch(vec![moved, detection("a", 0), other], vec![]))
            .await
            .unwrap();

        let path = store.track_path("cam1", 1, None, None).await.unwrap().unwrap();
        let centers: Vec<_> = path.points.iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(centers, vec![(0.5, 0.5), (3.5, 4.5)]);
        assert_eq!(path.class_name, "person");
        assert!((path.total_distance - 5.0).abs() < 1e-6);
        assert!((path.average_velocity - 2.5).abs() < 1e-6);

        let late = store.track_path("cam1", 1, Some(at(1)), None).await.unwrap().unwrap();
        assert_eq!(late.points.len(), 1);
        assert!(store.track_path("cam1", 9, None, None).await.unwrap().is_none());
        assert!(store.track_path("cam2", 1, None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_unhealthy() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.health().await.is_err());
        store.set_available(true);
        assert!(store.health().await.is_ok());
    }
}
