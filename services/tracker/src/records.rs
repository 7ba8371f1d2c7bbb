//! Records handed from the correlator to persistence and broadcast.

use crate::correlator::TrackState;
use crate::event::{BoundingBox, DetectionEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable version of a track. Rows are append-only; `prev_version`
/// links each version to the one it supersedes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub camera_id: String,
    pub track_id: u64,
    pub version: u64,
    pub prev_version: Option<u64>,
    pub state: TrackState,
    pub class_name: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub velocity_x: f32,
    pub velocity_y: f32,
    pub hits: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Stream time at which this version was produced
    pub updated_at: DateTime<Utc>,
    /// Message that caused the change; `None` for timeout-driven changes
    pub message_id: Option<String>,
}

/// A detection together with the track it was associated with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    #[serde(flatten)]
    pub detection: DetectionEvent,
    pub track_id: u64,
}

/// Everything one correlation step needs stored, written atomically
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteBatch {
    pub camera_id: String,
    /// Source message; `None` for batches produced by lifecycle ticks
    pub message_id: Option<String>,
    pub detections: Vec<DetectionRecord>,
    pub tracks: Vec<TrackRecord>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.tracks.is_empty()
    }
}

/// Track change pushed to live viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackUpdate {
    pub camera_id: String,
    pub track_id: u64,
    pub version: u64,
    pub state: TrackState,
    pub class_name: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub velocity: (f32, f32),
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TrackRecord> for TrackUpdate {
    fn from(record: &TrackRecord) -> Self {
        Self {
            camera_id: record.camera_id.clone(),
            track_id: record.track_id,
            version: record.version,
            state: record.state,
            class_name: record.class_name.clone(),
            bbox: record.bbox,
            confidence: record.confidence,
            velocity: (record.velocity_x, record.velocity_y),
            last_seen: record.last_seen,
            updated_at: record.updated_at,
        }
    }
}

/// One observed position of a track: the center of its detection box
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathPoint {
    pub x: f32,
    pub y: f32,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
}

/// Where one track went, in observation order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackPath {
    pub camera_id: String,
    pub track_id: u64,
    pub class_name: String,
    pub points: Vec<PathPoint>,
    /// Sum of distances between consecutive points, in pixels
    pub total_distance: f64,
    /// Pixels per second over the whole path; zero for a single instant
    pub average_velocity: f64,
}

impl TrackPath {
    /// `points` must be ordered by time. `None` when there are no points.
    pub fn from_points(
        camera_id: impl Into<String>,
        track_id: u64,
        class_name: impl Into<String>,
        points: Vec<PathPoint>,
    ) -> Option<Self> {
        let (first, last) = (points.first()?, points.last()?);

        let total_distance: f64 = points
            .windows(2)
            .map(|pair| {
                let dx = f64::from(pair[1].x - pair[0].x);
                let dy = f64::from(pair[1].y - pair[0].y);
                dx.hypot(dy)
            })
            .sum();
        let seconds = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        let average_velocity = if seconds > 0.0 {
            total_distance / seconds
        } else {
            0.0
        };

        Some(Self {
            camera_id: camera_id.into(),
            track_id,
            class_name: class_name.into(),
            points,
            total_distance,
            average_velocity,
        })
    }
}
