//! Live track state and its lifecycle.

use crate::error::FatalInternalError;
use crate::event::{BoundingBox, DetectionEvent};
use crate::records::{TrackRecord, TrackUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a track.
///
/// Allowed transitions are `Tentative -> Confirmed -> Lost -> Terminated` and
/// `Tentative -> Terminated`. There is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Terminated,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Tentative => "tentative",
            TrackState::Confirmed => "confirmed",
            TrackState::Lost => "lost",
            TrackState::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(self, next: TrackState) -> bool {
        matches!(
            (self, next),
            (TrackState::Tentative, TrackState::Confirmed)
                | (TrackState::Tentative, TrackState::Terminated)
                | (TrackState::Confirmed, TrackState::Lost)
                | (TrackState::Lost, TrackState::Terminated)
        )
    }

    /// Whether detections may still be associated with a track in this state
    pub fn is_matchable(self) -> bool {
        matches!(self, TrackState::Tentative | TrackState::Confirmed)
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tentative" => Ok(TrackState::Tentative),
            "confirmed" => Ok(TrackState::Confirmed),
            "lost" => Ok(TrackState::Lost),
            "terminated" => Ok(TrackState::Terminated),
            other => Err(format!("unknown track state {:?}", other)),
        }
    }
}

/// A live track, owned by its camera's correlator
#[derive(Debug, Clone)]
pub struct Track {
    pub camera_id: String,
    pub track_id: u64,
    pub class_name: String,
    state: TrackState,
    /// Last persisted/broadcast version; 0 before the first record
    version: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Stream time of the last emitted version
    pub updated_at: DateTime<Utc>,
    /// Consecutive hits; reset when a tentative track misses a frame
    pub hits: u32,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Pixels per second
    pub velocity: (f32, f32),
    pub embedding: Option<Vec<f32>>,
    pub history: VecDeque<DetectionEvent>,
    history_len: usize,
}

impl Track {
    /// Start a tentative track from an unmatched detection. The spawn counts as the first hit.
    pub fn spawn(track_id: u64, detection: &DetectionEvent, history_len: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_len.min(64));
        history.push_back(detection.clone());

        Self {
            camera_id: detection.camera_id.clone(),
            track_id,
            class_name: detection.class_name.clone(),
            state: TrackState::Tentative,
            version: 0,
            first_seen: detection.timestamp,
            last_seen: detection.timestamp,
            updated_at: detection.timestamp,
            hits: 1,
            bbox: detection.bbox,
            confidence: detection.confidence,
            velocity: (0.0, 0.0),
            embedding: detection.embedding.clone(),
            history,
            history_len: history_len.max(1),
        }
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    /// Center extrapolated to `at` with the smoothed velocity
    pub fn predicted_center(&self, at: DateTime<Utc>) -> (f32, f32) {
        let dt = seconds_between(self.last_seen, at).max(0.0);
        let (cx, cy) = self.center();
        (cx + self.velocity.0 * dt, cy + self.velocity.1 * dt)
    }

    /// Time since the last associated detection
    pub fn idle(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_seen
    }

    pub fn transition(&mut self, next: TrackState) -> Result<(), FatalInternalError> {
        if !self.state.can_transition_to(next) {
            return Err(FatalInternalError(format!(
                "track {}/{}: illegal transition {} -> {}",
                self.camera_id, self.track_id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Associate a detection with this track
    pub fn observe(
        &mut self,
        detection: &DetectionEvent,
        velocity_smoothing: f32,
        embedding_smoothing: f32,
    ) {
        let dt = seconds_between(self.last_seen, detection.timestamp);
        if dt > 0.0 {
            let (px, py) = self.center();
            let (cx, cy) = detection.bbox.center();
            let sample = ((cx - px) / dt, (cy - py) / dt);
            let a = velocity_smoothing.clamp(0.0, 1.0);
            self.velocity = (
                a * sample.0 + (1.0 - a) * self.velocity.0,
                a * sample.1 + (1.0 - a) * self.velocity.1,
            );
        }

        self.embedding = match (self.embedding.take(), &detection.embedding) {
            (Some(current), Some(new)) if current.len() == new.len() => {
                let a = embedding_smoothing.clamp(0.0, 1.0);
                Some(
                    current
                        .iter()
                        .zip(new)
                        .map(|(c, n)| a * n + (1.0 - a) * c)
                        .collect(),
                )
            }
            (_, Some(new)) => Some(new.clone()),
            (current, None) => current,
        };

        self.bbox = detection.bbox;
        self.confidence = detection.confidence;
        if detection.timestamp > self.last_seen {
            self.last_seen = detection.timestamp;
        }
        self.hits = self.hits.saturating_add(1);

        if self.history.len() >= self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(detection.clone());
    }

    /// A tentative track that was not matched loses its streak
    pub fn miss(&mut self) {
        if self.state == TrackState::Tentative {
            self.hits = 0;
        }
    }

    /// Bump the version and produce the record describing the current state
    pub fn emit(&mut self, updated_at: DateTime<Utc>, message_id: Option<&str>) -> TrackRecord {
        let prev_version = (self.version > 0).then_some(self.version);
        self.version += 1;
        self.updated_at = updated_at;

        TrackRecord {
            camera_id: self.camera_id.clone(),
            track_id: self.track_id,
            version: self.version,
            prev_version,
            state: self.state,
            class_name: self.class_name.clone(),
            bbox: self.bbox,
            confidence: self.confidence,
            velocity_x: self.velocity.0,
            velocity_y: self.velocity.1,
            hits: self.hits,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            updated_at,
            message_id: message_id.map(str::to_string),
        }
    }

    /// Current state as seen by viewers, without bumping the version
    pub fn snapshot(&self) -> TrackUpdate {
        TrackUpdate {
            camera_id: self.camera_id.clone(),
            track_id: self.track_id,
            version: self.version,
            state: self.state,
            class_name: self.class_name.clone(),
            bbox: self.bbox,
            confidence: self.confidence,
            velocity: self.velocity,
            last_seen: self.last_seen,
            updated_at: self.updated_at,
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f32 {
    (to - from).num_milliseconds() as f32 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn detection_at(secs: i64, x: f32, y: f32) -> DetectionEvent {
        DetectionEvent {
            camera_id: "cam1".to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            bbox: BoundingBox::new(x, y, 10.0, 10.0),
            class_name: "person".to_string(),
            confidence: 0.9,
            embedding: None,
            message_id: format!("m-{}", secs),
            detection_index: 0,
            frame_id: None,
        }
    }

    #[test]
    fn test_transitions_are_monotone() {
        use TrackState::*;
        let all = [Tentative, Confirmed, Lost, Terminated];
        let allowed = [
            (Tentative, Confirmed),
            (Tentative, Terminated),
            (Confirmed, Lost),
            (Lost, Terminated),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_illegal_transition_is_fatal() {
        let mut track = Track::spawn(1, &detection_at(0, 0.0, 0.0), 4);
        track.transition(TrackState::Confirmed).unwrap();
        track.transition(TrackState::Lost).unwrap();

        let error = track.transition(TrackState::Confirmed).unwrap_err();
        assert!(error.0.contains("lost -> confirmed"));
        assert_eq!(track.state(), TrackState::Lost);
    }

    #[test]
    fn test_observe_updates_velocity_and_bounds_history() {
        let mut track = Track::spawn(1, &detection_at(0, 0.0, 0.0), 2);
        track.observe(&detection_at(1, 10.0, 0.0), 1.0, 0.5);
        track.observe(&detection_at(2, 20.0, 0.0), 1.0, 0.5);

        assert_eq!(track.velocity, (10.0, 0.0));
        assert_eq!(track.hits, 3);
        assert_eq!(track.history.len(), 2);
        assert_eq!(track.history[0].message_id, "m-1");

        let predicted = track.predicted_center(detection_at(3, 0.0, 0.0).timestamp);
        assert_eq!(predicted, (35.0, 5.0));
    }

    #[test]
    fn test_out_of_order_observation_keeps_last_seen() {
        let mut track = Track::spawn(1, &detection_at(5, 0.0, 0.0), 4);
        track.observe(&detection_at(4, 1.0, 0.0), 0.5, 0.5);
        assert_eq!(track.last_seen, detection_at(5, 0.0, 0.0).timestamp);
        assert_eq!(track.velocity, (0.0, 0.0));
    }

    #[test]
    fn test_emit_chains_versions() {
        let mut track = Track::spawn(7, &detection_at(0, 0.0, 0.0), 4);
        let first = track.emit(track.last_seen, Some("m-0"));
        let second = track.emit(track.last_seen, None);

        assert_eq!((first.version, first.prev_version), (1, None));
        assert_eq!((second.version, second.prev_version), (2, Some(1)));
        assert_eq!(track.snapshot().version, 2);
    }

    #[test]
    fn test_parse_state_round_trip() {
        for state in [
            TrackState::Tentative,
            TrackState::Confirmed,
            TrackState::Lost,
            TrackState::Terminated,
        ] {
            assert_eq!(state.as_str().parse::<TrackState>(), Ok(state));
        }
        assert!("deleted".parse::<TrackState>().is_err());
    }
}
