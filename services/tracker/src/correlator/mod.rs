//! Per-camera track correlation.
//!
//! A [`Correlator`] owns all live tracks of one camera and is driven strictly
//! sequentially by that camera's lane. Every state change it makes comes back
//! as a [`Correlation`]: the records to persist and the updates to broadcast.

mod dedup;
mod matching;
mod track;

pub use dedup::DedupWindow;
pub use matching::{association_cost, cosine_similarity, greedy_assign, Assignment, Candidate};
pub use track::{Track, TrackState};

use crate::config::TrackerConfig;
use crate::error::{CorrelationAmbiguity, FatalInternalError};
use crate::event::DetectionBatch;
use crate::records::{DetectionRecord, TrackRecord, TrackUpdate, WriteBatch};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Output of one correlation step
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub write: WriteBatch,
    pub updates: Vec<TrackUpdate>,
    pub ambiguities: Vec<CorrelationAmbiguity>,
}

impl Correlation {
    fn new(camera_id: &str, message_id: Option<&str>) -> Self {
        Self {
            write: WriteBatch {
                camera_id: camera_id.to_string(),
                message_id: message_id.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn push(&mut self, record: TrackRecord) {
        self.updates.push(TrackUpdate::from(&record));
        self.write.tracks.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.write.is_empty()
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    Applied(Correlation),
    /// Message id already processed inside the dedup window
    Duplicate,
    /// Older than the dedup window allows; cannot be checked for duplicates
    Stale { newest: DateTime<Utc> },
}

pub struct Correlator {
    camera_id: String,
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    dedup: DedupWindow,
    next_track_id: u64,
    /// Newest message timestamp applied
    newest_event: Option<DateTime<Utc>>,
    /// Stream time used for timeouts; may run ahead of `newest_event` via ticks
    clock: Option<DateTime<Utc>>,
}

impl Correlator {
    /// `first_track_id` must be above every id this camera has ever used
    pub fn new(camera_id: impl Into<String>, config: TrackerConfig, first_track_id: u64) -> Self {
        let dedup = DedupWindow::new(config.dedup_window());
        Self {
            camera_id: camera_id.into(),
            config,
            tracks: BTreeMap::new(),
            dedup,
            next_track_id: first_track_id.max(1),
            newest_event: None,
            clock: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn is_duplicate(&self, message_id: &str) -> bool {
        self.dedup.contains(message_id)
    }

    /// Mark a message as already applied, e.g. one persisted before a restart
    pub fn remember(&mut self, message_id: &str, applied_at: DateTime<Utc>) {
        self.dedup.insert(message_id, applied_at);
    }

    pub fn newest_event(&self) -> Option<DateTime<Utc>> {
        self.newest_event
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    /// Current live tracks, ordered by id
    pub fn snapshot(&self) -> Vec<TrackUpdate> {
        self.tracks.values().map(Track::snapshot).collect()
    }

    /// Apply one validated batch
    pub fn ingest(&mut self, batch: &DetectionBatch) -> Result<IngestOutcome, FatalInternalError> {
        if batch.camera_id != self.camera_id {
            return Err(FatalInternalError(format!(
                "batch for camera {} routed to lane {}",
                batch.camera_id, self.camera_id
            )));
        }

        if self.dedup.contains(&batch.message_id) {
            return Ok(IngestOutcome::Duplicate);
        }
        if let Some(newest) = self.newest_event {
            if batch.timestamp < newest - self.dedup.window() {
                return Ok(IngestOutcome::Stale { newest });
            }
        }

        let now = batch.timestamp;
        self.dedup.insert(&batch.message_id, now);
        let newest = self.newest_event.map_or(now, |n| n.max(now));
        self.newest_event = Some(newest);
        self.dedup.evict(newest);

        let mut out = Correlation::new(&self.camera_id, Some(&batch.message_id));
        self.advance_into(now, &mut out)?;

        let config = &self.config;
        let candidates: Vec<Candidate> = self
            .tracks
            .values()
            .flat_map(|track| {
                batch
                    .detections
                    .iter()
                    .enumerate()
                    .filter_map(move |(i, detection)| {
                        association_cost(track, detection, config).map(|cost| Candidate {
                            track_id: track.track_id,
                            detection: i,
                            cost,
                        })
                    })
            })
            .collect();

        let assignment = greedy_assign(
            candidates,
            batch.detections.len(),
            self.config.match_threshold,
            self.config.ambiguity_margin,
        );

        for ambiguity in &assignment.ambiguities {
            warn!(
                camera_id = %self.camera_id,
                message_id = %batch.message_id,
                "{}",
                ambiguity
            );
            metrics::counter!("tracker.correlation.ambiguous").increment(1);
        }

        let mut track_of: Vec<u64> = vec![0; batch.detections.len()];
        let mut changed: Vec<u64> = Vec::with_capacity(batch.detections.len());

        for &(track_id, index) in &assignment.matches {
            let track = self.tracks.get_mut(&track_id).ok_or_else(|| {
                FatalInternalError(format!("matched unknown track {}", track_id))
            })?;
            track.observe(
                &batch.detections[index],
                self.config.velocity_smoothing,
                self.config.embedding_smoothing,
            );
            if track.state() == TrackState::Tentative && track.hits >= self.config.confirm_hits {
                track.transition(TrackState::Confirmed)?;
                metrics::counter!("tracker.tracks.confirmed").increment(1);
            }
            track_of[index] = track_id;
            changed.push(track_id);
        }

        for track in self.tracks.values_mut() {
            if track.state().is_matchable() && !changed.contains(&track.track_id) {
                track.miss();
            }
        }

        for &index in &assignment.unmatched_detections {
            let track_id = self.next_track_id;
            self.next_track_id += 1;

            let mut track = Track::spawn(track_id, &batch.detections[index], self.config.history_len);
            if track.hits >= self.config.confirm_hits {
                track.transition(TrackState::Confirmed)?;
            }
            debug!(camera_id = %self.camera_id, track_id = track_id, "Spawned track");
            metrics::counter!("tracker.tracks.spawned").increment(1);

            self.tracks.insert(track_id, track);
            track_of[index] = track_id;
            changed.push(track_id);
        }

        changed.sort_unstable();
        for track_id in changed {
            if let Some(track) = self.tracks.get_mut(&track_id) {
                let record = track.emit(now, Some(&batch.message_id));
                out.push(record);
            }
        }

        out.write.detections = batch
            .detections
            .iter()
            .zip(track_of)
            .map(|(detection, track_id)| DetectionRecord {
                detection: detection.clone(),
                track_id,
            })
            .collect();
        out.ambiguities = assignment.ambiguities;

        Ok(IngestOutcome::Applied(out))
    }

    /// Apply lifecycle timeouts at `now` without any new detections
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Correlation, FatalInternalError> {
        let mut out = Correlation::new(&self.camera_id, None);
        self.advance_into(now, &mut out)?;
        Ok(out)
    }

    fn advance_into(
        &mut self,
        now: DateTime<Utc>,
        out: &mut Correlation,
    ) -> Result<(), FatalInternalError> {
        let now = self.clock.map_or(now, |clock| clock.max(now));
        self.clock = Some(now);

        let lost_after = self.config.lost_timeout();
        let terminate_after = self.config.terminate_timeout();
        let mut finished = Vec::new();

        for track in self.tracks.values_mut() {
            let idle = track.idle(now);

            if track.state() == TrackState::Tentative && idle >= lost_after {
                track.transition(TrackState::Terminated)?;
                out.push(track.emit(now, None));
                finished.push(track.track_id);
                continue;
            }

            if track.state() == TrackState::Confirmed && idle >= lost_after {
                track.transition(TrackState::Lost)?;
                out.push(track.emit(now, None));
                metrics::counter!("tracker.tracks.lost").increment(1);
            }

            if track.state() == TrackState::Lost && idle >= terminate_after {
                track.transition(TrackState::Terminated)?;
                out.push(track.emit(now, None));
                finished.push(track.track_id);
            }
        }

        for track_id in finished {
            self.tracks.remove(&track_id);
            metrics::counter!("tracker.tracks.terminated").increment(1);
            debug!(camera_id = %self.camera_id, track_id = track_id, "Track terminated");
        }

        Ok(())
    }
}
