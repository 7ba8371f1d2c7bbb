//! Association cost and greedy detection-to-track assignment.

use super::track::Track;
use crate::config::TrackerConfig;
use crate::error::CorrelationAmbiguity;
use crate::event::DetectionEvent;

/// A feasible (track, detection) pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub track_id: u64,
    pub detection: usize,
    pub cost: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// (track id, detection index) pairs
    pub matches: Vec<(u64, usize)>,
    pub unmatched_detections: Vec<usize>,
    pub ambiguities: Vec<CorrelationAmbiguity>,
}

/// Cosine similarity, `None` when the vectors are not comparable
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some((dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0))
}

/// Cost of associating `detection` with `track`, `None` if infeasible.
///
/// The spatial term is the distance between the detection center and the
/// track's predicted center, divided by `max_distance`. When both sides carry
/// an embedding the appearance term `(1 - cos) / 2` is blended in with the
/// configured weights.
pub fn association_cost(
    track: &Track,
    detection: &DetectionEvent,
    config: &TrackerConfig,
) -> Option<f32> {
    if track.class_name != detection.class_name || !track.state().is_matchable() {
        return None;
    }

    let (px, py) = track.predicted_center(detection.timestamp);
    let (dx, dy) = detection.bbox.center();
    let distance = ((dx - px).powi(2) + (dy - py).powi(2)).sqrt();
    if !distance.is_finite() || distance > config.max_distance {
        return None;
    }
    let spatial = distance / config.max_distance;

    let appearance = match (&track.embedding, &detection.embedding) {
        (Some(a), Some(b)) => match cosine_similarity(a, b) {
            Some(similarity) if similarity < config.min_embedding_similarity => return None,
            Some(similarity) => Some((1.0 - similarity) / 2.0),
            None => None,
        },
        _ => None,
    };

    let cost = match appearance {
        Some(appearance) => {
            let total = config.spatial_weight + config.appearance_weight;
            (config.spatial_weight * spatial + config.appearance_weight * appearance) / total
        }
        None => spatial,
    };

    Some(cost)
}

/// Greedy assignment over feasible pairs, cheapest first.
///
/// Pairs are ordered by (cost, track id, detection index), so an exact tie
/// goes to the lowest track id. A pair costing more than `match_threshold`
/// never matches. When a runner-up track for the same detection is within
/// `ambiguity_margin` of the winner, the decision is reported as ambiguous.
pub fn greedy_assign(
    mut candidates: Vec<Candidate>,
    detection_count: usize,
    match_threshold: f32,
    ambiguity_margin: f32,
) -> Assignment {
    candidates.retain(|c| c.cost.is_finite() && c.cost <= match_threshold);
    candidates.sort_by(|a, b| {
        a.cost
            .total_cmp(&b.cost)
            .then(a.track_id.cmp(&b.track_id))
            .then(a.detection.cmp(&b.detection))
    });

    let mut assignment = Assignment::default();
    let mut track_taken: Vec<u64> = Vec::new();
    let mut detection_taken = vec![false; detection_count];

    for (i, candidate) in candidates.iter().enumerate() {
        if detection_taken[candidate.detection] || track_taken.contains(&candidate.track_id) {
            continue;
        }

        if let Some(rival) = candidates[i + 1..].iter().find(|other| {
            other.detection == candidate.detection
                && other.cost - candidate.cost <= ambiguity_margin
                && !track_taken.contains(&other.track_id)
        }) {
            assignment.ambiguities.push(CorrelationAmbiguity {
                detection_index: candidate.detection,
                chosen: candidate.track_id,
                chosen_cost: candidate.cost,
                rival: rival.track_id,
                rival_cost: rival.cost,
            });
        }

        detection_taken[candidate.detection] = true;
        track_taken.push(candidate.track_id);
        assignment
            .matches
            .push((candidate.track_id, candidate.detection));
    }

    assignment.unmatched_detections = detection_taken
        .iter()
        .enumerate()
        .filter_map(|(i, taken)| if *taken { None } else { Some(i) })
        .collect();

    assignment
}
