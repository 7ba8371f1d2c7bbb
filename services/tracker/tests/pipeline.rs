//! End-to-end lane behavior against the in-memory store

use camtrack_pipeline::{HandlerOutcome, IncomingMessage, MessageHandler, MessageMetadata};
use camtrack_tracker::config::{LaneConfig, PersistenceConfig, TrackerConfig, ValidationConfig};
use camtrack_tracker::{
    BoundingBox, BroadcastHub, DetectionBatch, DetectionEvent, EventDecoder, HubEvent,
    LaneContext, LaneRouter, MemoryStore, TrackRecord, TrackState, TrackingHandler, TrackWriter,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

struct Harness {
    store: Arc<MemoryStore>,
    hub: Arc<BroadcastHub>,
    router: Arc<LaneRouter>,
}

impl Harness {
    fn new(hub_capacity: usize) -> Self {
        Self::with_persistence(
            hub_capacity,
            PersistenceConfig {
                max_attempts: 1,
                retry_base_ms: 1,
                retry_max_ms: 1,
                ..Default::default()
            },
        )
    }

    fn with_persistence(hub_capacity: usize, persistence: PersistenceConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(hub_capacity));
        let router = Arc::new(LaneRouter::new(LaneContext {
            writer: Arc::new(TrackWriter::new(store.clone(), persistence.clone())),
            hub: hub.clone(),
            tracker: TrackerConfig::default(),
            lanes: LaneConfig::default(),
            persistence,
        }));
        Self { store, hub, router }
    }

    async fn submit(&self, batch: DetectionBatch) -> HandlerOutcome {
        self.router
            .submit(batch)
            .await
            .await
            .expect("lane dropped the reply")
    }

    fn states(&self, track_id: u64) -> Vec<TrackState> {
        self.store
            .versions_of("cam1", track_id)
            .iter()
            .map(|record| record.state)
            .collect()
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
}

fn batch(id: &str, secs: i64, boxes: &[(f32, f32)]) -> DetectionBatch {
    let detections = boxes
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| DetectionEvent {
            camera_id: "cam1".to_string(),
            timestamp: at(secs),
            bbox: BoundingBox::new(x, y, 20.0, 20.0),
            class_name: "person".to_string(),
            confidence: 0.9,
            embedding: None,
            message_id: id.to_string(),
            detection_index: i as u32,
            frame_id: None,
        })
        .collect();
    DetectionBatch {
        camera_id: "cam1".to_string(),
        message_id: id.to_string(),
        timestamp: at(secs),
        frame_id: None,
        detections,
    }
}

fn walking_person() -> Vec<DetectionBatch> {
    vec![
        batch("m0", 0, &[(0.0, 0.0)]),
        batch("m1", 1, &[(1.0, 0.5)]),
        batch("m2", 2, &[(2.0, 1.0)]),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_track_confirms_then_ages_out() {
    let harness = Harness::new(64);

    for batch in walking_person() {
        assert_eq!(harness.submit(batch).await, HandlerOutcome::Ack);
    }
    assert_eq!(
        harness.states(1),
        vec![TrackState::Tentative, TrackState::Tentative, TrackState::Confirmed]
    );
    for index in 0..3 {
        let id = format!("m{}", index);
        assert_eq!(harness.store.detection("cam1", &id, 0).map(|d| d.track_id), Some(1));
    }

    // Silence: lanes age tracks from the newest message time plus elapsed time
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    assert_eq!(harness.states(1).last(), Some(&TrackState::Lost));

    tokio::time::sleep(std::time::Duration::from_secs(8)).await;
    let versions: Vec<TrackRecord> = harness.store.versions_of("cam1", 1);
    let states = harness.states(1);
    assert_eq!(states.iter().filter(|s| **s == TrackState::Lost).count(), 1);
    assert_eq!(states.iter().filter(|s| **s == TrackState::Terminated).count(), 1);

    let terminated = versions.last().unwrap();
    assert_eq!(terminated.state, TrackState::Terminated);
    assert_eq!(terminated.version, 5);
    assert_eq!(terminated.prev_version, Some(4));
    assert!(terminated.updated_at >= at(12));

    assert!(harness.router.snapshot("cam1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_write_does_not_age_live_tracks() {
    let harness = Harness::with_persistence(
        64,
        PersistenceConfig {
            max_attempts: 6,
            retry_base_ms: 1000,
            retry_max_ms: 4000,
            ..Default::default()
        },
    );
    for batch in walking_person() {
        assert_eq!(harness.submit(batch).await, HandlerOutcome::Ack);
    }

    // Every write succeeds eventually, after several seconds of retries
    harness.store.fail_next_writes(5);
    let started = tokio::time::Instant::now();
    assert_eq!(harness.submit(batch("m3", 3, &[(3.0, 1.5)])).await, HandlerOutcome::Ack);
    assert!(started.elapsed() > std::time::Duration::from_secs(4));

    let snapshot = harness.router.snapshot("cam1").await.unwrap();
    let live: Vec<_> = snapshot.iter().map(|u| (u.track_id, u.state)).collect();
    assert_eq!(live, vec![(1, TrackState::Confirmed)]);

    assert_eq!(harness.submit(batch("m4", 4, &[(4.0, 2.0)])).await, HandlerOutcome::Ack);
    for index in 0..5 {
        let id = format!("m{}", index);
        assert_eq!(harness.store.detection("cam1", &id, 0).map(|d| d.track_id), Some(1));
    }
    assert!(!harness.states(1).contains(&TrackState::Lost));
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_message_adds_no_rows_or_broadcasts() {
    let harness = Harness::new(64);
    let mut updates = harness.hub.subscribe("cam1");

    for batch in walking_person() {
        harness.submit(batch).await;
    }
    let mut received = 0;
    while let Some(Some(_)) = updates.next().now_or_never() {
        received += 1;
    }
    assert_eq!(received, 3);

    let detections = harness.store.detection_count();
    let versions = harness.store.track_version_count();

    let redelivered = batch("m1", 1, &[(1.0, 0.5)]);
    assert_eq!(harness.submit(redelivered).await, HandlerOutcome::Ack);

    assert_eq!(harness.store.detection_count(), detections);
    assert_eq!(harness.store.track_version_count(), versions);
    assert!(updates.next().now_or_never().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_replay_yields_identical_state() {
    let first = Harness::new(64);
    let second = Harness::new(64);

    let sequence = vec![
        batch("a", 0, &[(0.0, 0.0), (400.0, 400.0)]),
        batch("b", 1, &[(2.0, 1.0), (401.0, 402.0)]),
        batch("c", 2, &[(800.0, 100.0)]),
        batch("d", 3, &[(4.0, 2.0), (403.0, 404.0)]),
    ];

    for batch in sequence.clone() {
        first.submit(batch).await;
    }
    for batch in sequence.clone() {
        second.submit(batch).await;
    }
    // Replaying into the same lane is all duplicates
    for batch in sequence {
        assert_eq!(first.submit(batch).await, HandlerOutcome::Ack);
    }

    assert_eq!(first.store.track_version_count(), second.store.track_version_count());
    assert_eq!(first.store.detection_count(), second.store.detection_count());
    for track_id in 1..=3 {
        assert_eq!(
            first.store.versions_of("cam1", track_id),
            second.store.versions_of("cam1", track_id)
        );
    }
    assert_eq!(
        first.router.snapshot("cam1").await.unwrap(),
        second.router.snapshot("cam1").await.unwrap()
    );
}

#[tokio::test]
async fn test_backlog_flushes_in_order_after_outage() {
    let harness = Harness::new(64);
    let batches = walking_person();

    harness.store.set_available(true);
    assert_eq!(harness.submit(batches[0].clone()).await, HandlerOutcome::Ack);

    harness.store.set_available(false);
    for batch in &batches[1..] {
        assert!(matches!(
            harness.submit(batch.clone()).await,
            HandlerOutcome::Retry { .. }
        ));
    }
    assert_eq!(harness.store.track_version_count(), 1);

    // The first redelivery flushes everything correlated so far
    harness.store.set_available(true);
    assert_eq!(harness.submit(batches[1].clone()).await, HandlerOutcome::Ack);
    assert_eq!(
        harness.states(1),
        vec![TrackState::Tentative, TrackState::Tentative, TrackState::Confirmed]
    );
    assert_eq!(harness.submit(batches[2].clone()).await, HandlerOutcome::Ack);
    assert_eq!(harness.store.detection_count(), 3);
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_ingestion() {
    let harness = Harness::new(2);
    let mut slow = harness.hub.subscribe("cam1");

    for secs in 0..5 {
        let id = format!("m{}", secs);
        let batch = batch(&id, secs, &[(secs as f32, 0.0)]);
        assert_eq!(harness.submit(batch).await, HandlerOutcome::Ack);
    }

    assert_eq!(slow.next().await, Some(HubEvent::Resync { skipped: 3 }));
    match slow.next().await {
        Some(HubEvent::Update(update)) => assert_eq!(update.version, 4),
        other => panic!("expected update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handler_drops_invalid_and_tracks_valid_messages() {
    let harness = Harness::new(8);
    let handler = TrackingHandler::new(
        EventDecoder::new(ValidationConfig::default()),
        harness.router.clone(),
    );

    let message = |payload: String| IncomingMessage {
        payload: payload.into_bytes(),
        metadata: MessageMetadata {
            topic: "camtrack.detections".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            timestamp: None,
            headers: HashMap::new(),
        },
        attempt: 1,
    };

    let invalid = message(
        r#"{"message_id":"x","camera_id":"cam1","timestamp":"2023-11-14T22:13:20Z","detections":[{"bbox":{"x":1,"y":1,"width":5,"height":5},"class_name":"person","confidence":1.7}]}"#
            .to_string(),
    );
    assert!(matches!(
        handler.dispatch(invalid).await.await,
        HandlerOutcome::Drop { .. }
    ));

    let valid = message(
        r#"{"message_id":"y","camera_id":"cam1","timestamp":"2023-11-14T22:13:20Z","objects":[{"bbox":{"x":1,"y":1,"width":5,"height":5},"class":"person","confidence":0.7}]}"#
            .to_string(),
    );
    assert_eq!(handler.dispatch(valid).await.await, HandlerOutcome::Ack);
    assert_eq!(harness.store.detection_count(), 1);
    assert!(harness.store.detection("cam1", "x", 0).is_none());
}
