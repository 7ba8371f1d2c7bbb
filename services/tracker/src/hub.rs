//! Broadcast Hub - live track updates fanned out per camera
//!
//! Each camera with at least one subscriber has a bounded
//! `tokio::sync::broadcast` channel. Publishing never waits: a subscriber that
//! falls more than `capacity` updates behind loses the oldest ones and is told
//! how many it missed through [`HubEvent::Resync`].

use crate::records::TrackUpdate;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Update(Arc<TrackUpdate>),
    /// Updates were dropped for this subscriber; it should re-request a snapshot
    Resync { skipped: u64 },
}

pub struct BroadcastHub {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<TrackUpdate>>>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a camera's updates. Dropping the stream unsubscribes.
    pub fn subscribe(&self, camera_id: &str) -> BoxStream<'static, HubEvent> {
        let receiver = {
            let mut channels = self.channels.write();
            channels
                .entry(camera_id.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        metrics::counter!("tracker.hub.subscriptions").increment(1);
        debug!(camera_id = %camera_id, "Subscriber attached");

        let camera = camera_id.to_string();
        BroadcastStream::new(receiver)
            .map(move |item| match item {
                Ok(update) => HubEvent::Update(update),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    metrics::counter!("tracker.hub.lagged").increment(skipped);
                    warn!(camera_id = %camera, skipped = skipped, "Subscriber lagged");
                    HubEvent::Resync { skipped }
                }
            })
            .boxed()
    }

    /// Publish without waiting; returns how many subscribers were reached
    pub fn publish(&self, update: TrackUpdate) -> usize {
        let camera_id = update.camera_id.clone();
        let sent = {
            let channels = self.channels.read();
            match channels.get(&camera_id) {
                Some(sender) => sender.send(Arc::new(update)).ok(),
                None => return 0,
            }
        };

        match sent {
            Some(receivers) => {
                metrics::counter!("tracker.hub.published").increment(1);
                receivers
            }
            None => {
                self.release_if_idle(&camera_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, camera_id: &str) -> usize {
        self.channels
            .read()
            .get(camera_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Cameras that currently have a channel
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    fn release_if_idle(&self, camera_id: &str) {
        let mut channels = self.channels.write();
        if channels
            .get(camera_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(camera_id);
            debug!(camera_id = %camera_id, "Released channel without subscribers");
        }
    }
}
