use crate::error::PipelineError;
use crate::event::EventDecoder;
use crate::lanes::LaneRouter;
use camtrack_pipeline::{async_trait, Completion, HandlerOutcome, IncomingMessage, MessageHandler};
use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Consumer-facing entry point: validates each message and hands it to its
/// camera's lane
pub struct TrackingHandler {
    decoder: EventDecoder,
    router: Arc<LaneRouter>,
}

impl TrackingHandler {
    pub fn new(decoder: EventDecoder, router: Arc<LaneRouter>) -> Self {
        Self { decoder, router }
    }
}

#[async_trait]
impl MessageHandler for TrackingHandler {
    async fn dispatch(&self, message: IncomingMessage) -> Completion {
        metrics::counter!("tracker.messages.received").increment(1);

        let batch = match self.decoder.decode(&message, Utc::now()) {
            Ok(batch) => batch,
            Err(e) => {
                metrics::counter!("tracker.messages.invalid").increment(1);
                warn!(
                    partition = message.metadata.partition,
                    offset = message.metadata.offset,
                    error = %e,
                    "Dropping invalid message"
                );
                let reason = e.to_string();
                return async move { HandlerOutcome::Drop { reason } }.boxed();
            }
        };

        debug!(
            camera_id = %batch.camera_id,
            message_id = %batch.message_id,
            detections = batch.detections.len(),
            "Routing batch"
        );

        let camera_id = batch.camera_id.clone();
        let outcome = self.router.submit(batch).await;

        async move {
            outcome.await.unwrap_or_else(|_| HandlerOutcome::Retry {
                reason: PipelineError::LaneUnavailable(camera_id).to_string(),
            })
        }
        .boxed()
    }
}
