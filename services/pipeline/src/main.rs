//! Detection publisher - feeds newline-delimited JSON detection messages onto
//! the detections topic.
//!
//! Each line is one message as a camera node would publish it. Lines without a
//! `message_id` get a generated one so redelivery downstream stays idempotent.
//!
//! Usage: `detection-publisher [FILE]` (reads stdin when no file is given)

use anyhow::{Context, Result};
use camtrack_pipeline::prelude::*;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// A line ready to publish
#[derive(Debug)]
struct PreparedMessage {
    camera_id: String,
    message_id: String,
    payload: Vec<u8>,
}

/// Parse one NDJSON line, filling in a message id when absent
fn prepare_line(line: &str) -> Result<Option<PreparedMessage>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut value: Value = serde_json::from_str(line).context("line is not valid JSON")?;
    let object = value
        .as_object_mut()
        .context("detection message must be a JSON object")?;

    let camera_id = object
        .get("camera_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .context("missing camera_id")?
        .to_string();

    let message_id = match object.get("message_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let id = Uuid::new_v4().to_string();
            object.insert("message_id".to_string(), Value::String(id.clone()));
            id
        }
    };

    Ok(Some(PreparedMessage {
        camera_id,
        message_id,
        payload: serde_json::to_vec(&value)?,
    }))
}

async fn publish_lines<R: AsyncBufRead + Unpin>(
    producer: &QueueProducer,
    reader: R,
) -> Result<(usize, usize)> {
    let mut lines = reader.lines();
    let mut sent = 0usize;
    let mut skipped = 0usize;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let prepared = match prepare_line(&line) {
            Ok(Some(prepared)) => prepared,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping invalid line");
                skipped += 1;
                continue;
            }
        };

        match producer
            .send_detection(&prepared.camera_id, &prepared.message_id, prepared.payload)
            .await
        {
            Ok(result) => {
                sent += 1;
                info!(
                    camera_id = %prepared.camera_id,
                    message_id = %prepared.message_id,
                    partition = result.partition,
                    offset = result.offset,
                    "Published detection message"
                );
            }
            Err(e) => {
                error!(line = line_no, error = %e, "Failed to publish detection message");
                skipped += 1;
            }
        }
    }

    Ok((sent, skipped))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = KafkaConfig::from_env()?;
    config.validate()?;
    info!(
        brokers = %config.bootstrap_servers,
        topic = %config.topics.detections,
        "Starting detection publisher"
    );

    let producer = QueueProducer::new(config)?;

    let (sent, skipped) = match std::env::args().nth(1) {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path))?;
            publish_lines(&producer, BufReader::new(file)).await?
        }
        None => publish_lines(&producer, BufReader::new(tokio::io::stdin())).await?,
    };

    producer.flush(std::time::Duration::from_secs(5))?;
    info!(sent = sent, skipped = skipped, "Publisher finished");

    Ok(())
}
