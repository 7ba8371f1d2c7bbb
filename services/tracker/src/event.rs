//! Detection messages: wire format, typed records and validation.

use crate::config::ValidationConfig;
use crate::error::ValidationError;
use base64::{engine::general_purpose::STANDARD, Engine};
use camtrack_pipeline::IncomingMessage;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Axis-aligned box in pixel coordinates, origin top-left
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One validated detection. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub message_id: String,
    /// Position within the source message
    pub detection_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
}

/// All detections of one queue message, validated
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    pub camera_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub frame_id: Option<i64>,
    pub detections: Vec<DetectionEvent>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    camera_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    frame_id: Option<i64>,
    #[serde(default, alias = "objects")]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    bbox: WireBox,
    #[serde(alias = "class")]
    class_name: String,
    confidence: f64,
    #[serde(default)]
    embedding: Option<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
struct WireBox {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireEmbedding {
    Vector(Vec<f64>),
    /// base64 of little-endian f32
    Encoded(String),
}

/// Turns raw queue payloads into validated [`DetectionBatch`]es
pub struct EventDecoder {
    config: ValidationConfig,
    known_cameras: HashSet<String>,
}

impl EventDecoder {
    pub fn new(config: ValidationConfig) -> Self {
        let known_cameras = config.known_cameras.iter().cloned().collect();
        Self {
            config,
            known_cameras,
        }
    }

    /// Decode a queue message, falling back to headers and broker time for
    /// fields the payload omits
    pub fn decode(
        &self,
        message: &IncomingMessage,
        now: DateTime<Utc>,
    ) -> Result<DetectionBatch, ValidationError> {
        self.decode_payload(
            &message.payload,
            message.message_id(),
            message.metadata.timestamp,
            now,
        )
    }

    pub fn decode_payload(
        &self,
        payload: &[u8],
        header_message_id: Option<&str>,
        broker_timestamp_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<DetectionBatch, ValidationError> {
        let wire: WireMessage = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let message_id = wire
            .message_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                header_message_id
                    .filter(|id| !id.trim().is_empty())
                    .map(str::to_string)
            })
            .ok_or(ValidationError::MissingMessageId)?;

        let camera_id = wire
            .camera_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ValidationError::MissingCameraId)?;
        if !self.known_cameras.is_empty() && !self.known_cameras.contains(&camera_id) {
            return Err(ValidationError::UnknownCamera(camera_id));
        }

        let timestamp = match wire.timestamp {
            Some(raw) => parse_timestamp(&raw)?,
            None => broker_timestamp_ms
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .ok_or(ValidationError::MissingTimestamp)?,
        };
        let skew = timestamp - now;
        if skew > self.config.max_future_skew() {
            return Err(ValidationError::FutureTimestamp {
                skew_ms: skew.num_milliseconds(),
            });
        }

        if wire.detections.len() > self.config.max_detections {
            return Err(ValidationError::TooManyDetections {
                count: wire.detections.len(),
                max: self.config.max_detections,
            });
        }

        let detections = wire
            .detections
            .into_iter()
            .enumerate()
            .map(|(index, detection)| {
                self.validate_detection(index, detection).map(|valid| DetectionEvent {
                    camera_id: camera_id.clone(),
                    timestamp,
                    bbox: valid.bbox,
                    class_name: valid.class_name,
                    confidence: valid.confidence,
                    embedding: valid.embedding,
                    message_id: message_id.clone(),
                    detection_index: index as u32,
                    frame_id: wire.frame_id,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DetectionBatch {
            camera_id,
            message_id,
            timestamp,
            frame_id: wire.frame_id,
            detections,
        })
    }

    fn validate_detection(
        &self,
        index: usize,
        detection: WireDetection,
    ) -> Result<ValidDetection, ValidationError> {
        let class_name = detection.class_name.trim().to_string();
        if class_name.is_empty() {
            return Err(ValidationError::MissingClassName { index });
        }

        if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence) {
            return Err(ValidationError::InvalidConfidence {
                index,
                value: detection.confidence,
            });
        }

        let bbox = self.validate_bbox(index, &detection.bbox)?;

        let embedding = match detection.embedding {
            Some(raw) => Some(self.validate_embedding(index, raw)?),
            None => None,
        };

        Ok(ValidDetection {
            bbox,
            class_name,
            confidence: detection.confidence as f32,
            embedding,
        })
    }

    fn validate_bbox(&self, index: usize, raw: &WireBox) -> Result<BoundingBox, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidBoundingBox {
            index,
            reason: reason.to_string(),
        };

        if ![raw.x, raw.y, raw.width, raw.height]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(invalid("non-finite coordinate"));
        }
        if raw.x < 0.0 || raw.y < 0.0 {
            return Err(invalid("negative origin"));
        }
        if raw.width <= 0.0 || raw.height <= 0.0 {
            return Err(invalid("non-positive size"));
        }
        if raw.x + raw.width > self.config.frame_width as f64
            || raw.y + raw.height > self.config.frame_height as f64
        {
            return Err(invalid("outside frame bounds"));
        }

        Ok(BoundingBox::new(
            raw.x as f32,
            raw.y as f32,
            raw.width as f32,
            raw.height as f32,
        ))
    }

    fn validate_embedding(
        &self,
        index: usize,
        raw: WireEmbedding,
    ) -> Result<Vec<f32>, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidEmbedding { index, reason };

        let values: Vec<f32> = match raw {
            WireEmbedding::Vector(values) => values.into_iter().map(|v| v as f32).collect(),
            WireEmbedding::Encoded(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| invalid(format!("bad base64: {}", e)))?;
                decode_f32_le(&bytes).ok_or_else(|| invalid("length not a multiple of 4".into()))?
            }
        };

        if values.is_empty() {
            return Err(invalid("empty".into()));
        }
        if values.len() > self.config.max_embedding_len {
            return Err(invalid(format!(
                "{} values exceed the limit of {}",
                values.len(),
                self.config.max_embedding_len
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(invalid("non-finite value".into()));
        }

        Ok(values)
    }
}

struct ValidDetection {
    bbox: BoundingBox,
    class_name: String,
    confidence: f32,
    embedding: Option<Vec<f32>>,
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| ValidationError::InvalidTimestamp(raw.to_string()))
}

/// Little-endian f32 decoding; `None` if the length is not a multiple of 4
pub fn decode_f32_le(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

pub fn encode_f32_le(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
