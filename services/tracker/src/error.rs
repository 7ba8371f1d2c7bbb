//! Error taxonomy for the tracking pipeline.
//!
//! Each class maps to one acknowledgment decision: validation errors are
//! dropped and acknowledged, transient and persistence failures leave the
//! message unacknowledged, ambiguities are only logged and counted, and fatal
//! errors poison the affected camera lane.

use thiserror::Error;

/// A message that can never be processed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("missing message id")]
    MissingMessageId,

    #[error("missing camera id")]
    MissingCameraId,

    #[error("unknown camera {0}")]
    UnknownCamera(String),

    #[error("missing timestamp")]
    MissingTimestamp,

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("timestamp {skew_ms}ms in the future")]
    FutureTimestamp { skew_ms: i64 },

    #[error("{count} detections exceed the limit of {max}")]
    TooManyDetections { count: usize, max: usize },

    #[error("detection {index}: confidence {value} outside [0, 1]")]
    InvalidConfidence { index: usize, value: f64 },

    #[error("detection {index}: invalid bounding box ({reason})")]
    InvalidBoundingBox { index: usize, reason: String },

    #[error("detection {index}: missing class name")]
    MissingClassName { index: usize },

    #[error("detection {index}: invalid embedding ({reason})")]
    InvalidEmbedding { index: usize, reason: String },
}

/// Broker or storage connectivity problem expected to clear up on its own
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransientInfrastructureError {
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("broker unavailable: {0}")]
    Broker(String),
}

/// Errors returned by a track store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error(transparent)]
    Transient(#[from] TransientInfrastructureError),

    #[error("storage rejected the operation: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        StoreError::Transient(TransientInfrastructureError::Storage(message.into()))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => StoreError::transient(error.to_string()),
            sqlx::Error::Database(db) => {
                // Class 08 (connection), 40 (rollback), 53 (resources), 57 (operator)
                let transient = db
                    .code()
                    .map(|code| {
                        code.starts_with("08")
                            || code.starts_with("40")
                            || code.starts_with("53")
                            || code.starts_with("57")
                    })
                    .unwrap_or(false);
                if transient {
                    StoreError::transient(error.to_string())
                } else {
                    StoreError::Permanent(error.to_string())
                }
            }
            _ => StoreError::Permanent(error.to_string()),
        }
    }
}

/// A write batch could not be stored; the message stays unacknowledged
#[derive(Error, Debug, Clone, PartialEq)]
#[error("persistence failed after {attempts} attempt(s): {source}")]
pub struct PersistenceFailure {
    pub attempts: u32,
    #[source]
    pub source: StoreError,
}

/// Two candidate tracks were within the tie margin for one detection
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "ambiguous association for detection {detection_index}: track {chosen} \
     (cost {chosen_cost:.3}) over track {rival} (cost {rival_cost:.3})"
)]
pub struct CorrelationAmbiguity {
    pub detection_index: usize,
    pub chosen: u64,
    pub chosen_cost: f32,
    pub rival: u64,
    pub rival_cost: f32,
}

/// An internal invariant was broken; the lane stops accepting work
#[derive(Error, Debug, Clone, PartialEq)]
#[error("internal invariant violated: {0}")]
pub struct FatalInternalError(pub String);

/// Anything that prevents a message from being acknowledged
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transient(#[from] TransientInfrastructureError),

    #[error(transparent)]
    Persistence(#[from] PersistenceFailure),

    #[error(transparent)]
    Fatal(#[from] FatalInternalError),

    #[error("lane for camera {0} is unavailable")]
    LaneUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let error: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(error.is_transient());
    }

    #[test]
    fn test_row_not_found_is_permanent() {
        let error: StoreError = sqlx::Error::RowNotFound.into();
        assert!(!error.is_transient());
    }

    #[test]
    fn test_persistence_failure_message() {
        let failure = PersistenceFailure {
            attempts: 3,
            source: StoreError::transient("connection refused"),
        };
        assert_eq!(
            failure.to_string(),
            "persistence failed after 3 attempt(s): storage unavailable: connection refused"
        );
    }
}
