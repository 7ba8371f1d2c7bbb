//! Camtrack Tracker Service
//!
//! Turns a Kafka stream of per-frame object detections into persistent object
//! tracks and serves them live.
//!
//! ## Features
//!
//! - **Validation at the edge**: malformed or implausible messages are dropped
//!   and acknowledged, never retried
//! - **Per-camera lanes**: each camera's tracks are owned by one task, so
//!   cameras scale out while frames of one camera stay ordered
//! - **Idempotent persistence**: detections and versioned track records are
//!   keyed so redelivered messages insert nothing
//! - **Live fan-out**: WebSocket subscribers receive updates per camera and an
//!   explicit resync signal when they fall behind
//!
//! ## Architecture
//!
//! ```text
//! Kafka                  Lanes (one per camera)           PostgreSQL
//! ┌──────────────┐      ┌───────────────────────┐       ┌──────────────┐
//! │ detections   │─────▶│ Correlator            │──────▶│ detections   │
//! └──────────────┘      │  match / spawn / age  │       │ track_versions│
//!        ▲              │ FIFO write backlog    │       └──────────────┘
//!        │ commit       └───────────────────────┘
//!        │                         │
//! ┌──────────────┐                 ▼
//! │ Consumer     │          ┌──────────────┐        ┌──────────────┐
//! │ (manual ack) │          │ Broadcast    │───────▶│ WebSocket    │
//! └──────────────┘          │ Hub          │        │ clients      │
//!                           └──────────────┘        └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod correlator;
pub mod error;
pub mod event;
pub mod handler;
pub mod hub;
pub mod lanes;
pub mod records;
pub mod store;
pub mod writer;

pub use config::Config;
pub use correlator::{Correlation, Correlator, IngestOutcome, Track, TrackState};
pub use error::{
    CorrelationAmbiguity, FatalInternalError, PersistenceFailure, PipelineError, StoreError,
    TransientInfrastructureError, ValidationError,
};
pub use event::{BoundingBox, DetectionBatch, DetectionEvent, EventDecoder};
pub use handler::TrackingHandler;
pub use hub::{BroadcastHub, HubEvent};
pub use lanes::{LaneContext, LaneRouter};
pub use records::{DetectionRecord, TrackRecord, TrackUpdate, WriteBatch};
pub use store::{MemoryStore, PgTrackStore, TrackStore};
pub use writer::TrackWriter;
