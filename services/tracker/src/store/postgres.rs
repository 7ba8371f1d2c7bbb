use super::{PurgeSummary, TrackStore, WriteSummary};
use crate::config::DatabaseConfig;
use crate::correlator::TrackState;
use crate::error::StoreError;
use crate::event::{encode_f32_le, BoundingBox};
use crate::records::{PathPoint, TrackPath, TrackRecord, WriteBatch};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Row shape of `track_versions`
#[derive(Debug, FromRow)]
struct TrackVersionRow {
    camera_id: String,
    track_id: i64,
    version: i64,
    prev_version: Option<i64>,
    state: String,
    class_name: String,
    bbox_x: f32,
    bbox_y: f32,
    bbox_width: f32,
    bbox_height: f32,
    confidence: f32,
    velocity_x: f32,
    velocity_y: f32,
    hits: i32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    message_id: Option<String>,
}

impl TryFrom<TrackVersionRow> for TrackRecord {
    type Error = StoreError;

    fn try_from(row: TrackVersionRow) -> Result<Self, Self::Error> {
        let state: TrackState = row.state.parse().map_err(StoreError::Permanent)?;
        Ok(TrackRecord {
            camera_id: row.camera_id,
            track_id: row.track_id as u64,
            version: row.version as u64,
            prev_version: row.prev_version.map(|v| v as u64),
            state,
            class_name: row.class_name,
            bbox: BoundingBox::new(row.bbox_x, row.bbox_y, row.bbox_width, row.bbox_height),
            confidence: row.confidence,
            velocity_x: row.velocity_x,
            velocity_y: row.velocity_y,
            hits: row.hits.max(0) as u32,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            updated_at: row.updated_at,
            message_id: row.message_id,
        })
    }
}

/// Detection columns needed for a track path
#[derive(Debug, FromRow)]
struct PathRow {
    class_name: String,
    observed_at: DateTime<Utc>,
    confidence: f32,
    bbox_x: f32,
    bbox_y: f32,
    bbox_width: f32,
    bbox_height: f32,
}

/// PostgreSQL-backed track store
pub struct PgTrackStore {
    pool: PgPool,
}

impl PgTrackStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl TrackStore for PgTrackStore {
    #[instrument(skip(self, batch), fields(camera_id = %batch.camera_id, message_id = ?batch.message_id))]
    async fn write_batch(&self, batch: &WriteBatch) -> Result<WriteSummary, StoreError> {
        let mut summary = WriteSummary::default();
        let mut tx = self.pool.begin().await?;

        for record in &batch.detections {
            let detection = &record.detection;
            let embedding = detection.embedding.as_deref().map(encode_f32_le);

            let result = sqlx::query(
                r#"
                INSERT INTO detections (
                    message_id, detection_index, camera_id, observed_at, frame_id,
                    class_name, confidence, bbox_x, bbox_y, bbox_width, bbox_height,
                    embedding, track_id
                ) VALUES (
                    $1, $2, $3, $4, $5,
                    $6, $7, $8, $9, $10, $11,
                    $12, $13
                )
                ON CONFLICT (camera_id, message_id, detection_index) DO NOTHING
                "#,
            )
            .bind(&detection.message_id)
            .bind(detection.detection_index as i32)
            .bind(&detection.camera_id)
            .bind(detection.timestamp)
            .bind(detection.frame_id)
            .bind(&detection.class_name)
            .bind(detection.confidence)
            .bind(detection.bbox.x)
            .bind(detection.bbox.y)
            .bind(detection.bbox.width)
            .bind(detection.bbox.height)
            .bind(embedding)
            .bind(record.track_id as i64)
            .execute(&mut *tx)
            .await?;

            summary.detections += result.rows_affected();
        }

        for track in &batch.tracks {
            let result = sqlx::query(
                r#"
                INSERT INTO track_versions (
                    camera_id, track_id, version, prev_version, state,
                    class_name, bbox_x, bbox_y, bbox_width, bbox_height,
                    confidence, velocity_x, velocity_y, hits,
                    first_seen, last_seen, updated_at, message_id
                ) VALUES (
                    $1, $2, $3, $4, $5,
                    $6, $7, $8, $9, $10,
                    $11, $12, $13, $14,
                    $15, $16, $17, $18
                )
                ON CONFLICT (camera_id, track_id, version) DO NOTHING
                "#,
            )
            .bind(&track.camera_id)
            .bind(track.track_id as i64)
            .bind(track.version as i64)
            .bind(track.prev_version.map(|v| v as i64))
            .bind(track.state.as_str())
            .bind(&track.class_name)
            .bind(track.bbox.x)
            .bind(track.bbox.y)
            .bind(track.bbox.width)
            .bind(track.bbox.height)
            .bind(track.confidence)
            .bind(track.velocity_x)
            .bind(track.velocity_y)
            .bind(track.hits as i32)
            .bind(track.first_seen)
            .bind(track.last_seen)
            .bind(track.updated_at)
            .bind(&track.message_id)
            .execute(&mut *tx)
            .await?;

            summary.track_versions += result.rows_affected();
        }

        tx.commit().await?;

        debug!(
            detections = summary.detections,
            track_versions = summary.track_versions,
            "Write batch committed"
        );

        Ok(summary)
    }

    async fn max_track_id(&self, camera_id: &str) -> Result<Option<u64>, StoreError> {
        let max: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(track_id) FROM track_versions WHERE camera_id = $1")
                .bind(camera_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(max.0.map(|id| id as u64))
    }

    #[instrument(skip(self))]
    async fn recent_message_ids(
        &self,
        camera_id: &str,
        window: chrono::Duration,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            WITH seen AS (
                SELECT message_id, observed_at AS applied_at
                FROM detections
                WHERE camera_id = $1
                UNION ALL
                SELECT message_id, updated_at
                FROM track_versions
                WHERE camera_id = $1 AND message_id IS NOT NULL
            ),
            firsts AS (
                SELECT message_id, MIN(applied_at) AS applied_at
                FROM seen
                GROUP BY message_id
            )
            SELECT message_id, applied_at
            FROM firsts
            WHERE applied_at >= (SELECT MAX(applied_at) FROM firsts)
                                - $2::DOUBLE PRECISION * INTERVAL '1 second'
            ORDER BY applied_at ASC, message_id ASC
            "#,
        )
        .bind(camera_id)
        .bind(window.num_milliseconds() as f64 / 1000.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn track_history(
        &self,
        camera_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TrackRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TrackVersionRow>(
            r#"
            SELECT camera_id, track_id, version, prev_version, state,
                   class_name, bbox_x, bbox_y, bbox_width, bbox_height,
                   confidence, velocity_x, velocity_y, hits,
                   first_seen, last_seen, updated_at, message_id
            FROM track_versions
            WHERE camera_id = $1
              AND updated_at >= $2
              AND updated_at < $3
            ORDER BY updated_at ASC, track_id ASC, version ASC
            LIMIT $4
            "#,
        )
        .bind(camera_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TrackRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn track_path(
        &self,
        camera_id: &str,
        track_id: u64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Option<TrackPath>, StoreError> {
        let rows = sqlx::query_as::<_, PathRow>(
            r#"
            SELECT class_name, observed_at, confidence,
                   bbox_x, bbox_y, bbox_width, bbox_height
            FROM detections
            WHERE camera_id = $1
              AND track_id = $2
              AND ($3::TIMESTAMPTZ IS NULL OR observed_at >= $3)
              AND ($4::TIMESTAMPTZ IS NULL OR observed_at <= $4)
            ORDER BY observed_at ASC, message_id ASC, detection_index ASC
            "#,
        )
        .bind(camera_id)
        .bind(track_id as i64)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let Some(class_name) = rows.first().map(|row| row.class_name.clone()) else {
            return Ok(None);
        };
        let points = rows
            .into_iter()
            .map(|row| {
                let (x, y) =
                    BoundingBox::new(row.bbox_x, row.bbox_y, row.bbox_width, row.bbox_height)
                        .center();
                PathPoint {
                    x,
                    y,
                    timestamp: row.observed_at,
                    confidence: row.confidence,
                }
            })
            .collect();

        Ok(TrackPath::from_points(camera_id, track_id, class_name, points))
    }

    #[instrument(skip(self))]
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeSummary, StoreError> {
        let mut tx = self.pool.begin().await?;

        let detections = sqlx::query("DELETE FROM detections WHERE observed_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // The highest track id per camera survives so id seeding stays correct
        let track_versions = sqlx::query(
            r#"
            DELETE FROM track_versions tv
            WHERE tv.updated_at < $1
              AND tv.track_id < (
                  SELECT MAX(m.track_id) FROM track_versions m
                  WHERE m.camera_id = tv.camera_id
              )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(
            detections = detections,
            track_versions = track_versions,
            "Purged rows older than {}",
            cutoff
        );

        Ok(PurgeSummary {
            detections,
            track_versions,
        })
    }

    async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
