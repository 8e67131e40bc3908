//! Postgres-backed ledger over the `events` table

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use super::EventLedger;
use crate::clock::Clock;
use crate::error::{PipelineError, PipelineResult};
use crate::event::{Event, EventStatus, LedgerStats};

const EVENT_COLUMNS: &str = "id, event_type, payload, status, attempts, error_message, \
     created_at, updated_at, processing_started_at, processed_at";

/// Raw `events` row
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    error_message: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    processing_started_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<EventRow> for Event {
    type Error = PipelineError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            id: row.id,
            event_type: row.event_type,
            payload: row.payload,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    total_seen: i64,
    processed: i64,
    processing: i64,
    failed_retrying: i64,
    dead_lettered: i64,
}

fn db_err<'a>(
    op: &'static str,
    id: Option<&'a str>,
) -> impl FnOnce(sqlx::Error) -> PipelineError + 'a {
    move |e| {
        tracing::error!(
            operation = op,
            event_id = id.unwrap_or(""),
            error = %e,
            "Event ledger query failed"
        );
        PipelineError::Database(e.to_string())
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone)]
pub struct PgEventLedger {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgEventLedger {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    fn rows_into_events(rows: Vec<EventRow>) -> PipelineResult<Vec<Event>> {
        rows.into_iter().map(Event::try_from).collect()
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
    async fn lookup(&self, id: &str) -> PipelineResult<Option<Event>> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {} FROM events WHERE id = $1", EVENT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("lookup", Some(id)))?;

        row.map(Event::try_from).transpose()
    }

    async fn record_received(
        &self,
        id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> PipelineResult<Event> {
        let now = self.clock.now();

        // DO NOTHING leaves an existing row untouched; the follow-up read returns it
        let inserted = sqlx::query(
            r#"
            INSERT INTO events (id, event_type, payload, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, 'received', 0, $4, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(event_type)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("record_received", Some(id)))?;

        if inserted.rows_affected() == 0 {
            tracing::debug!(event_id = %id, "Event already recorded");
        }

        self.lookup(id).await?.ok_or_else(|| {
            PipelineError::NotFound(format!("Event {} missing after insert", id))
        })
    }

    async fn try_claim(&self, id: &str, max_attempts: u32) -> PipelineResult<bool> {
        let now = self.clock.now();

        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'processing',
                processing_started_at = $2,
                updated_at = $2
            WHERE id = $1
              AND status IN ('received', 'failed')
              AND attempts < $3
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(to_i32(max_attempts))
        .execute(&self.pool)
        .await
        .map_err(db_err("try_claim", Some(id)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, id: &str) -> PipelineResult<()> {
        let now = self.clock.now();

        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'processed',
                processed_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("mark_processed", Some(id)))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!(
                "Event {} is not processing",
                id
            )));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error_message: &str) -> PipelineResult<u32> {
        let now = self.clock.now();

        let attempts: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE events
            SET status = 'failed',
                attempts = attempts + 1,
                error_message = $2,
                updated_at = $3
            WHERE id = $1 AND status = 'processing'
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("mark_failed", Some(id)))?;

        attempts
            .map(|(n,)| u32::try_from(n).unwrap_or(0))
            .ok_or_else(|| PipelineError::NotFound(format!("Event {} is not processing", id)))
    }

    async fn mark_dead_lettered(
        &self,
        id: &str,
        error_message: &str,
        max_attempts: u32,
    ) -> PipelineResult<u32> {
        let now = self.clock.now();

        let attempts: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE events
            SET status = 'failed',
                attempts = GREATEST(attempts + 1, $3),
                error_message = $2,
                updated_at = $4
            WHERE id = $1 AND status = 'processing'
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(to_i32(max_attempts))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("mark_dead_lettered", Some(id)))?;

        attempts
            .map(|(n,)| u32::try_from(n).unwrap_or(0))
            .ok_or_else(|| PipelineError::NotFound(format!("Event {} is not processing", id)))
    }

    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> PipelineResult<Vec<Event>> {
        let rows: Vec<EventRow> = match status {
            Some(status) => sqlx::query_as(&format!(
                r#"
                SELECT {}
                FROM events
                WHERE status = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2 OFFSET $3
                "#,
                EVENT_COLUMNS
            ))
            .bind(status.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list", None))?,
            None => sqlx::query_as(&format!(
                r#"
                SELECT {}
                FROM events
                ORDER BY created_at DESC, id DESC
                LIMIT $1 OFFSET $2
                "#,
                EVENT_COLUMNS
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list", None))?,
        };

        Self::rows_into_events(rows)
    }

    async fn list_retriable_failures(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE status = 'failed' AND attempts < $1
            ORDER BY updated_at ASC, id ASC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(to_i32(max_attempts))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_retriable_failures", None))?;

        Self::rows_into_events(rows)
    }

    async fn list_stale_processing(
        &self,
        claimed_before: OffsetDateTime,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE status = 'processing'
              AND (processing_started_at IS NULL OR processing_started_at < $1)
            ORDER BY processing_started_at ASC NULLS FIRST, id ASC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(claimed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_stale_processing", None))?;

        Self::rows_into_events(rows)
    }

    async fn fail_stale_claim(
        &self,
        id: &str,
        claimed_before: OffsetDateTime,
        error_message: &str,
    ) -> PipelineResult<Option<u32>> {
        let now = self.clock.now();

        // The claim-time condition keeps a claim re-taken since the listing out of reach
        let attempts: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE events
            SET status = 'failed',
                attempts = attempts + 1,
                error_message = $3,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND (processing_started_at IS NULL OR processing_started_at < $2)
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(claimed_before)
        .bind(error_message)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("fail_stale_claim", Some(id)))?;

        Ok(attempts.map(|(n,)| u32::try_from(n).unwrap_or(0)))
    }

    async fn list_unclaimed(
        &self,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE status = 'received' AND created_at < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(received_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_unclaimed", None))?;

        Self::rows_into_events(rows)
    }

    async fn stats_since(
        &self,
        since: OffsetDateTime,
        max_attempts: u32,
    ) -> PipelineResult<LedgerStats> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)::BIGINT AS total_seen,
                COUNT(*) FILTER (WHERE status = 'processed')::BIGINT AS processed,
                COUNT(*) FILTER (WHERE status = 'processing')::BIGINT AS processing,
                COUNT(*) FILTER (WHERE status = 'failed' AND attempts < $2)::BIGINT AS failed_retrying,
                COUNT(*) FILTER (WHERE status = 'failed' AND attempts >= $2)::BIGINT AS dead_lettered
            FROM events
            WHERE created_at >= $1
            "#,
        )
        .bind(since)
        .bind(to_i32(max_attempts))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("stats_since", None))?;

        Ok(LedgerStats {
            total_seen: row.total_seen,
            processed: row.processed,
            processing: row.processing,
            failed_retrying: row.failed_retrying,
            dead_lettered: row.dead_lettered,
        })
    }
}

#[cfg(test)]
mod tests {
    //! Run against a real database when `DATABASE_URL` is set; skipped otherwise.

    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    async fn test_pool() -> Option<PgPool> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set - skipping Postgres ledger test");
            return None;
        };
        let pool = eventgate_shared::create_pool(&url, 5).await.unwrap();
        eventgate_shared::run_migrations(&pool).await.unwrap();
        Some(pool)
    }

    fn unique_id(prefix: &str) -> String {
        format!("{}_{}", prefix, OffsetDateTime::now_utc().unix_timestamp_nanos())
    }

    #[tokio::test]
    async fn test_record_received_keeps_first_row() {
        let Some(pool) = test_pool().await else { return };
        let ledger = PgEventLedger::new(pool, Arc::new(ManualClock::default()));
        let id = unique_id("pg_recv");

        let first = ledger
            .record_received(&id, "invoice.paid", &json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(first.status, EventStatus::Received);

        let again = ledger
            .record_received(&id, "other", &json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(again.event_type, "invoice.paid");
        assert_eq!(again.payload, json!({"n": 1}));
        assert_eq!(again.attempts, 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let Some(pool) = test_pool().await else { return };
        let ledger = Arc::new(PgEventLedger::new(pool, Arc::new(ManualClock::default())));
        let id = unique_id("pg_claim");
        ledger.record_received(&id, "charge", &json!({})).await.unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let ledger = ledger.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { ledger.try_claim(&id, 3).await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        assert_eq!(ledger.mark_failed(&id, "boom").await.unwrap(), 1);
        assert!(ledger.try_claim(&id, 3).await.unwrap());
        assert!(!ledger.try_claim(&id, 3).await.unwrap());
        ledger.mark_processed(&id).await.unwrap();
        assert!(matches!(
            ledger.mark_processed(&id).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_stale_claim_respects_claim_time() {
        let Some(pool) = test_pool().await else { return };
        let clock = Arc::new(ManualClock::default());
        let ledger = PgEventLedger::new(pool, clock.clone());
        let id = unique_id("pg_stale");
        ledger.record_received(&id, "charge", &json!({})).await.unwrap();
        ledger.try_claim(&id, 3).await.unwrap();

        let cutoff = clock.now();
        clock.advance(Duration::from_secs(60));
        ledger.mark_failed(&id, "boom").await.unwrap();
        ledger.try_claim(&id, 3).await.unwrap();

        assert_eq!(
            ledger.fail_stale_claim(&id, cutoff, "processing timed out").await.unwrap(),
            None
        );
        assert_eq!(
            ledger
                .fail_stale_claim(&id, clock.now() + Duration::from_secs(1), "processing timed out")
                .await
                .unwrap(),
            Some(2)
        );
    }
}
