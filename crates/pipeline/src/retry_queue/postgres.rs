//! Postgres-backed retry queue over the `retry_queue` table

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use super::RetryQueue;
use crate::error::{PipelineError, PipelineResult};
use crate::event::RetryEntry;

#[derive(Debug, sqlx::FromRow)]
struct RetryRow {
    event_id: String,
    event_type: String,
    attempt_number: i32,
    retry_at: OffsetDateTime,
    created_at: OffsetDateTime,
}

impl From<RetryRow> for RetryEntry {
    fn from(row: RetryRow) -> Self {
        RetryEntry {
            event_id: row.event_id,
            event_type: row.event_type,
            attempt_number: u32::try_from(row.attempt_number).unwrap_or(1),
            retry_at: row.retry_at,
            created_at: row.created_at,
        }
    }
}

fn db_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> PipelineError {
    move |e| {
        tracing::error!(operation = op, error = %e, "Retry queue query failed");
        PipelineError::Database(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PgRetryQueue {
    pool: PgPool,
}

impl PgRetryQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryQueue for PgRetryQueue {
    async fn schedule(&self, entry: RetryEntry) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_queue (event_id, event_type, attempt_number, retry_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                attempt_number = EXCLUDED.attempt_number,
                retry_at = EXCLUDED.retry_at,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&entry.event_id)
        .bind(&entry.event_type)
        .bind(i32::try_from(entry.attempt_number).unwrap_or(i32::MAX))
        .bind(entry.retry_at)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("schedule"))?;

        Ok(())
    }

    async fn claim_due(&self, now: OffsetDateTime, limit: i64) -> PipelineResult<Vec<RetryEntry>> {
        // Select and delete in one statement; SKIP LOCKED keeps concurrent
        // workers from blocking on (or double-claiming) the same rows.
        let rows: Vec<RetryRow> = sqlx::query_as(
            r#"
            DELETE FROM retry_queue
            WHERE event_id IN (
                SELECT event_id
                FROM retry_queue
                WHERE retry_at <= $1
                ORDER BY retry_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING event_id, event_type, attempt_number, retry_at, created_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("claim_due"))?;

        let mut entries: Vec<RetryEntry> = rows.into_iter().map(RetryEntry::from).collect();
        entries.sort_by(|a, b| a.retry_at.cmp(&b.retry_at));
        Ok(entries)
    }

    async fn get(&self, event_id: &str) -> PipelineResult<Option<RetryEntry>> {
        let row: Option<RetryRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, attempt_number, retry_at, created_at
            FROM retry_queue
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get"))?;

        Ok(row.map(RetryEntry::from))
    }

    async fn cancel(&self, event_id: &str) -> PipelineResult<bool> {
        let result = sqlx::query("DELETE FROM retry_queue WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("cancel"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> PipelineResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*)::BIGINT FROM retry_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count"))?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    //! Run against a real database when `DATABASE_URL` is set; skipped otherwise.

    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::{EventLedger, PgEventLedger};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_pool() -> Option<PgPool> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set - skipping Postgres retry queue test");
            return None;
        };
        let pool = eventgate_shared::create_pool(&url, 5).await.unwrap();
        eventgate_shared::run_migrations(&pool).await.unwrap();
        Some(pool)
    }

    /// Ledger row plus an entry due at the Unix epoch, so no real retry is ever older
    async fn seed(pool: &PgPool, queue: &PgRetryQueue, id: &str) {
        PgEventLedger::new(pool.clone(), Arc::new(ManualClock::default()))
            .record_received(id, "charge", &json!({}))
            .await
            .unwrap();
        queue
            .schedule(RetryEntry {
                event_id: id.to_string(),
                event_type: "charge".to_string(),
                attempt_number: 2,
                retry_at: OffsetDateTime::UNIX_EPOCH,
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_schedule_upserts_and_cancel_removes() {
        let Some(pool) = test_pool().await else { return };
        let queue = PgRetryQueue::new(pool.clone());
        let id = format!("pg_q_{}", OffsetDateTime::now_utc().unix_timestamp_nanos());
        seed(&pool, &queue, &id).await;

        let later = RetryEntry {
            event_id: id.clone(),
            event_type: "charge".to_string(),
            attempt_number: 3,
            retry_at: OffsetDateTime::UNIX_EPOCH + Duration::from_secs(2),
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::from_secs(1),
        };
        queue.schedule(later.clone()).await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap(), Some(later));

        assert!(queue.cancel(&id).await.unwrap());
        assert!(!queue.cancel(&id).await.unwrap());
        assert!(queue.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claim_due_never_duplicates() {
        let Some(pool) = test_pool().await else { return };
        let queue = Arc::new(PgRetryQueue::new(pool.clone()));
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let ids: Vec<String> = (0..12).map(|i| format!("pg_due_{}_{}", stamp, i)).collect();
        for id in &ids {
            seed(&pool, &queue, id).await;
        }

        let mut handles = vec![];
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .claim_due(OffsetDateTime::UNIX_EPOCH, 100)
                    .await
                    .unwrap()
            }));
        }

        let ours: HashSet<&String> = ids.iter().collect();
        let mut claimed = vec![];
        for handle in handles {
            for entry in handle.await.unwrap() {
                if ours.contains(&entry.event_id) {
                    claimed.push(entry.event_id);
                }
            }
        }

        let unique: HashSet<&String> = claimed.iter().collect();
        assert_eq!(claimed.len(), ids.len(), "each entry claimed exactly once");
        assert_eq!(unique.len(), ids.len());
        for id in &ids {
            assert!(queue.get(id).await.unwrap().is_none());
        }
    }
}
