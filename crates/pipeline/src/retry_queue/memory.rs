//! In-memory retry queue for tests and local development

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use super::RetryQueue;
use crate::error::PipelineResult;
use crate::event::RetryEntry;

#[derive(Debug, Clone, Default)]
pub struct InMemoryRetryQueue {
    entries: Arc<Mutex<HashMap<String, RetryEntry>>>,
}

impl InMemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RetryEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
    async fn schedule(&self, entry: RetryEntry) -> PipelineResult<()> {
        self.entries().insert(entry.event_id.clone(), entry);
        Ok(())
    }

    async fn claim_due(&self, now: OffsetDateTime, limit: i64) -> PipelineResult<Vec<RetryEntry>> {
        let mut entries = self.entries();

        let mut due: Vec<(OffsetDateTime, String)> = entries
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| (e.retry_at, e.event_id.clone()))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        Ok(due
            .into_iter()
            .filter_map(|(_, id)| entries.remove(&id))
            .collect())
    }

    async fn get(&self, event_id: &str) -> PipelineResult<Option<RetryEntry>> {
        Ok(self.entries().get(event_id).cloned())
    }

    async fn cancel(&self, event_id: &str) -> PipelineResult<bool> {
        Ok(self.entries().remove(event_id).is_some())
    }

    async fn count(&self) -> PipelineResult<i64> {
        Ok(self.entries().len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(id: &str, retry_at: OffsetDateTime) -> RetryEntry {
        RetryEntry {
            event_id: id.to_string(),
            event_type: "charge".to_string(),
            attempt_number: 2,
            retry_at,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_schedule_replaces_pending_entry() {
        let queue = InMemoryRetryQueue::new();
        let t0 = OffsetDateTime::UNIX_EPOCH + Duration::from_secs(100);

        queue.schedule(entry("evt", t0)).await.unwrap();
        let mut later = entry("evt", t0 + Duration::from_secs(5));
        later.attempt_number = 3;
        queue.schedule(later.clone()).await.unwrap();

        assert_eq!(queue.count().await.unwrap(), 1);
        assert_eq!(queue.get("evt").await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn test_claim_due_removes_only_due_entries_in_order() {
        let queue = InMemoryRetryQueue::new();
        let t0 = OffsetDateTime::UNIX_EPOCH + Duration::from_secs(100);

        queue.schedule(entry("late", t0 + Duration::from_secs(10))).await.unwrap();
        queue.schedule(entry("second", t0)).await.unwrap();
        queue.schedule(entry("first", t0 - Duration::from_secs(1))).await.unwrap();

        let claimed = queue.claim_due(t0, 10).await.unwrap();
        assert_eq!(
            claimed.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>(),
            ["first", "second"]
        );
        assert!(queue.claim_due(t0, 10).await.unwrap().is_empty());
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_due_respects_limit() {
        let queue = InMemoryRetryQueue::new();
        let t0 = OffsetDateTime::UNIX_EPOCH + Duration::from_secs(100);
        for i in 0..5 {
            queue.schedule(entry(&format!("e{}", i), t0)).await.unwrap();
        }

        assert_eq!(queue.claim_due(t0, 2).await.unwrap().len(), 2);
        assert_eq!(queue.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_an_entry() {
        use tokio::sync::Barrier;

        let queue = InMemoryRetryQueue::new();
        let t0 = OffsetDateTime::UNIX_EPOCH + Duration::from_secs(100);
        for i in 0..20 {
            queue.schedule(entry(&format!("e{}", i), t0)).await.unwrap();
        }

        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];
        for _ in 0..4 {
            let queue = queue.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                queue.claim_due(t0, 20).await.unwrap()
            }));
        }

        let mut claimed = vec![];
        for handle in handles {
            claimed.extend(handle.await.unwrap());
        }
        let total = claimed.len();
        claimed.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        claimed.dedup_by(|a, b| a.event_id == b.event_id);
        assert_eq!(total, 20, "every entry claimed exactly once");
        assert_eq!(claimed.len(), 20);
    }

    #[tokio::test]
    async fn test_cancel() {
        let queue = InMemoryRetryQueue::new();
        queue.schedule(entry("evt", OffsetDateTime::UNIX_EPOCH)).await.unwrap();

        assert!(queue.cancel("evt").await.unwrap());
        assert!(!queue.cancel("evt").await.unwrap());
    }
}
