//! In-memory ledger for tests and local development

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use super::EventLedger;
use crate::clock::Clock;
use crate::error::{PipelineError, PipelineResult};
use crate::event::{Event, EventStatus, LedgerStats};

/// Each operation runs inside one critical section, which gives `try_claim`
/// the same all-or-nothing behavior as the conditional UPDATE in Postgres.
#[derive(Debug, Clone)]
pub struct InMemoryEventLedger {
    events: Arc<Mutex<HashMap<String, Event>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn events(&self) -> MutexGuard<'_, HashMap<String, Event>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn processing_row<'a>(
        events: &'a mut HashMap<String, Event>,
        id: &str,
    ) -> PipelineResult<&'a mut Event> {
        events
            .get_mut(id)
            .filter(|e| e.status == EventStatus::Processing)
            .ok_or_else(|| PipelineError::NotFound(format!("Event {} is not processing", id)))
    }
}

#[async_trait]
impl EventLedger for InMemoryEventLedger {
    async fn lookup(&self, id: &str) -> PipelineResult<Option<Event>> {
        Ok(self.events().get(id).cloned())
    }

    async fn record_received(
        &self,
        id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> PipelineResult<Event> {
        let now = self.clock.now();
        let mut events = self.events();
        let event = events.entry(id.to_string()).or_insert_with(|| Event {
            id: id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            status: EventStatus::Received,
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            processed_at: None,
        });
        Ok(event.clone())
    }

    async fn try_claim(&self, id: &str, max_attempts: u32) -> PipelineResult<bool> {
        let now = self.clock.now();
        let mut events = self.events();
        let Some(event) = events.get_mut(id) else {
            return Ok(false);
        };

        let claimable = match event.status {
            EventStatus::Received | EventStatus::Failed => event.attempts < max_attempts,
            EventStatus::Processing | EventStatus::Processed => false,
        };
        if claimable {
            event.status = EventStatus::Processing;
            event.processing_started_at = Some(now);
            event.updated_at = now;
        }
        Ok(claimable)
    }

    async fn mark_processed(&self, id: &str) -> PipelineResult<()> {
        let now = self.clock.now();
        let mut events = self.events();
        let event = Self::processing_row(&mut events, id)?;
        event.status = EventStatus::Processed;
        event.processed_at = Some(now);
        event.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error_message: &str) -> PipelineResult<u32> {
        let now = self.clock.now();
        let mut events = self.events();
        let event = Self::processing_row(&mut events, id)?;
        event.status = EventStatus::Failed;
        event.attempts += 1;
        event.error_message = Some(error_message.to_string());
        event.updated_at = now;
        Ok(event.attempts)
    }

    async fn mark_dead_lettered(
        &self,
        id: &str,
        error_message: &str,
        max_attempts: u32,
    ) -> PipelineResult<u32> {
        let now = self.clock.now();
        let mut events = self.events();
        let event = Self::processing_row(&mut events, id)?;
        event.status = EventStatus::Failed;
        event.attempts = (event.attempts + 1).max(max_attempts);
        event.error_message = Some(error_message.to_string());
        event.updated_at = now;
        Ok(event.attempts)
    }

    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> PipelineResult<Vec<Event>> {
        let mut rows: Vec<Event> = self
            .events()
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_retriable_failures(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let mut rows: Vec<Event> = self
            .events()
            .values()
            .filter(|e| e.status == EventStatus::Failed && e.attempts < max_attempts)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_stale_processing(
        &self,
        claimed_before: OffsetDateTime,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let mut rows: Vec<Event> = self
            .events()
            .values()
            .filter(|e| {
                e.status == EventStatus::Processing
                    && e.processing_started_at
                        .map_or(true, |started| started < claimed_before)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.processing_started_at
                .cmp(&b.processing_started_at)
                .then(a.id.cmp(&b.id))
        });
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn fail_stale_claim(
        &self,
        id: &str,
        claimed_before: OffsetDateTime,
        error_message: &str,
    ) -> PipelineResult<Option<u32>> {
        let now = self.clock.now();
        let mut events = self.events();
        let Some(event) = events.get_mut(id).filter(|e| {
            e.status == EventStatus::Processing
                && e.processing_started_at
                    .map_or(true, |started| started < claimed_before)
        }) else {
            return Ok(None);
        };
        event.status = EventStatus::Failed;
        event.attempts += 1;
        event.error_message = Some(error_message.to_string());
        event.updated_at = now;
        Ok(Some(event.attempts))
    }

    async fn list_unclaimed(
        &self,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let mut rows: Vec<Event> = self
            .events()
            .values()
            .filter(|e| e.status == EventStatus::Received && e.created_at < received_before)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn stats_since(
        &self,
        since: OffsetDateTime,
        max_attempts: u32,
    ) -> PipelineResult<LedgerStats> {
        let events = self.events();
        let mut stats = LedgerStats::default();
        for event in events.values().filter(|e| e.created_at >= since) {
            stats.total_seen += 1;
            match event.status {
                EventStatus::Processed => stats.processed += 1,
                EventStatus::Processing => stats.processing += 1,
                EventStatus::Failed if event.attempts >= max_attempts => stats.dead_lettered += 1,
                EventStatus::Failed => stats.failed_retrying += 1,
                EventStatus::Received => {}
            }
        }
        Ok(stats)
    }
}
