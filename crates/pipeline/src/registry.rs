//! Handler registry
//!
//! Maps an event type string to the handler that applies its business effect.
//! Populated once at startup; adding an event type is a `register` call.
//!
//! Handlers should be safe to run more than once for logically equivalent
//! events. The ledger only stops literal redelivery of the same event id, not
//! two different events (say `invoice.paid` and `customer.subscription.updated`)
//! that cause the same state change.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::event::Event;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking an owned [`Event`] as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any earlier registration
    pub fn register<H>(&mut self, event_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: EventHandler + 'static,
    {
        self.register_arc(event_type, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            tracing::warn!(
                event_type = %event_type,
                "Replaced previously registered handler"
            );
        }
        self
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry
            .register("invoice.paid", handler_fn(|_| async { Ok(()) }))
            .register("charge.refunded", handler_fn(|_| async { Ok(()) }));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("invoice.paid"));
        assert!(registry.get("ping").is_none());
        assert_eq!(registry.event_types(), ["charge.refunded", "invoice.paid"]);
    }

    #[tokio::test]
    async fn test_later_registration_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        let counter = first.clone();
        registry.register(
            "charge",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let counter = second.clone();
        registry.register(
            "charge",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let event = Event {
            id: "evt".to_string(),
            event_type: "charge".to_string(),
            payload: serde_json::json!({}),
            status: crate::event::EventStatus::Processing,
            attempts: 0,
            error_message: None,
            created_at: time::OffsetDateTime::UNIX_EPOCH,
            updated_at: time::OffsetDateTime::UNIX_EPOCH,
            processing_started_at: None,
            processed_at: None,
        };
        registry.get("charge").unwrap().handle(&event).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
