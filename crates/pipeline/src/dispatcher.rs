//! Dispatcher
//!
//! Looks up the handler for an event's type and runs it. A panicking handler is
//! turned into a retryable [`HandlerError::Panicked`] so one bad handler cannot
//! take the pipeline down.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::error::HandlerError;
use crate::event::Event;
use crate::registry::HandlerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran and succeeded
    Handled,
    /// No handler is registered for the type; acknowledged as a no-op
    Unhandled,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, event: &Event) -> Result<DispatchOutcome, HandlerError> {
        let Some(handler) = self.registry.get(&event.event_type) else {
            // Unknown types can never succeed, so retrying them is pointless
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Received unhandled event type - no handler configured"
            );
            return Ok(DispatchOutcome::Unhandled);
        };

        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => Ok(DispatchOutcome::Handled),
            Ok(Err(e)) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt = event.attempts + 1,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Event handler failed"
                );
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt = event.attempts + 1,
                    panic = %message,
                    "Event handler panicked"
                );
                Err(HandlerError::Panicked(message))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStatus;
    use crate::registry::handler_fn;
    use serde_json::json;
    use time::OffsetDateTime;

    fn event(event_type: &str) -> Event {
        Event {
            id: "evt_dispatch".to_string(),
            event_type: event_type.to_string(),
            payload: json!({"amount": 500}),
            status: EventStatus::Processing,
            attempts: 0,
            error_message: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            processing_started_at: None,
            processed_at: None,
        }
    }

    fn dispatcher(registry: HandlerRegistry) -> Dispatcher {
        Dispatcher::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_noop() {
        let d = dispatcher(HandlerRegistry::new());
        assert_eq!(
            d.dispatch(&event("ping")).await,
            Ok(DispatchOutcome::Unhandled)
        );
    }

    #[tokio::test]
    async fn test_handler_receives_payload() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "charge",
            handler_fn(|event: Event| async move {
                if event.payload["amount"] == 500 {
                    Ok(())
                } else {
                    Err(HandlerError::permanent("wrong payload"))
                }
            }),
        );

        let d = dispatcher(registry);
        assert_eq!(
            d.dispatch(&event("charge")).await,
            Ok(DispatchOutcome::Handled)
        );
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "charge",
            handler_fn(|_| async { Err(HandlerError::transient("downstream timeout")) }),
        );

        let err = dispatcher(registry)
            .dispatch(&event("charge"))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::Transient("downstream timeout".to_string()));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "charge",
            handler_fn(|event: Event| async move {
                if event.attempts == 0 {
                    panic!("handler exploded");
                }
                Ok(())
            }),
        );

        let err = dispatcher(registry)
            .dispatch(&event("charge"))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::Panicked("handler exploded".to_string()));
        assert!(err.is_retryable());
    }
}
