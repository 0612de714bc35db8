//! Append-only event publishing. Events are observability output; a publish
//! failure is logged and never fails the primary flow.

use crate::model::{Event, EventKind};
use crate::repository::EventRepository;
use std::sync::Arc;

/// Thin publisher over the event repository.
#[derive(Clone)]
pub struct EventBus {
    repo: Arc<dyn EventRepository>,
}

impl EventBus {
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        EventBus { repo }
    }

    /// Appends one event. Errors are swallowed with a warning.
    pub async fn publish(&self, event: Event) {
        tracing::debug!(
            kind = event.kind.as_str(),
            session_id = %event.session_id,
            user_id = event.user_id,
            "event"
        );
        if let Err(error) = self.repo.save_event(&event).await {
            tracing::warn!(?error, kind = event.kind.as_str(), "failed to persist event");
        }
    }

    /// Convenience constructor and publish in one step.
    pub async fn emit(
        &self,
        kind: EventKind,
        session_id: &str,
        user_id: u64,
        game_id: &str,
        metadata: serde_json::Value,
    ) {
        self.publish(Event::new(kind, session_id, user_id, game_id, metadata))
            .await;
    }
}
