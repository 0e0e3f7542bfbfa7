//! Sub-process events emitted while an answer is being produced.

use crate::infrastructure::entities::{SubProcessSource, SubProcessStatus};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SubProcessEvent {
    /// Pairs the PENDING and FINISHED events of the same step.
    pub event_id: Uuid,
    pub source: SubProcessSource,
    pub status: SubProcessStatus,
    pub metadata: Value,
}

/// Where pipeline components report their progress. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<SubProcessEvent>>,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<SubProcessEvent>) -> Self {
        EventSink {
            sender: Some(sender),
        }
    }

    /// A sink that drops every event.
    pub fn noop() -> Self {
        EventSink::default()
    }

    pub fn emit(&self, event: SubProcessEvent) {
        if let Some(sender) = &self.sender {
            // the receiver may be gone once the client disconnects
            let _ = sender.send(event);
        }
    }

    pub fn finished(&self, source: SubProcessSource, metadata: Value) {
        self.emit(SubProcessEvent {
            event_id: Uuid::new_v4(),
            source,
            status: SubProcessStatus::Finished,
            metadata,
        });
    }

    /// Emits a PENDING event and returns its id for the matching [`EventSink::end`].
    pub fn start(&self, source: SubProcessSource, metadata: Value) -> Uuid {
        let event_id = Uuid::new_v4();
        self.emit(SubProcessEvent {
            event_id,
            source,
            status: SubProcessStatus::Pending,
            metadata,
        });
        event_id
    }

    pub fn end(&self, event_id: Uuid, source: SubProcessSource, metadata: Value) {
        self.emit(SubProcessEvent {
            event_id,
            source,
            status: SubProcessStatus::Finished,
            metadata,
        });
    }
}
