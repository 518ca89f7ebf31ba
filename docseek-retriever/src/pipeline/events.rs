//! Typed event channels.
//!
//! An [`EventBus`] delivers each event to synchronous listeners, in
//! registration order, and then to every `broadcast` subscriber. Listeners
//! run on the emitting task and must not block.

use docseek_context::OcrRegion;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Events emitted by the indexing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A consumption run began with this many queued files
    Started { file_count: usize },
    Progress {
        current: usize,
        total: usize,
        file_path: String,
    },
    /// The queue drained and the pipeline is idle again
    Completed {
        indexed: usize,
        failed: usize,
        duration: Duration,
    },
    DocumentIndexed {
        document_id: String,
        file_path: String,
        chunk_count: usize,
    },
    DocumentFailed { file_path: String, error: String },
    /// Parsing found regions whose text needs OCR
    OcrNeeded {
        document_id: String,
        file_path: String,
        regions: Vec<OcrRegion>,
    },
}

pub type EventListener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out of one event type to listeners and subscribers.
pub struct EventBus<E> {
    listeners: RwLock<Vec<EventListener<E>>>,
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Bus whose subscribers lag after `capacity` unread events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
        }
    }

    pub fn add_listener(&self, listener: EventListener<E>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: E) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in &listeners {
            listener(&event);
        }
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("EventBus")
            .field("listeners", &listeners)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_listeners_and_subscribers_both_receive() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.add_listener(Arc::new(move |event: &PipelineEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        let mut rx = bus.subscribe();

        bus.emit(PipelineEvent::Started { file_count: 3 });

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[PipelineEvent::Started { file_count: 3 }]
        );
        assert_eq!(rx.recv().await.unwrap(), PipelineEvent::Started { file_count: 3 });
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus: EventBus<PipelineEvent> = EventBus::new(1);
        bus.emit(PipelineEvent::DocumentFailed {
            file_path: "a.txt".into(),
            error: "boom".into(),
        });
    }
}
