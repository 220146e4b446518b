//! Queue event broadcaster for real-time batch and page status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::batch_repo::BatchRow;
use crate::db::{PageStatus, ProcessingPhase};

/// Events emitted while batches move through the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A batch's derived progress changed.
    BatchUpdated { batch: BatchRow },
    /// A page changed status or phase.
    #[serde(rename_all = "camelCase")]
    PageUpdated {
        page_id: String,
        queue_id: String,
        page_number: i64,
        status: PageStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<ProcessingPhase>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Text extraction produced a chunk with substantial text.
    #[serde(rename_all = "camelCase")]
    ChunkReady {
        chunk_id: String,
        source_id: String,
        page: i64,
        length: usize,
    },
}

/// Broadcasts queue events to all subscribers.
#[derive(Clone)]
pub struct QueueEventBroadcaster {
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl QueueEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: QueueEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one claimed page.
    pub fn track_page(&self, page_id: &str, queue_id: &str, page_number: i64) -> PageTracker {
        PageTracker {
            page_id: page_id.to_string(),
            queue_id: queue_id.to_string(),
            page_number,
            sender: Arc::clone(&self.sender),
        }
    }
}

impl Default for QueueEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Emits `PageUpdated` events for a single page.
pub struct PageTracker {
    page_id: String,
    queue_id: String,
    page_number: i64,
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl PageTracker {
    fn emit(&self, status: PageStatus, phase: Option<ProcessingPhase>, message: &str, error: Option<&str>) {
        let _ = self.sender.send(QueueEvent::PageUpdated {
            page_id: self.page_id.clone(),
            queue_id: self.queue_id.clone(),
            page_number: self.page_number,
            status,
            phase,
            message: message.to_string(),
            error: error.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    pub fn phase(&self, phase: ProcessingPhase) {
        self.emit(PageStatus::Processing, Some(phase), phase.label(), None);
    }

    pub fn completed(&self) {
        self.emit(
            PageStatus::Completed,
            Some(ProcessingPhase::Done),
            ProcessingPhase::Done.label(),
            None,
        );
    }

    pub fn failed(&self, phase: ProcessingPhase, error: &str) {
        self.emit(PageStatus::Error, Some(phase), "Failed", Some(error));
    }
}
