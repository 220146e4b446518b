use crate::broadcast::PageTracker;
use crate::db::ProcessingPhase;

/// Events emitted by the pipeline while it works on one page.
pub enum ProgressEvent {
    Phase { phase: ProcessingPhase },
    Completed,
    Failed { phase: ProcessingPhase, error: String },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Bridges pipeline events to the queue event channel.
pub struct BroadcastProgress {
    tracker: PageTracker,
}

impl BroadcastProgress {
    pub fn new(tracker: PageTracker) -> Self {
        Self { tracker }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Phase { phase } => self.tracker.phase(phase),
            ProgressEvent::Completed => self.tracker.completed(),
            ProgressEvent::Failed { phase, error } => self.tracker.failed(phase, &error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{QueueEvent, QueueEventBroadcaster};
    use crate::db::PageStatus;

    #[test]
    fn test_broadcast_progress_forwards_events() {
        let broadcaster = QueueEventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let progress = BroadcastProgress::new(broadcaster.track_page("p1", "b1", 1));

        progress.report(ProgressEvent::Phase {
            phase: ProcessingPhase::Ocr,
        });
        progress.report(ProgressEvent::Completed);

        let statuses: Vec<PageStatus> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                QueueEvent::PageUpdated { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![PageStatus::Processing, PageStatus::Completed]);
    }
}
