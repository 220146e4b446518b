//! Broadcasting of queue events to in-process subscribers.

pub mod queue_events;

pub use queue_events::{PageTracker, QueueEvent, QueueEventBroadcaster};
