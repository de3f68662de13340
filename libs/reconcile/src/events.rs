//! Human-readable events about fleets.

use std::fmt;

use tracing::{info, warn};
use vmfleet_api::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("Normal"),
            Self::Warning => f.write_str("Warning"),
        }
    }
}

/// One event attached to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: &'static str,
    pub object: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl Event {
    pub fn new<K: Resource>(
        obj: &K,
        event_type: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: K::KIND,
            object: obj.key(),
            event_type,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// A `Normal` event about `obj`.
    pub fn normal<K: Resource>(obj: &K, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(obj, EventType::Normal, reason, message)
    }

    /// A `Warning` event about `obj`.
    pub fn warning<K: Resource>(obj: &K, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(obj, EventType::Warning, reason, message)
    }
}

/// Sink for [`Event`]s.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                event_type = %event.event_type,
                reason = %event.reason,
                kind = event.kind,
                object = %event.object,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                event_type = %event.event_type,
                reason = %event.reason,
                kind = event.kind,
                object = %event.object,
                "{}",
                event.message
            ),
        }
    }
}
