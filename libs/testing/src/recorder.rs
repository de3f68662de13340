use std::sync::Mutex;

use vmfleet_reconcile::{Event, EventRecorder};

/// Event sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<Event>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Events rendered as `"<type> <reason> <message>"`.
    pub fn lines(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| format!("{} {} {}", e.event_type, e.reason, e.message))
            .collect()
    }

    /// Number of events with `reason`.
    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }

    /// Drop recorded events.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl EventRecorder for FakeRecorder {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}
