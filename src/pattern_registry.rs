use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{Event, PatternName};

/// Holds every named pattern's event list behind a single lock.
///
/// `snapshot` is the only way callers get at a pattern's events: it clones
/// the list out from under the lock so the JIT expander in
/// `pattern_expander` can work from a consistent view even while a live
/// edit mutates the same name moments later. Edits never hand out a live
/// reference.
#[derive(Default)]
pub struct PatternRegistry {
    patterns: Mutex<HashMap<PatternName, Vec<Event>>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the named pattern's current events, creating an
    /// empty pattern if the name has never been seen.
    pub fn snapshot(&self, name: &str) -> Vec<Event> {
        let mut patterns = self.patterns.lock().unwrap();
        patterns.entry(name.to_string()).or_default().clone()
    }

    /// Drops every event from the named pattern, creating it empty if
    /// absent. Idempotent: clearing an already-empty pattern is a no-op.
    pub fn clear(&self, name: &str) {
        let mut patterns = self.patterns.lock().unwrap();
        patterns.entry(name.to_string()).or_default().clear();
    }

    /// Appends events to the named pattern, creating it if absent. Never
    /// replaces existing events -- a pattern only grows until explicitly
    /// cleared.
    pub fn append(&self, name: &str, events: Vec<Event>) {
        let mut patterns = self.patterns.lock().unwrap();
        patterns.entry(name.to_string()).or_default().extend(events);
    }
}
