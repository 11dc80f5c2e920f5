//! Echo suppression: decides whether an inbound change is just the local
//! client's own recent write coming back.
//!
//! DESIGN
//! ======
//! Every local mutation records an entry `{element_id, recorded_at, kind}`.
//! Entries expire after the ordinary window and are evicted when a check
//! finds them expired; nothing sweeps them in the background. The policy
//! differs per event kind:
//!
//! | Event  | Ignored when |
//! |--------|--------------|
//! | insert | the inserted element's author is the local user |
//! | update | a gesture on the element is live within the extended window, or a fresh entry exists |
//! | delete | a fresh entry exists and it records a local delete |
//!
//! Any other delete is applied: a missed delete leaves a ghost element
//! nothing would ever clean up. The stream only says who authored the
//! deleted row, not who deleted it, so only the entry's kind can tell an
//! echo of our own delete apart.

#[cfg(test)]
#[path = "echo_test.rs"]
mod echo_test;

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::element::{ElementId, UserId};
use crate::event::{ChangeEvent, ChangeKind};
use crate::gesture::GestureSessions;

/// Marker left by a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoEntry {
    pub element_id: ElementId,
    pub recorded_at: Instant,
    pub kind: ChangeKind,
}

/// Process-local echo-suppression state for one board session.
#[derive(Debug)]
pub struct EchoFilter {
    local_user: UserId,
    window: Duration,
    entries: HashMap<ElementId, EchoEntry>,
}

impl EchoFilter {
    #[must_use]
    pub fn new(local_user: UserId, window: Duration) -> Self {
        Self { local_user, window, entries: HashMap::new() }
    }

    /// Record or refresh the entry for a local write.
    pub fn record(&mut self, element_id: ElementId, kind: ChangeKind, now: Instant) {
        self.entries.insert(element_id, EchoEntry { element_id, recorded_at: now, kind });
    }

    /// Drop the entry for an element (failed write, remote delete).
    pub fn forget(&mut self, element_id: &ElementId) -> Option<EchoEntry> {
        self.entries.remove(element_id)
    }

    /// Drop every entry. Used after the stream reconnects.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Whether an entry younger than the window exists. An expired entry is
    /// evicted as a side effect.
    pub fn is_fresh(&mut self, element_id: &ElementId, now: Instant) -> bool {
        let Some(entry) = self.entries.get(element_id) else {
            return false;
        };
        if now.saturating_duration_since(entry.recorded_at) < self.window {
            return true;
        }
        self.entries.remove(element_id);
        false
    }

    /// Decide whether `event` should be dropped without touching the store.
    pub fn should_ignore(&mut self, event: &ChangeEvent, gestures: &GestureSessions, now: Instant) -> bool {
        match event {
            ChangeEvent::Insert(element) => element.author_id == self.local_user,
            ChangeEvent::Update(element) => {
                if gestures.suppresses(&element.id, now) {
                    return true;
                }
                self.is_fresh(&element.id, now)
            }
            ChangeEvent::Delete { id, .. } => {
                self.entries.get(id).is_some_and(|entry| entry.kind == ChangeKind::Delete) && self.is_fresh(id, now)
            }
        }
    }

    #[must_use]
    pub fn entry(&self, element_id: &ElementId) -> Option<&EchoEntry> {
        self.entries.get(element_id)
    }

    #[must_use]
    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
