//! Gesture sessions: per-element transient drag/resize state.
//!
//! A session exists only between pointer-down and pointer-up for one element
//! and is never persisted or transmitted. While it is live every pointer-move
//! is a continuous update (local only); pointer-up yields the terminal
//! geometry, which is the only one the pipeline persists.
//!
//! Sessions also carry the extended suppression window: for
//! `window` after a session starts, remote updates for its element are
//! dropped so a stale snapshot can't override the live drag.

#[cfg(test)]
#[path = "gesture_test.rs"]
mod gesture_test;

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::element::{Element, ElementId, Geometry, Point, Size};

/// What the pointer is doing to the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureKind {
    /// Moving the element; pointer delta shifts its position.
    Drag,
    /// Dragging the bottom-right handle; pointer delta grows its size.
    Resize,
}

/// A live drag or resize of one element.
#[derive(Debug, Clone)]
pub struct GestureSession {
    pub element_id: ElementId,
    pub kind: GestureKind,
    pub started_at: Instant,
    /// Board-space pointer position at pointer-down.
    start_pointer: Point,
    /// Element geometry at pointer-down.
    origin: Geometry,
    /// Geometry after the most recent pointer-move.
    latest: Geometry,
    /// Kind minimum, enforced on every resize step.
    min_size: Size,
}

impl GestureSession {
    fn new(element: &Element, kind: GestureKind, pointer: Point, now: Instant) -> Self {
        Self {
            element_id: element.id,
            kind,
            started_at: now,
            start_pointer: pointer,
            origin: element.geometry,
            latest: element.geometry,
            min_size: element.kind.min_size(),
        }
    }

    /// Recompute the geometry for a new pointer position.
    fn track(&mut self, pointer: Point) -> Geometry {
        let dx = pointer.x - self.start_pointer.x;
        let dy = pointer.y - self.start_pointer.y;
        match self.kind {
            GestureKind::Drag => {
                self.latest.position = Point::new(self.origin.position.x + dx, self.origin.position.y + dy);
            }
            GestureKind::Resize => {
                self.latest.size = Size::new(self.origin.size.width + dx, self.origin.size.height + dy)
                    .clamped_to(self.min_size);
            }
        }
        self.latest
    }

    /// Geometry at pointer-down.
    #[must_use]
    pub fn origin(&self) -> Geometry {
        self.origin
    }

    /// Geometry after the most recent pointer-move.
    #[must_use]
    pub fn latest(&self) -> Geometry {
        self.latest
    }

    /// Whether any pointer-move changed the geometry.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.latest != self.origin
    }
}

/// All live gesture sessions for this client, keyed by element id.
#[derive(Debug)]
pub struct GestureSessions {
    sessions: HashMap<ElementId, GestureSession>,
    window: Duration,
}

impl GestureSessions {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { sessions: HashMap::new(), window }
    }

    /// Start a session for `element`. Returns `false` and leaves the existing
    /// session untouched if one is already live for that element.
    pub fn begin(&mut self, element: &Element, kind: GestureKind, pointer: Point, now: Instant) -> bool {
        if self.sessions.contains_key(&element.id) {
            return false;
        }
        self.sessions.insert(element.id, GestureSession::new(element, kind, pointer, now));
        true
    }

    /// Feed a pointer-move. Returns the new geometry, or `None` when no
    /// session is live for the element.
    pub fn track(&mut self, id: &ElementId, pointer: Point) -> Option<Geometry> {
        self.sessions.get_mut(id).map(|session| session.track(pointer))
    }

    /// End the session on pointer-up, returning it.
    pub fn end(&mut self, id: &ElementId) -> Option<GestureSession> {
        self.sessions.remove(id)
    }

    /// Drop any session for the element (remote delete, reload, cancel).
    pub fn clear(&mut self, id: &ElementId) -> Option<GestureSession> {
        self.sessions.remove(id)
    }

    /// Move a live session to a new element id. Used when a placeholder is
    /// replaced by its canonical record mid-gesture.
    pub fn rekey(&mut self, from: &ElementId, to: ElementId) -> bool {
        let Some(mut session) = self.sessions.remove(from) else {
            return false;
        };
        session.element_id = to;
        self.sessions.insert(to, session);
        true
    }

    /// Drop every session whose element no longer satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&ElementId) -> bool) {
        self.sessions.retain(|id, _| keep(id));
    }

    #[must_use]
    pub fn get(&self, id: &ElementId) -> Option<&GestureSession> {
        self.sessions.get(id)
    }

    #[must_use]
    pub fn is_active(&self, id: &ElementId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Whether a remote update for `id` must be dropped at `now`: a session
    /// is live and younger than the extended window.
    #[must_use]
    pub fn suppresses(&self, id: &ElementId, now: Instant) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|session| now.saturating_duration_since(session.started_at) < self.window)
    }

    /// Ids of elements with a live session.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ElementId> {
        self.sessions.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
