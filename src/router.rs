//! Remote event router: applies inbound change events to the store.
//!
//! Each event is first put to the echo filter; ignored events never touch
//! the store. Accepted events map onto the store as:
//!
//! | Event  | Store operation |
//! |--------|-----------------|
//! | insert | `insert_if_absent` (redelivery is a no-op) |
//! | update | `upsert` (full replace by id) |
//! | delete | `remove`, plus dropping the element's echo entry, gesture and request bookkeeping |
//!
//! Author display names are requested as an `Effect` and attached when they
//! arrive; the element is visible before its name is known.

#[cfg(test)]
#[path = "router_test.rs"]
mod router_test;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::{Effect, SyncCore};
use crate::event::ChangeEvent;

impl SyncCore {
    /// Route one change-stream event.
    pub fn apply_remote(&mut self, event: ChangeEvent) -> Vec<Effect> {
        let id = event.element_id();
        if self.echo.should_ignore(&event, &self.gestures, Instant::now()) {
            trace!(element_id = %id, kind = ?event.kind(), "echo suppressed");
            return Vec::new();
        }

        match event {
            ChangeEvent::Insert(element) | ChangeEvent::Update(element) if element.board_id != self.board.board_id => {
                debug!(element_id = %id, board_id = %element.board_id, "event for another board; dropping");
                Vec::new()
            }
            ChangeEvent::Insert(mut element) => {
                if self.store.contains(&id) {
                    trace!(element_id = %id, "redelivered insert");
                    return Vec::new();
                }
                let effects = self.attach_author(&mut element).into_iter().collect();
                self.store.insert_if_absent(element);
                effects
            }
            ChangeEvent::Update(mut element) => {
                let effects = self.attach_author(&mut element).into_iter().collect();
                self.store.upsert(element);
                effects
            }
            ChangeEvent::Delete { .. } => {
                self.store.remove(&id);
                self.echo.forget(&id);
                if self.gestures.clear(&id).is_some() {
                    debug!(element_id = %id, "element deleted remotely mid-gesture");
                }
                self.seqs.remove(&id);
                self.queued.remove(&id);
                Vec::new()
            }
        }
    }
}
