//! Optimistic mutation pipeline.
//!
//! DESIGN
//! ======
//! Every local mutation runs the same steps:
//!
//! 1. check the target exists locally (abort with `StaleTarget` otherwise)
//! 2. apply the change to the store
//! 3. record or refresh the element's echo entry
//! 4. emit the persistence request as an `Effect`
//!
//! An element has at most one update request in flight. Edits made while
//! it is out are applied locally and merged into a queued patch, which is
//! sent when the response arrives. Responses therefore answer requests in
//! the order they were issued, and the last one carries every edit.
//!
//! The response comes back through `complete`. Success replaces the local
//! record with the server's row, then re-applies any queued edits on top.
//! Failure drops the queue, clears the echo entry and recovers: the element
//! is removed locally when the store says it is gone or forbidden, otherwise
//! the board is reloaded from canonical state.
//!
//! Gestures are the exception to step 4: pointer-moves update the store and
//! the echo entry but persist nothing. Only pointer-up persists, once.
//!
//! Elements created locally live under a placeholder id until the create
//! resolves. Edits to a placeholder are applied locally and folded into one
//! deferred patch that is persisted against the canonical id afterwards.

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::element::{Element, ElementDraft, ElementId, ElementPatch, NewElement, Point, Size, TextStyle};
use crate::engine::{Completion, Effect, Outcome, PendingCreate, Recovery, Rejected, SessionEvent, SyncCore};
use crate::event::ChangeKind;
use crate::gesture::GestureKind;
use crate::persistence::StoreError;

impl SyncCore {
    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Terminal move of an element to `position`.
    pub fn move_to(&mut self, id: ElementId, position: Point) -> Result<Vec<Effect>, Rejected> {
        self.mutate(id, ElementPatch::position(position))
    }

    /// Resize an element. The size is clamped to the kind's minimum.
    pub fn resize(&mut self, id: ElementId, size: Size) -> Result<Vec<Effect>, Rejected> {
        let element = self.target(&id)?;
        let size = size.clamped_to(element.kind.min_size());
        self.mutate(id, ElementPatch::size(size))
    }

    pub fn update_content(&mut self, id: ElementId, content: impl Into<String>) -> Result<Vec<Effect>, Rejected> {
        self.mutate(id, ElementPatch::content(content))
    }

    pub fn change_color(&mut self, id: ElementId, color: impl Into<String>) -> Result<Vec<Effect>, Rejected> {
        self.mutate(id, ElementPatch::color(color))
    }

    /// Replace the text style. Only the board owner or the element's author
    /// may restyle it.
    pub fn change_style(&mut self, id: ElementId, style: TextStyle) -> Result<Vec<Effect>, Rejected> {
        let element = self.target(&id)?;
        self.authorize(element)?;
        self.mutate(id, ElementPatch::text_style(style))
    }

    /// Delete an element. Only the board owner or the element's author may
    /// delete it.
    pub fn delete(&mut self, id: ElementId) -> Result<Vec<Effect>, Rejected> {
        let element = self.target(&id)?;
        self.authorize(element)?;

        self.store.remove(&id);
        self.gestures.clear(&id);
        self.queued.remove(&id);
        if let Some(pending) = self.pending.get_mut(&id) {
            pending.deleted = true;
            return Ok(Vec::new());
        }

        self.echo.record(id, ChangeKind::Delete, Instant::now());
        let seq = self.next_seq(id);
        Ok(vec![Effect::Delete { id, seq }])
    }

    /// Create an element from a draft. It appears immediately under a
    /// placeholder id, which is returned alongside the effects.
    pub fn create(&mut self, draft: ElementDraft) -> (ElementId, Vec<Effect>) {
        let placeholder = Uuid::new_v4();
        let row = NewElement::from_draft(draft, self.board.board_id, self.local_user());
        let mut element = row.clone().into_element(placeholder, time::OffsetDateTime::now_utc());

        let mut effects: Vec<Effect> = self.attach_author(&mut element).into_iter().collect();
        self.store.upsert(element);
        self.pending.insert(placeholder, PendingCreate::default());
        effects.push(Effect::Create { placeholder, element: row });
        (placeholder, effects)
    }

    // =========================================================================
    // GESTURES
    // =========================================================================

    /// Pointer-down on an element or its resize handle.
    pub fn pointer_down(&mut self, id: ElementId, kind: GestureKind, pointer: Point) -> Result<(), Rejected> {
        let Some(element) = self.store.get(&id) else {
            warn!(element_id = %id, "pointer-down on missing element; ignoring");
            return Err(Rejected::StaleTarget(id));
        };
        if !self.gestures.begin(element, kind, pointer, Instant::now()) {
            return Err(Rejected::GestureInProgress(id));
        }
        Ok(())
    }

    /// Pointer-move during a gesture: a continuous update. The store and the
    /// echo entry follow the pointer; nothing is persisted.
    pub fn pointer_move(&mut self, id: ElementId, pointer: Point) -> Result<(), Rejected> {
        let Some(geometry) = self.gestures.track(&id, pointer) else {
            return Err(Rejected::NoGesture(id));
        };
        let patch = ElementPatch { position: Some(geometry.position), size: Some(geometry.size), ..ElementPatch::default() };
        if !self.store.patch(&id, &patch) {
            self.gestures.clear(&id);
            warn!(element_id = %id, "gesture target vanished; ending gesture");
            return Err(Rejected::StaleTarget(id));
        }
        if !self.pending.contains_key(&id) {
            self.echo.record(id, ChangeKind::Update, Instant::now());
        }
        Ok(())
    }

    /// Pointer-up: the terminal update. Persists the final geometry once,
    /// and only if the gesture changed it.
    pub fn pointer_up(&mut self, id: ElementId) -> Result<Vec<Effect>, Rejected> {
        let Some(session) = self.gestures.end(&id) else {
            return Err(Rejected::NoGesture(id));
        };
        if !session.changed() {
            return Ok(Vec::new());
        }
        let latest = session.latest();
        let patch = match session.kind {
            GestureKind::Drag => ElementPatch::position(latest.position),
            GestureKind::Resize => ElementPatch::size(latest.size),
        };
        self.mutate(id, patch)
    }

    /// Abandon a gesture, restoring the element's geometry at pointer-down.
    pub fn pointer_cancel(&mut self, id: ElementId) -> Result<(), Rejected> {
        let Some(session) = self.gestures.clear(&id) else {
            return Err(Rejected::NoGesture(id));
        };
        let origin = session.origin();
        let patch = ElementPatch { position: Some(origin.position), size: Some(origin.size), ..ElementPatch::default() };
        self.store.patch(&id, &patch);
        Ok(())
    }

    // =========================================================================
    // COMPLETIONS
    // =========================================================================

    /// Reconcile a persistence response.
    pub fn complete(&mut self, completion: Completion) -> Vec<Effect> {
        match completion {
            Completion::Created { placeholder, result } => self.complete_create(placeholder, result),
            Completion::Updated { id, seq, result } => match result {
                Ok(row) => self.complete_update(id, seq, row),
                Err(e) => self.fail(id, seq, &e),
            },
            Completion::Deleted { id, seq, result } => match result {
                Ok(()) => {
                    self.settle_seq(&id, seq);
                    vec![applied(id)]
                }
                Err(e) => self.fail(id, seq, &e),
            },
        }
    }

    fn complete_update(&mut self, id: ElementId, seq: u64, mut row: Element) -> Vec<Effect> {
        if !self.settle_seq(&id, seq) {
            debug!(element_id = %id, seq, "response for a dropped request; keeping local state");
            return vec![applied(id)];
        }
        // A live gesture or a delete since the request owns the local record.
        if self.gestures.is_active(&id) || !self.store.contains(&id) {
            return self.send_queued(id).into_iter().chain([applied(id)]).collect();
        }
        let mut effects: Vec<Effect> = self.attach_author(&mut row).into_iter().collect();
        self.store.upsert(row);
        effects.extend(self.send_queued(id));
        effects.push(applied(id));
        effects
    }

    /// Send the edits queued behind the request that just answered, keeping
    /// them applied over the server's row.
    fn send_queued(&mut self, id: ElementId) -> Option<Effect> {
        let patch = self.queued.remove(&id)?;
        if !self.store.patch(&id, &patch) {
            return None;
        }
        self.echo.record(id, ChangeKind::Update, Instant::now());
        let seq = self.next_seq(id);
        Some(Effect::Update { id, patch, seq })
    }

    fn complete_create(&mut self, placeholder: ElementId, result: Result<Element, StoreError>) -> Vec<Effect> {
        let pending = self.pending.remove(&placeholder).unwrap_or_default();
        let mut canonical = match result {
            Ok(canonical) => canonical,
            Err(e) => {
                self.store.remove(&placeholder);
                self.gestures.clear(&placeholder);
                return self.recover(placeholder, &e);
            }
        };
        let id = canonical.id;
        let now = Instant::now();

        if pending.deleted {
            debug!(element_id = %id, "placeholder deleted before create resolved; deleting");
            self.echo.record(id, ChangeKind::Delete, now);
            let seq = self.next_seq(id);
            return vec![Effect::Delete { id, seq }];
        }

        self.store.remove(&placeholder);
        self.echo.record(id, ChangeKind::Insert, now);
        let mut effects: Vec<Effect> = self.attach_author(&mut canonical).into_iter().collect();
        pending.deferred.apply_to(&mut canonical);
        if self.gestures.rekey(&placeholder, id)
            && let Some(session) = self.gestures.get(&id)
        {
            canonical.geometry = session.latest();
        }
        self.store.upsert(canonical);

        if !pending.deferred.is_empty() {
            self.echo.record(id, ChangeKind::Update, now);
            let seq = self.next_seq(id);
            effects.push(Effect::Update { id, patch: pending.deferred, seq });
        }
        effects.push(applied(id));
        effects
    }

    /// A request for `id` failed: forget its echo entry and recover.
    fn fail(&mut self, id: ElementId, seq: u64, e: &StoreError) -> Vec<Effect> {
        if self.settle_seq(&id, seq) && self.queued.remove(&id).is_some() {
            debug!(element_id = %id, "dropping edits queued behind a failed request");
        }
        self.echo.forget(&id);
        if e.is_invalidating() {
            self.store.remove(&id);
            self.gestures.clear(&id);
        }
        self.recover(id, e)
    }

    fn recover(&mut self, id: ElementId, e: &StoreError) -> Vec<Effect> {
        if e.is_invalidating() {
            warn!(element_id = %id, error = %e, "optimistic change rejected; removing element locally");
            let mut effects = vec![rolled_back(id, Recovery::LocalRemove)];
            if matches!(e, StoreError::Forbidden(_)) {
                effects.push(Effect::Notify(SessionEvent::PermissionDenied { element_id: id, message: e.to_string() }));
            }
            return effects;
        }
        error!(element_id = %id, error = %e, "persistence failed; reloading board");
        let mut effects = self.request_reload();
        effects.push(rolled_back(id, Recovery::ReconcileFromCanonical));
        effects
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Apply `patch` locally and emit the persistence request, unless the
    /// target is a placeholder or already has a request in flight.
    fn mutate(&mut self, id: ElementId, patch: ElementPatch) -> Result<Vec<Effect>, Rejected> {
        if !self.store.patch(&id, &patch) {
            warn!(element_id = %id, "mutation target missing locally; aborting");
            return Err(Rejected::StaleTarget(id));
        }
        if let Some(pending) = self.pending.get_mut(&id) {
            pending.deferred.merge(patch);
            return Ok(Vec::new());
        }
        self.echo.record(id, ChangeKind::Update, Instant::now());
        if self.seqs.contains_key(&id) {
            trace!(element_id = %id, "request in flight; queueing edit");
            self.queued.entry(id).or_default().merge(patch);
            return Ok(Vec::new());
        }
        let seq = self.next_seq(id);
        Ok(vec![Effect::Update { id, patch, seq }])
    }

    fn target(&self, id: &ElementId) -> Result<&Element, Rejected> {
        self.store.get(id).ok_or_else(|| {
            warn!(element_id = %id, "mutation target missing locally; aborting");
            Rejected::StaleTarget(*id)
        })
    }

    /// Owner OR author, against the current board record.
    fn authorize(&self, element: &Element) -> Result<(), Rejected> {
        let user = self.local_user();
        if user == self.board.owner_id || user == element.author_id {
            return Ok(());
        }
        warn!(element_id = %element.id, user_id = %user, "not board owner or author; rejecting");
        Err(Rejected::Unauthorized(element.id))
    }
}

fn applied(element_id: ElementId) -> Effect {
    Effect::Notify(SessionEvent::Reconciled { element_id, outcome: Outcome::Applied })
}

fn rolled_back(element_id: ElementId, recovery: Recovery) -> Effect {
    Effect::Notify(SessionEvent::Reconciled { element_id, outcome: Outcome::RolledBack(recovery) })
}
