//! Sync core: the single writer over the element store.
//!
//! DESIGN
//! ======
//! `SyncCore` owns every piece of client-side sync state for one open board:
//! the element store, live gesture sessions, echo-suppression entries,
//! in-flight placeholder creates, per-element request sequence numbers and
//! the author-name cache. It does no I/O. Every entry point mutates state
//! synchronously and returns the `Effect`s the caller must carry out
//! (persistence requests, reloads, author lookups, notices); results come
//! back in as `Completion`s. This keeps the single-writer rule without
//! depending on how a runtime orders callbacks.
//!
//! The entry points are split by concern:
//! - local mutations, gestures and completions live in `pipeline.rs`
//! - inbound change events live in `router.rs`
//! - lifecycle (reloads, reconnects, board record, author names) lives here
//!
//! ERROR HANDLING
//! ==============
//! Local mutation calls return `Rejected` for problems resolved entirely on
//! the client (stale target, authorization). Persistence failures never
//! surface as errors: they turn into a recovery (`Recovery::LocalRemove` or
//! `Recovery::ReconcileFromCanonical`) reported through `SessionEvent`.

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{error, info};

use crate::config::SyncConfig;
use crate::consts::RECONNECT_BASE_MS;
use crate::echo::EchoFilter;
use crate::element::{BoardId, Element, ElementId, ElementPatch, NewElement, UserId};
use crate::gesture::GestureSessions;
use crate::persistence::StoreError;
use crate::store::ElementStore;

// =============================================================================
// TYPES
// =============================================================================

/// Problems a local mutation is rejected for before any request is issued.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Rejected {
    #[error("element not present locally: {0}")]
    StaleTarget(ElementId),
    #[error("not permitted to modify element: {0}")]
    Unauthorized(ElementId),
    #[error("a gesture is already in progress on element: {0}")]
    GestureInProgress(ElementId),
    #[error("no gesture in progress on element: {0}")]
    NoGesture(ElementId),
    #[error("board session closed")]
    SessionClosed,
}

/// How a failed optimistic mutation was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The element was gone or not ours to change; it was removed locally.
    LocalRemove,
    /// The whole board is being reloaded from the persistence store.
    ReconcileFromCanonical,
}

/// Result of reconciling a persistence response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    RolledBack(Recovery),
}

/// Notices published to observers of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A persistence request for the element resolved.
    Reconciled { element_id: ElementId, outcome: Outcome },
    /// The store was replaced by the canonical element set.
    Reloaded { count: usize },
    /// The persistence store refused a change to the element.
    PermissionDenied { element_id: ElementId, message: String },
    /// The change stream re-established its subscription.
    Reconnected,
}

/// Work the caller must carry out on behalf of the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Insert `element`; answer with `Completion::Created`.
    Create { placeholder: ElementId, element: NewElement },
    /// Persist `patch`; answer with `Completion::Updated`.
    Update { id: ElementId, patch: ElementPatch, seq: u64 },
    /// Delete the element; answer with `Completion::Deleted`.
    Delete { id: ElementId, seq: u64 },
    /// List the board after `after`; answer with `SyncCore::canonical_loaded`.
    Reload { after: Duration },
    /// Look up the user's display name; answer with `SyncCore::author_resolved`.
    ResolveAuthor(UserId),
    Notify(SessionEvent),
}

/// A persistence response routed back into the core.
#[derive(Debug)]
pub enum Completion {
    Created { placeholder: ElementId, result: Result<Element, StoreError> },
    Updated { id: ElementId, seq: u64, result: Result<Element, StoreError> },
    Deleted { id: ElementId, seq: u64, result: Result<(), StoreError> },
}

/// The open board as far as authorization is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardRecord {
    pub board_id: BoardId,
    pub owner_id: UserId,
}

/// Read-only view for the render layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardSnapshot {
    /// Elements in creation order.
    pub elements: Vec<Element>,
    /// Elements with a live drag or resize, sorted.
    pub gestures: Vec<ElementId>,
}

/// A create whose response hasn't arrived yet, keyed by placeholder id.
#[derive(Debug, Default)]
pub(crate) struct PendingCreate {
    /// Edits made to the placeholder, replayed onto the canonical record.
    pub(crate) deferred: ElementPatch,
    /// Deleted locally; delete the canonical record once it exists.
    pub(crate) deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadState {
    Idle,
    /// A list request is outstanding; `again` asks for one more afterwards
    /// because state changed while it was in flight.
    InFlight { again: bool },
}

// =============================================================================
// SYNC CORE
// =============================================================================

pub struct SyncCore {
    pub(crate) store: ElementStore,
    pub(crate) gestures: GestureSessions,
    pub(crate) echo: EchoFilter,
    pub(crate) board: BoardRecord,
    pub(crate) pending: HashMap<ElementId, PendingCreate>,
    /// Sequence number of the one request in flight per element.
    pub(crate) seqs: HashMap<ElementId, u64>,
    /// Edits made while a request was in flight, sent once it answers.
    pub(crate) queued: HashMap<ElementId, ElementPatch>,
    next_seq: u64,
    /// `None` marks a lookup in flight.
    authors: HashMap<UserId, Option<String>>,
    reload: ReloadState,
    reload_failures: u32,
    reconnect_max: Duration,
}

impl SyncCore {
    #[must_use]
    pub fn new(board: BoardRecord, local_user: UserId, config: &SyncConfig) -> Self {
        Self {
            store: ElementStore::new(),
            gestures: GestureSessions::new(config.gesture_window),
            echo: EchoFilter::new(local_user, config.echo_window),
            board,
            pending: HashMap::new(),
            seqs: HashMap::new(),
            queued: HashMap::new(),
            next_seq: 0,
            authors: HashMap::new(),
            reload: ReloadState::Idle,
            reload_failures: 0,
            reconnect_max: config.reconnect_max,
        }
    }

    // --- Queries ---

    #[must_use]
    pub fn store(&self) -> &ElementStore {
        &self.store
    }

    #[must_use]
    pub fn gestures(&self) -> &GestureSessions {
        &self.gestures
    }

    #[must_use]
    pub fn echo(&self) -> &EchoFilter {
        &self.echo
    }

    #[must_use]
    pub fn board(&self) -> BoardRecord {
        self.board
    }

    #[must_use]
    pub fn local_user(&self) -> UserId {
        self.echo.local_user()
    }

    /// Whether `id` is a placeholder awaiting its create response.
    #[must_use]
    pub fn is_placeholder(&self, id: &ElementId) -> bool {
        self.pending.contains_key(id)
    }

    #[must_use]
    pub fn snapshot(&self) -> BoardSnapshot {
        let mut gestures = self.gestures.active_ids();
        gestures.sort_unstable();
        BoardSnapshot { elements: self.store.snapshot(), gestures }
    }

    // --- Lifecycle ---

    /// Replace the board record, e.g. after an ownership transfer.
    /// Authorization always uses the current record.
    pub fn set_board_owner(&mut self, owner_id: UserId) {
        self.board.owner_id = owner_id;
    }

    /// Fetch the canonical element set. Used on open.
    pub fn start(&mut self) -> Vec<Effect> {
        self.request_reload()
    }

    /// The change stream re-joined after a drop: anything could have been
    /// missed, so forget every echo entry and reload.
    pub fn on_reconnected(&mut self) -> Vec<Effect> {
        info!(board_id = %self.board.board_id, "change stream reconnected; reloading");
        self.echo.reset();
        let mut effects = self.request_reload();
        effects.push(Effect::Notify(SessionEvent::Reconnected));
        effects
    }

    /// Answer to `Effect::Reload`.
    pub fn canonical_loaded(&mut self, result: Result<Vec<Element>, StoreError>) -> Vec<Effect> {
        let mut elements = match result {
            Ok(elements) => elements,
            Err(e) => {
                self.reload_failures += 1;
                let after = self.reload_backoff();
                error!(board_id = %self.board.board_id, error = %e, retry_ms = after.as_millis(), "board reload failed");
                // The retry is still in flight; a follow-up asked for meanwhile stays owed.
                let again = self.reload == ReloadState::InFlight { again: true };
                self.reload = ReloadState::InFlight { again };
                return vec![Effect::Reload { after }];
            }
        };

        let again = self.reload == ReloadState::InFlight { again: true };
        self.reload = ReloadState::Idle;
        self.reload_failures = 0;

        let mut effects = Vec::new();
        elements.retain(|element| element.board_id == self.board.board_id);
        for element in &mut elements {
            effects.extend(self.attach_author(element));
        }
        let count = elements.len();
        let placeholders: Vec<Element> = self.pending.keys().filter_map(|id| self.store.get(id).cloned()).collect();
        self.store.replace_all(elements);
        // Placeholders are not on the server yet; the list cannot know them.
        for placeholder in placeholders {
            self.store.upsert(placeholder);
        }

        // Live gestures survive a reload only if their element did, and keep
        // showing the pointer's geometry rather than the canonical one.
        let store = &self.store;
        self.gestures.retain(|id| store.contains(id));
        for id in self.gestures.active_ids() {
            if let Some(session) = self.gestures.get(&id) {
                let latest = session.latest();
                let patch = ElementPatch { position: Some(latest.position), size: Some(latest.size), ..ElementPatch::default() };
                self.store.patch(&id, &patch);
            }
        }
        // Edits waiting on an in-flight request stay visible.
        let store = &self.store;
        self.queued.retain(|id, _| store.contains(id));
        for (id, patch) in &self.queued {
            self.store.patch(id, patch);
        }

        info!(board_id = %self.board.board_id, count, "board reloaded");
        effects.push(Effect::Notify(SessionEvent::Reloaded { count }));
        if again {
            effects.extend(self.request_reload());
        }
        effects
    }

    /// Answer to `Effect::ResolveAuthor`. `None` means the lookup failed or
    /// found nothing; the next element by that author retries.
    pub fn author_resolved(&mut self, user_id: UserId, name: Option<String>) {
        match name {
            Some(name) => {
                self.store.attach_author_name(user_id, &name);
                self.authors.insert(user_id, Some(name));
            }
            None => {
                self.authors.remove(&user_id);
            }
        }
    }

    // --- Internals shared by pipeline and router ---

    /// Attach a cached author name, or ask for one when the author is new.
    pub(crate) fn attach_author(&mut self, element: &mut Element) -> Option<Effect> {
        match self.authors.get(&element.author_id) {
            Some(Some(name)) => {
                element.author_name = Some(name.clone());
                None
            }
            Some(None) => None,
            None => {
                self.authors.insert(element.author_id, None);
                Some(Effect::ResolveAuthor(element.author_id))
            }
        }
    }

    /// Ask for a reload, coalescing with one already in flight.
    pub(crate) fn request_reload(&mut self) -> Vec<Effect> {
        match self.reload {
            ReloadState::Idle => {
                self.reload = ReloadState::InFlight { again: false };
                vec![Effect::Reload { after: Duration::ZERO }]
            }
            ReloadState::InFlight { .. } => {
                self.reload = ReloadState::InFlight { again: true };
                Vec::new()
            }
        }
    }

    /// Issue the next request sequence number for `id`.
    pub(crate) fn next_seq(&mut self, id: ElementId) -> u64 {
        self.next_seq += 1;
        self.seqs.insert(id, self.next_seq);
        self.next_seq
    }

    /// Whether `seq` answers the latest request issued for `id`. Clears the
    /// bookkeeping when it does.
    pub(crate) fn settle_seq(&mut self, id: &ElementId, seq: u64) -> bool {
        if self.seqs.get(id) == Some(&seq) {
            self.seqs.remove(id);
            return true;
        }
        false
    }

    /// Delay before retrying a failed reload: doubles from the base up to
    /// the reconnect ceiling.
    fn reload_backoff(&self) -> Duration {
        let exponent = self.reload_failures.saturating_sub(1).min(16);
        let delay = Duration::from_millis(RECONNECT_BASE_MS.saturating_mul(1_u64 << exponent));
        delay.min(self.reconnect_max)
    }
}
