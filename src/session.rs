//! Session driver: runs one `SyncCore` against live collaborators.
//!
//! DESIGN
//! ======
//! A single tokio task owns the core. Local calls from `SessionHandle`,
//! change-stream items and persistence responses all arrive as messages
//! and are handled one at a time, so the core stays the only writer.
//!
//! Effects returned by the core become spawned I/O tasks: persistence
//! requests, reloads and author lookups. Each task reports back on an
//! internal channel; nothing awaits I/O inside the driver loop, so a slow
//! request never stalls local edits.
//!
//! After every message the driver publishes a fresh `BoardSnapshot` on a
//! `watch` channel (only when it changed) and forwards notices on a
//! `broadcast` channel.
//!
//! ERROR HANDLING
//! ==============
//! Local calls return the core's `Rejected`, or `Rejected::SessionClosed`
//! once the driver has stopped. Persistence failures are the core's
//! business and surface only as `SessionEvent`s. A failed author lookup is
//! logged and treated as "no name".

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::directory::UserDirectory;
use crate::element::{Element, ElementDraft, ElementId, Point, Size, TextStyle, UserId};
use crate::engine::{BoardSnapshot, Completion, Effect, Rejected, SessionEvent, SyncCore};
use crate::event::StreamItem;
use crate::gesture::GestureKind;
use crate::persistence::{PersistenceStore, StoreError};
use crate::transport::ChangeStream;

const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

// =============================================================================
// MESSAGES
// =============================================================================

enum Command {
    Local(Local, oneshot::Sender<Result<(), Rejected>>),
    Create(ElementDraft, oneshot::Sender<ElementId>),
    SetOwner(UserId),
    Shutdown,
}

enum Local {
    MoveTo(ElementId, Point),
    Resize(ElementId, Size),
    Content(ElementId, String),
    Color(ElementId, String),
    Style(ElementId, TextStyle),
    Delete(ElementId),
    PointerDown(ElementId, GestureKind, Point),
    PointerMove(ElementId, Point),
    PointerUp(ElementId),
    PointerCancel(ElementId),
}

/// Results of spawned I/O, routed back into the driver.
enum Internal {
    Completed(Completion),
    CanonicalLoaded(Result<Vec<Element>, StoreError>),
    AuthorResolved(UserId, Option<String>),
}

// =============================================================================
// HANDLE
// =============================================================================

/// Caller-side API of a running session. Cheap to clone; the session stops
/// when every handle is dropped or `close` is called.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<BoardSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Start a session for `core`, loading the board and following `stream`.
    /// Must be called from within a tokio runtime.
    pub fn open<S>(
        core: SyncCore,
        store: Arc<dyn PersistenceStore>,
        directory: Arc<dyn UserDirectory>,
        stream: S,
    ) -> (Self, JoinHandle<()>)
    where
        S: ChangeStream + 'static,
    {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal, internal_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshots) = watch::channel(core.snapshot());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let driver = Driver { core, store, directory, internal, snapshots: snapshot_tx, events: events.clone() };
        let task = tokio::spawn(driver.run(command_rx, internal_rx, stream));
        (Self { commands, snapshots, events }, task)
    }

    pub async fn move_to(&self, id: ElementId, position: Point) -> Result<(), Rejected> {
        self.request(Local::MoveTo(id, position)).await
    }

    pub async fn resize(&self, id: ElementId, size: Size) -> Result<(), Rejected> {
        self.request(Local::Resize(id, size)).await
    }

    pub async fn update_content(&self, id: ElementId, content: impl Into<String>) -> Result<(), Rejected> {
        self.request(Local::Content(id, content.into())).await
    }

    pub async fn change_color(&self, id: ElementId, color: impl Into<String>) -> Result<(), Rejected> {
        self.request(Local::Color(id, color.into())).await
    }

    pub async fn change_style(&self, id: ElementId, style: TextStyle) -> Result<(), Rejected> {
        self.request(Local::Style(id, style)).await
    }

    pub async fn delete(&self, id: ElementId) -> Result<(), Rejected> {
        self.request(Local::Delete(id)).await
    }

    pub async fn pointer_down(&self, id: ElementId, kind: GestureKind, pointer: Point) -> Result<(), Rejected> {
        self.request(Local::PointerDown(id, kind, pointer)).await
    }

    pub async fn pointer_move(&self, id: ElementId, pointer: Point) -> Result<(), Rejected> {
        self.request(Local::PointerMove(id, pointer)).await
    }

    pub async fn pointer_up(&self, id: ElementId) -> Result<(), Rejected> {
        self.request(Local::PointerUp(id)).await
    }

    pub async fn pointer_cancel(&self, id: ElementId) -> Result<(), Rejected> {
        self.request(Local::PointerCancel(id)).await
    }

    /// Create an element. Returns the placeholder id it is shown under
    /// until the store assigns the canonical one.
    pub async fn create(&self, draft: ElementDraft) -> Result<ElementId, Rejected> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Create(draft, reply)).await?;
        rx.await.map_err(|_| Rejected::SessionClosed)
    }

    /// Replace the board owner used for authorization.
    pub async fn set_board_owner(&self, owner_id: UserId) -> Result<(), Rejected> {
        self.send(Command::SetOwner(owner_id)).await
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> BoardSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that wakes whenever the snapshot changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BoardSnapshot> {
        self.snapshots.clone()
    }

    /// Notices published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop the session. In-flight requests still complete at the store but
    /// their responses are discarded.
    pub async fn close(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            debug!("session already closed");
        }
    }

    async fn request(&self, op: Local) -> Result<(), Rejected> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Local(op, reply)).await?;
        rx.await.map_err(|_| Rejected::SessionClosed)?
    }

    async fn send(&self, command: Command) -> Result<(), Rejected> {
        self.commands.send(command).await.map_err(|_| Rejected::SessionClosed)
    }
}

// =============================================================================
// DRIVER
// =============================================================================

struct Driver {
    core: SyncCore,
    store: Arc<dyn PersistenceStore>,
    directory: Arc<dyn UserDirectory>,
    internal: mpsc::Sender<Internal>,
    snapshots: watch::Sender<BoardSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl Driver {
    async fn run<S: ChangeStream>(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
        mut stream: S,
    ) {
        let board_id = self.core.board().board_id;
        info!(%board_id, user_id = %self.core.local_user(), "session opened");
        let effects = self.core.start();
        self.execute(effects);

        let mut streaming = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.command(command),
                },
                Some(message) = internal.recv() => self.settle(message),
                item = stream.next_item(), if streaming => match item {
                    Some(StreamItem::Change(event)) => {
                        let effects = self.core.apply_remote(event);
                        self.execute(effects);
                    }
                    Some(StreamItem::Reconnected) => {
                        let effects = self.core.on_reconnected();
                        self.execute(effects);
                    }
                    None => {
                        warn!(%board_id, "change stream ended; remote changes will no longer arrive");
                        streaming = false;
                    }
                },
            }
            self.publish();
        }
        info!(%board_id, "session closed");
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::Local(op, reply) => {
                let result = self.local(op);
                if reply.send(result).is_err() {
                    debug!("caller went away before the reply");
                }
            }
            Command::Create(draft, reply) => {
                let (placeholder, effects) = self.core.create(draft);
                self.execute(effects);
                if reply.send(placeholder).is_err() {
                    debug!(%placeholder, "caller went away before the reply");
                }
            }
            Command::SetOwner(owner_id) => self.core.set_board_owner(owner_id),
            Command::Shutdown => {}
        }
    }

    fn local(&mut self, op: Local) -> Result<(), Rejected> {
        let effects = match op {
            Local::MoveTo(id, position) => self.core.move_to(id, position)?,
            Local::Resize(id, size) => self.core.resize(id, size)?,
            Local::Content(id, content) => self.core.update_content(id, content)?,
            Local::Color(id, color) => self.core.change_color(id, color)?,
            Local::Style(id, style) => self.core.change_style(id, style)?,
            Local::Delete(id) => self.core.delete(id)?,
            Local::PointerUp(id) => self.core.pointer_up(id)?,
            Local::PointerDown(id, kind, pointer) => {
                self.core.pointer_down(id, kind, pointer)?;
                Vec::new()
            }
            Local::PointerMove(id, pointer) => {
                self.core.pointer_move(id, pointer)?;
                Vec::new()
            }
            Local::PointerCancel(id) => {
                self.core.pointer_cancel(id)?;
                Vec::new()
            }
        };
        self.execute(effects);
        Ok(())
    }

    fn settle(&mut self, message: Internal) {
        let effects = match message {
            Internal::Completed(completion) => self.core.complete(completion),
            Internal::CanonicalLoaded(result) => self.core.canonical_loaded(result),
            Internal::AuthorResolved(user_id, name) => {
                self.core.author_resolved(user_id, name);
                Vec::new()
            }
        };
        self.execute(effects);
    }

    fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Create { placeholder, element } => {
                    let store = Arc::clone(&self.store);
                    self.spawn_io(async move {
                        let result = store.create(&element).await;
                        Internal::Completed(Completion::Created { placeholder, result })
                    });
                }
                Effect::Update { id, patch, seq } => {
                    let store = Arc::clone(&self.store);
                    self.spawn_io(async move {
                        let result = store.update(id, &patch).await;
                        Internal::Completed(Completion::Updated { id, seq, result })
                    });
                }
                Effect::Delete { id, seq } => {
                    let store = Arc::clone(&self.store);
                    self.spawn_io(async move {
                        let result = store.delete(id).await;
                        Internal::Completed(Completion::Deleted { id, seq, result })
                    });
                }
                Effect::Reload { after } => {
                    let store = Arc::clone(&self.store);
                    let board_id = self.core.board().board_id;
                    self.spawn_io(async move {
                        if !after.is_zero() {
                            tokio::time::sleep(after).await;
                        }
                        Internal::CanonicalLoaded(store.list(board_id).await)
                    });
                }
                Effect::ResolveAuthor(user_id) => {
                    let directory = Arc::clone(&self.directory);
                    self.spawn_io(async move {
                        let name = match directory.display_name(user_id).await {
                            Ok(name) => name,
                            Err(e) => {
                                warn!(%user_id, error = %e, "author lookup failed");
                                None
                            }
                        };
                        Internal::AuthorResolved(user_id, name)
                    });
                }
                Effect::Notify(event) => self.notify(event),
            }
        }
    }

    fn spawn_io<F>(&self, work: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let tx = self.internal.clone();
        tokio::spawn(async move {
            let message = work.await;
            if tx.send(message).await.is_err() {
                debug!("session closed before the response arrived");
            }
        });
    }

    fn notify(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("no session event subscribers");
        }
    }

    fn publish(&self) {
        let next = self.core.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
