//! Client-side sync engine for a collaborative whiteboard.
//!
//! One open board is reconciled from three sources: optimistic local edits,
//! change events from other participants arriving over a realtime stream,
//! and high-frequency drag/resize gestures that must not be persisted on
//! every frame. The server only broadcasts row changes; convergence is
//! decided here, per event, by applying it, ignoring it as an echo of a
//! recent local write, or treating it as authoritative.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`engine`] | [`engine::SyncCore`], the single writer, plus its effects and notices |
//! | [`pipeline`] | Optimistic mutations, gestures and persistence completions |
//! | [`router`] | Inbound change events |
//! | [`store`] | In-memory element store |
//! | [`gesture`] | Per-element drag/resize sessions |
//! | [`echo`] | Echo-suppression entries with expiry on read |
//! | [`element`] | Element, patch and draft types with their wire format |
//! | [`event`] | Change-stream events |
//! | [`session`] | Tokio driver that runs a core against live collaborators |
//! | [`persistence`] | Persistence trait and the REST store |
//! | [`directory`] | Author display-name lookup |
//! | [`transport`] | Realtime websocket change stream |
//! | [`config`] | Environment configuration |
//! | [`consts`] | Shared constants (windows, default and minimum sizes) |
//!
//! Unit tests run sessions against `memory`, an in-memory persistence store
//! with fault injection, compiled only for tests.

pub mod config;
pub mod consts;
pub mod directory;
pub mod echo;
pub mod element;
pub mod engine;
pub mod event;
pub mod gesture;
pub mod persistence;
pub mod pipeline;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
pub mod memory;
#[cfg(test)]
mod test_helpers;
