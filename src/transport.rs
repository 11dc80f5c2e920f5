//! Change-stream transport over a Phoenix-channel style websocket.
//!
//! DESIGN
//! ======
//! `RealtimeStream` owns a background task that connects, joins the board's
//! topic, forwards decoded change events into a bounded channel, and sends
//! heartbeats. When the socket drops it reconnects with exponential backoff
//! plus jitter. Every successful re-join after the first is reported as
//! `StreamItem::Reconnected`, because events may have been lost while the
//! socket was down.
//!
//! The session only sees the `ChangeStream` trait, so tests drive it with a
//! plain channel receiver.
//!
//! ERROR HANDLING
//! ==============
//! Connection-level failures end the current attempt and trigger a
//! reconnect; they never reach the session. Malformed payloads are logged
//! and dropped one message at a time.

#[cfg(test)]
#[path = "transport_test.rs"]
mod transport_test;

use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::consts::RECONNECT_BASE_MS;
use crate::element::{BoardId, Element, ElementId, UserId};
use crate::event::{ChangeEvent, StreamItem};

const CHANNEL_CAPACITY: usize = 256;
const JOIN_REF: &str = "1";
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const ELEMENTS_TABLE: &str = "board_elements";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tungstenite::Error>),
    #[error("websocket error: {0}")]
    Socket(Box<tungstenite::Error>),
    #[error("websocket closed")]
    Closed,
    #[error("timed out waiting for join reply")]
    Timeout,
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected change payload: {0}")]
    Malformed(String),
}

/// A source of change-stream items for one board.
#[async_trait::async_trait]
pub trait ChangeStream: Send {
    /// The next item, or `None` once the stream has ended for good.
    async fn next_item(&mut self) -> Option<StreamItem>;
}

#[async_trait::async_trait]
impl ChangeStream for mpsc::Receiver<StreamItem> {
    async fn next_item(&mut self) -> Option<StreamItem> {
        self.recv().await
    }
}

/// Connection tuning for `RealtimeStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub heartbeat: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Sent with the join so row-level security applies to the user.
    pub access_token: Option<String>,
}

impl StreamOptions {
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            heartbeat: config.heartbeat,
            reconnect_base: Duration::from_millis(RECONNECT_BASE_MS),
            reconnect_max: config.reconnect_max,
            access_token: config.access_token.clone(),
        }
    }
}

// =============================================================================
// REALTIME STREAM
// =============================================================================

/// Board-scoped change stream over the realtime websocket.
pub struct RealtimeStream {
    rx: mpsc::Receiver<StreamItem>,
    task: JoinHandle<()>,
}

impl RealtimeStream {
    /// Start following `board_id` on the realtime endpoint of `config`.
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(config: &SyncConfig, board_id: BoardId) -> Self {
        Self::spawn(config.realtime_url(), board_id, StreamOptions::from_config(config))
    }

    /// Start following `board_id` on an explicit websocket URL.
    #[must_use]
    pub fn spawn(url: String, board_id: BoardId, options: StreamOptions) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(run(url, board_id, options, tx));
        Self { rx, task }
    }
}

impl Drop for RealtimeStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait::async_trait]
impl ChangeStream for RealtimeStream {
    async fn next_item(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }
}

/// Topic name for a board's element changes.
#[must_use]
pub fn topic_for(board_id: BoardId) -> String {
    format!("realtime:board:{board_id}:elements")
}

/// Reconnect loop. Returns once the receiving side is gone.
async fn run(url: String, board_id: BoardId, options: StreamOptions, tx: mpsc::Sender<StreamItem>) {
    let topic = topic_for(board_id);
    let mut backoff = options.reconnect_base;
    let mut joined_once = false;

    loop {
        let mut joined = false;
        match follow(&url, &topic, board_id, &options, &tx, joined_once, &mut joined).await {
            Ok(()) => {
                debug!(%topic, "change stream receiver dropped; stopping");
                return;
            }
            Err(e) => warn!(%topic, error = %e, "change stream disconnected"),
        }
        if joined {
            joined_once = true;
            backoff = options.reconnect_base;
        }
        if tx.is_closed() {
            return;
        }

        let delay = with_jitter(backoff);
        info!(%topic, retry_ms = delay.as_millis(), "reconnecting change stream");
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(options.reconnect_max);
    }
}

/// One connection attempt: connect, join, then pump messages until the
/// socket fails (`Err`) or the receiver is dropped (`Ok`).
async fn follow(
    url: &str,
    topic: &str,
    board_id: BoardId,
    options: &StreamOptions,
    tx: &mpsc::Sender<StreamItem>,
    rejoin: bool,
    joined: &mut bool,
) -> Result<(), TransportError> {
    let (socket, _) = connect_async(url).await.map_err(|e| TransportError::Connect(Box::new(e)))?;
    let (mut write, mut read) = socket.split();

    let join = join_message(topic, board_id, options.access_token.as_deref());
    write.send(Message::text(join.to_string())).await.map_err(socket_error)?;
    tokio::time::timeout(JOIN_TIMEOUT, await_join(&mut read))
        .await
        .map_err(|_| TransportError::Timeout)??;
    *joined = true;
    info!(%topic, "joined change stream");

    if rejoin && tx.send(StreamItem::Reconnected).await.is_err() {
        return Ok(());
    }

    let mut heartbeat = tokio::time::interval_at(Instant::now() + options.heartbeat, options.heartbeat);
    let mut heartbeat_ref: u64 = 1;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                heartbeat_ref += 1;
                write.send(Message::text(heartbeat_message(heartbeat_ref).to_string())).await.map_err(socket_error)?;
            }
            () = tx.closed() => return Ok(()),
            message = read.next() => {
                let Some(message) = message else {
                    return Err(TransportError::Closed);
                };
                match message.map_err(socket_error)? {
                    Message::Text(text) => match parse_message(text.as_str()) {
                        Ok(Inbound::Change(event)) => {
                            if tx.send(StreamItem::Change(event)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(Inbound::ChannelError(reason)) => return Err(TransportError::Channel(reason)),
                        Ok(Inbound::Reply { .. } | Inbound::Other) => {}
                        Err(e) => warn!(%topic, error = %e, "dropping malformed change payload"),
                    },
                    Message::Close(_) => return Err(TransportError::Closed),
                    _ => {}
                }
            }
        }
    }
}

async fn await_join<S>(read: &mut S) -> Result<(), TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = read.next().await {
        let Message::Text(text) = message.map_err(socket_error)? else {
            continue;
        };
        match parse_message(text.as_str())? {
            Inbound::Reply { reference, ok, detail } if reference.as_deref() == Some(JOIN_REF) => {
                if ok {
                    return Ok(());
                }
                return Err(TransportError::JoinRejected(detail));
            }
            Inbound::ChannelError(reason) => return Err(TransportError::Channel(reason)),
            _ => {}
        }
    }
    Err(TransportError::Closed)
}

fn socket_error(e: tungstenite::Error) -> TransportError {
    TransportError::Socket(Box::new(e))
}

/// `base` plus up to a quarter of it, so clients don't reconnect in lockstep.
fn with_jitter(base: Duration) -> Duration {
    let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

pub(crate) fn join_message(topic: &str, board_id: BoardId, access_token: Option<&str>) -> Value {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [{
                "event": "*",
                "schema": "public",
                "table": ELEMENTS_TABLE,
                "filter": format!("board_id=eq.{board_id}"),
            }],
        },
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_owned());
    }
    json!({ "topic": topic, "event": "phx_join", "payload": payload, "ref": JOIN_REF })
}

pub(crate) fn heartbeat_message(reference: u64) -> Value {
    json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": reference.to_string() })
}

/// A decoded server message.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Change(ChangeEvent),
    Reply { reference: Option<String>, ok: bool, detail: String },
    ChannelError(String),
    Other,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
}

#[derive(Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// What survives of a deleted row. Without full replica identity only the
/// primary key is present.
#[derive(Deserialize)]
struct DeletedRow {
    id: ElementId,
    #[serde(default)]
    user_id: Option<UserId>,
}

pub(crate) fn parse_message(text: &str) -> Result<Inbound, TransportError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.event.as_str() {
        "postgres_changes" => {
            let payload: ChangePayload = serde_json::from_value(envelope.payload)?;
            parse_change(payload.data).map(Inbound::Change)
        }
        "phx_reply" => {
            let ok = envelope.payload.get("status").and_then(Value::as_str) == Some("ok");
            let detail = envelope.payload.get("response").map(Value::to_string).unwrap_or_default();
            Ok(Inbound::Reply { reference: envelope.reference, ok, detail })
        }
        "phx_error" | "phx_close" => Ok(Inbound::ChannelError(envelope.event)),
        _ => Ok(Inbound::Other),
    }
}

fn parse_change(data: ChangeData) -> Result<ChangeEvent, TransportError> {
    match data.kind.as_str() {
        "INSERT" => Ok(ChangeEvent::Insert(row(data.record)?)),
        "UPDATE" => Ok(ChangeEvent::Update(row(data.record)?)),
        "DELETE" => {
            let old = data.old_record.ok_or_else(|| TransportError::Malformed("delete without old_record".into()))?;
            let deleted: DeletedRow = serde_json::from_value(old)?;
            Ok(ChangeEvent::Delete { id: deleted.id, author: deleted.user_id })
        }
        other => Err(TransportError::Malformed(format!("unknown change type {other}"))),
    }
}

fn row(record: Option<Value>) -> Result<Element, TransportError> {
    let record = record.ok_or_else(|| TransportError::Malformed("change without record".into()))?;
    Ok(serde_json::from_value(record)?)
}
