//! Shared fixtures for unit tests.

use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::element::{BoardId, Element, ElementDraft, NewElement, Point, UserId};
use crate::engine::{BoardRecord, SyncCore};

/// A committed note on `board` by `author` at `(x, y)`.
#[must_use]
pub fn note(board: BoardId, author: UserId, x: f64, y: f64) -> Element {
    NewElement::from_draft(ElementDraft::note(Point::new(x, y)), board, author)
        .into_element(Uuid::new_v4(), OffsetDateTime::now_utc())
}

/// A committed text block on `board` by `author`.
#[must_use]
pub fn text(board: BoardId, author: UserId) -> Element {
    NewElement::from_draft(ElementDraft::text(Point::new(0.0, 0.0)), board, author)
        .into_element(Uuid::new_v4(), OffsetDateTime::now_utc())
}

/// Copy of `element` moved to `(x, y)`.
#[must_use]
pub fn moved(element: &Element, x: f64, y: f64) -> Element {
    let mut copy = element.clone();
    copy.geometry.position = Point::new(x, y);
    copy
}

/// A sync core for `board` owned by `owner`, acting as `local`, with the
/// default windows.
#[must_use]
pub fn core(board: BoardId, owner: UserId, local: UserId) -> SyncCore {
    SyncCore::new(BoardRecord { board_id: board, owner_id: owner }, local, &SyncConfig::default())
}

/// Answer exactly one HTTP request with `status` and `body`, returning the
/// raw request text.
pub async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8_lossy(&raw).to_string()
    });
    (format!("http://{addr}"), handle)
}
