use super::*;
use crate::element::{ElementDraft, Point};
use crate::test_helpers::{self, serve_once};

fn id() -> ElementId {
    Uuid::new_v4()
}

// =============================================================
// classify_failure
// =============================================================

#[test]
fn not_found_status_maps_to_not_found() {
    let target = id();
    let err = classify_failure(StatusCode::NOT_FOUND, target, "");
    assert!(matches!(err, StoreError::NotFound(got) if got == target));
}

#[test]
fn auth_statuses_map_to_forbidden() {
    let target = id();
    assert!(matches!(classify_failure(StatusCode::FORBIDDEN, target, ""), StoreError::Forbidden(_)));
    assert!(matches!(classify_failure(StatusCode::UNAUTHORIZED, target, ""), StoreError::Forbidden(_)));
}

#[test]
fn no_rows_code_maps_to_not_found() {
    let body = r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#;
    assert!(matches!(classify_failure(StatusCode::NOT_ACCEPTABLE, id(), body), StoreError::NotFound(_)));
}

#[test]
fn other_failures_are_transient() {
    let err = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, id(), "  boom \n");
    match err {
        StoreError::Transient(message) => assert_eq!(message, "500 Internal Server Error: boom"),
        other => panic!("expected transient, got {other:?}"),
    }
    assert!(matches!(classify_failure(StatusCode::NOT_ACCEPTABLE, id(), "{}"), StoreError::Transient(_)));
}

#[test]
fn only_not_found_and_forbidden_invalidate() {
    assert!(StoreError::NotFound(id()).is_invalidating());
    assert!(StoreError::Forbidden(id()).is_invalidating());
    assert!(!StoreError::Transient("timeout".into()).is_invalidating());
}

// =============================================================
// RestStore
// =============================================================

fn config_for(api_url: String) -> SyncConfig {
    SyncConfig { api_url, api_key: "anon".into(), access_token: Some("jwt".into()), ..SyncConfig::default() }
}

#[test]
fn newline_in_key_is_rejected() {
    let config = SyncConfig { api_url: "http://127.0.0.1:1".into(), api_key: "bad\nkey".into(), ..SyncConfig::default() };
    assert!(matches!(RestStore::new(&config), Err(StoreError::InvalidHeader(_))));
}

#[test]
fn auth_headers_prefer_access_token() {
    let headers = auth_headers(&config_for("http://x".into())).unwrap();
    assert_eq!(headers.get("apikey").unwrap(), "anon");
    assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer jwt");

    let anon = SyncConfig { access_token: None, ..config_for("http://x".into()) };
    assert_eq!(auth_headers(&anon).unwrap().get(AUTHORIZATION).unwrap(), "Bearer anon");
}

#[tokio::test]
async fn update_sends_sparse_patch_and_returns_row() {
    let board = Uuid::new_v4();
    let author = Uuid::new_v4();
    let row = test_helpers::note(board, author, 10.0, 20.0);
    let body = serde_json::to_string(&vec![row.clone()]).unwrap();
    let (url, server) = serve_once("200 OK", body).await;

    let store = RestStore::new(&config_for(url)).unwrap();
    let updated = store.update(row.id, &ElementPatch::position(Point::new(10.0, 20.0))).await.unwrap();
    assert_eq!(updated.id, row.id);
    assert_eq!(updated.geometry.position, Point::new(10.0, 20.0));

    let request = server.await.unwrap();
    assert!(request.starts_with("PATCH /rest/v1/board_elements?id=eq."));
    assert!(request.to_ascii_lowercase().contains("prefer: return=representation"));
    assert!(request.contains(r#"{"position":{"x":10.0,"y":20.0}}"#));
}

#[tokio::test]
async fn update_with_empty_representation_is_not_found() {
    let (url, server) = serve_once("200 OK", "[]".into()).await;
    let store = RestStore::new(&config_for(url)).unwrap();
    let target = id();
    let err = store.update(target, &ElementPatch::content("x")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(got) if got == target));
    server.await.unwrap();
}

#[tokio::test]
async fn create_forbidden_maps_to_forbidden() {
    let (url, server) = serve_once("403 Forbidden", r#"{"message":"permission denied"}"#.into()).await;
    let store = RestStore::new(&config_for(url)).unwrap();
    let draft = NewElement::from_draft(ElementDraft::note(Point::new(0.0, 0.0)), Uuid::new_v4(), Uuid::new_v4());
    let err = store.create(&draft).await.unwrap_err();
    assert!(matches!(err, StoreError::Forbidden(_)));

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /rest/v1/board_elements"));
    assert!(request.contains(r#""type":"note""#));
}

#[tokio::test]
async fn list_queries_board_in_creation_order() {
    let board = Uuid::new_v4();
    let (url, server) = serve_once("200 OK", "[]".into()).await;
    let store = RestStore::new(&config_for(url)).unwrap();
    assert!(store.list(board).await.unwrap().is_empty());

    let request = server.await.unwrap();
    assert!(request.starts_with(&format!("GET /rest/v1/board_elements?board_id=eq.{board}")));
    assert!(request.contains("order=created_at.asc"));
}
