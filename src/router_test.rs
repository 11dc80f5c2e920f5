#![allow(clippy::float_cmp)]

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::element::{BoardId, Element, Point, UserId};
use crate::engine::{Completion, Rejected, SessionEvent};
use crate::gesture::GestureKind;
use crate::test_helpers;
use crate::transport::{Inbound, parse_message};

struct Fixture {
    board: BoardId,
    me: UserId,
    other: UserId,
    core: SyncCore,
}

fn fixture() -> Fixture {
    let board = Uuid::new_v4();
    let me = Uuid::new_v4();
    Fixture { board, me, other: Uuid::new_v4(), core: test_helpers::core(board, me, me) }
}

fn seed(f: &mut Fixture, element: &Element) {
    f.core.canonical_loaded(Ok(vec![element.clone()]));
}

fn position(f: &Fixture, element: &Element) -> Point {
    f.core.store().get(&element.id).unwrap().geometry.position
}

async fn advance_ms(millis: u64) {
    tokio::time::advance(Duration::from_millis(millis)).await;
}

/// Decode a realtime frame the way the transport does.
fn from_wire(kind: &str, record: Option<&Element>, old_record: serde_json::Value) -> ChangeEvent {
    let frame = json!({
        "topic": "realtime:board:x:elements",
        "event": "postgres_changes",
        "payload": { "data": { "type": kind, "record": record, "old_record": old_record } },
        "ref": null,
    });
    let Inbound::Change(event) = parse_message(&frame.to_string()).unwrap() else {
        panic!("expected a change frame");
    };
    event
}

// =============================================================
// Insert
// =============================================================

#[tokio::test(start_paused = true)]
async fn redelivered_insert_leaves_one_element() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);

    f.core.apply_remote(ChangeEvent::Insert(el.clone()));
    f.core.apply_remote(ChangeEvent::Insert(el.clone()));

    assert_eq!(f.core.store().len(), 1);
    assert_eq!(f.core.store().snapshot().iter().filter(|e| e.id == el.id).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn insert_by_local_author_is_an_echo() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.me, 0.0, 0.0);
    assert!(f.core.apply_remote(ChangeEvent::Insert(el.clone())).is_empty());
    assert!(!f.core.store().contains(&el.id));
}

#[tokio::test(start_paused = true)]
async fn foreign_insert_is_visible_before_its_author_name() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);

    let effects = f.core.apply_remote(ChangeEvent::Insert(el.clone()));

    assert_eq!(effects, vec![Effect::ResolveAuthor(f.other)]);
    assert_eq!(f.core.store().get(&el.id).unwrap().author_name, None);

    f.core.author_resolved(f.other, Some("grace".into()));
    assert_eq!(f.core.store().get(&el.id).unwrap().author_name.as_deref(), Some("grace"));

    // Known authors are attached on arrival.
    let second = test_helpers::note(f.board, f.other, 1.0, 1.0);
    assert!(f.core.apply_remote(ChangeEvent::Insert(second.clone())).is_empty());
    assert_eq!(f.core.store().get(&second.id).unwrap().author_name.as_deref(), Some("grace"));
}

#[tokio::test(start_paused = true)]
async fn events_for_other_boards_are_dropped() {
    let mut f = fixture();
    let el = test_helpers::note(Uuid::new_v4(), f.other, 0.0, 0.0);
    f.core.apply_remote(ChangeEvent::Insert(el.clone()));
    f.core.apply_remote(ChangeEvent::Update(el));
    assert!(f.core.store().is_empty());
}

// =============================================================
// Update
// =============================================================

#[tokio::test(start_paused = true)]
async fn stale_echo_within_window_does_not_regress_local_state() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.move_to(el.id, Point::new(10.0, 20.0)).unwrap();

    advance_ms(500).await;
    f.core.apply_remote(ChangeEvent::Update(el.clone()));
    assert_eq!(position(&f, &el), Point::new(10.0, 20.0));
}

#[tokio::test(start_paused = true)]
async fn stale_update_after_window_is_applied() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.move_to(el.id, Point::new(10.0, 20.0)).unwrap();

    advance_ms(1000).await;
    f.core.apply_remote(ChangeEvent::Update(el.clone()));
    assert_eq!(position(&f, &el), Point::new(0.0, 0.0));
    assert!(f.core.echo().entry(&el.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn foreign_update_without_local_write_is_applied() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.apply_remote(ChangeEvent::Update(test_helpers::moved(&el, 3.0, 3.0)));
    assert_eq!(position(&f, &el), Point::new(3.0, 3.0));
}

#[tokio::test(start_paused = true)]
async fn update_for_unknown_element_inserts_it() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    f.core.apply_remote(ChangeEvent::Update(el.clone()));
    assert!(f.core.store().contains(&el.id));
}

#[tokio::test(start_paused = true)]
async fn move_echo_redelivered_shows_final_position_once() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.me, 0.0, 0.0);
    seed(&mut f, &el);

    let effects = f.core.move_to(el.id, Point::new(10.0, 20.0)).unwrap();
    let Some(Effect::Update { seq, .. }) = effects.first() else {
        panic!("expected an update effect, got {effects:?}");
    };
    let row = test_helpers::moved(&el, 10.0, 20.0);
    advance_ms(120).await;
    f.core.complete(Completion::Updated { id: el.id, seq: *seq, result: Ok(row.clone()) });

    advance_ms(300).await;
    f.core.apply_remote(ChangeEvent::Update(row.clone()));
    f.core.apply_remote(ChangeEvent::Update(row));

    let matching: Vec<_> = f.core.store().snapshot().into_iter().filter(|e| e.id == el.id).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].geometry.position, Point::new(10.0, 20.0));
}

// =============================================================
// Gestures
// =============================================================

#[tokio::test(start_paused = true)]
async fn live_drag_suppresses_remote_updates_for_extended_window() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.pointer_down(el.id, GestureKind::Drag, Point::new(0.0, 0.0)).unwrap();
    f.core.pointer_move(el.id, Point::new(40.0, 0.0)).unwrap();

    // Past the ordinary window, inside the gesture window.
    advance_ms(2500).await;
    f.core.apply_remote(ChangeEvent::Update(test_helpers::moved(&el, -5.0, -5.0)));
    assert_eq!(position(&f, &el), Point::new(40.0, 0.0));

    advance_ms(1000).await;
    f.core.apply_remote(ChangeEvent::Update(test_helpers::moved(&el, -5.0, -5.0)));
    assert_eq!(position(&f, &el), Point::new(-5.0, -5.0));
}

#[tokio::test(start_paused = true)]
async fn drag_persists_once_and_suppresses_echo_of_terminal_write() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.pointer_down(el.id, GestureKind::Drag, Point::new(0.0, 0.0)).unwrap();

    for x in 1..=50 {
        f.core.pointer_move(el.id, Point::new(f64::from(x), 0.0)).unwrap();
        advance_ms(16).await;
    }
    let effects = f.core.pointer_up(el.id).unwrap();
    let persisted = effects.iter().filter(|e| matches!(e, Effect::Update { .. })).count();
    assert_eq!(persisted, 1);

    // A lagging intermediate frame echoing back is dropped.
    advance_ms(200).await;
    f.core.apply_remote(ChangeEvent::Update(test_helpers::moved(&el, 25.0, 0.0)));
    assert_eq!(position(&f, &el), Point::new(50.0, 0.0));
}

// =============================================================
// Delete
// =============================================================

#[tokio::test(start_paused = true)]
async fn foreign_delete_wins_over_echo_entry() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.move_to(el.id, Point::new(1.0, 1.0)).unwrap();
    assert!(f.core.echo().entry(&el.id).is_some());

    f.core.apply_remote(ChangeEvent::Delete { id: el.id, author: Some(f.other) });

    assert!(!f.core.store().contains(&el.id));
    assert!(f.core.echo().entry(&el.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn delete_mid_drag_clears_gesture() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.pointer_down(el.id, GestureKind::Drag, Point::new(0.0, 0.0)).unwrap();
    f.core.pointer_move(el.id, Point::new(10.0, 10.0)).unwrap();

    f.core.apply_remote(ChangeEvent::Delete { id: el.id, author: Some(f.other) });

    assert!(!f.core.store().contains(&el.id));
    assert!(!f.core.gestures().is_active(&el.id));
    assert_eq!(f.core.pointer_move(el.id, Point::new(20.0, 20.0)), Err(Rejected::NoGesture(el.id)));
    assert_eq!(f.core.pointer_up(el.id), Err(Rejected::NoGesture(el.id)));
}

#[tokio::test(start_paused = true)]
async fn own_delete_echo_is_absorbed() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.me, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.delete(el.id).unwrap();

    advance_ms(100).await;
    f.core.apply_remote(ChangeEvent::Delete { id: el.id, author: Some(f.me) });

    assert!(!f.core.store().contains(&el.id));
    assert!(f.core.echo().entry(&el.id).is_some());
}

#[tokio::test(start_paused = true)]
async fn response_for_remotely_deleted_element_does_not_resurrect_it() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.other, 0.0, 0.0);
    seed(&mut f, &el);
    let effects = f.core.move_to(el.id, Point::new(1.0, 1.0)).unwrap();
    let Some(Effect::Update { seq, .. }) = effects.first() else {
        panic!("expected an update effect, got {effects:?}");
    };

    f.core.apply_remote(ChangeEvent::Delete { id: el.id, author: None });
    let effects =
        f.core.complete(Completion::Updated { id: el.id, seq: *seq, result: Ok(test_helpers::moved(&el, 1.0, 1.0)) });

    assert!(!f.core.store().contains(&el.id));
    assert!(!effects.iter().any(|e| matches!(e, Effect::Notify(SessionEvent::Reloaded { .. }))));
}

#[tokio::test(start_paused = true)]
async fn collaborator_deleting_own_element_after_local_edit_wins() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.me, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.move_to(el.id, Point::new(5.0, 5.0)).unwrap();

    advance_ms(100).await;
    // The old record names the row's author, which is the local user.
    let event = from_wire("DELETE", None, json!({ "id": el.id, "user_id": f.me }));
    f.core.apply_remote(event);

    assert!(!f.core.store().contains(&el.id));
    assert!(f.core.echo().entry(&el.id).is_none());
    advance_ms(5000).await;
    assert!(!f.core.store().contains(&el.id));
}

#[tokio::test(start_paused = true)]
async fn wire_update_of_own_element_applies_after_window() {
    let mut f = fixture();
    let el = test_helpers::note(f.board, f.me, 0.0, 0.0);
    seed(&mut f, &el);
    f.core.move_to(el.id, Point::new(5.0, 5.0)).unwrap();

    advance_ms(300).await;
    let stale = test_helpers::moved(&el, 0.0, 0.0);
    f.core.apply_remote(from_wire("UPDATE", Some(&stale), serde_json::Value::Null));
    assert_eq!(position(&f, &el), Point::new(5.0, 5.0));

    advance_ms(1200).await;
    let foreign = test_helpers::moved(&el, 7.0, 7.0);
    f.core.apply_remote(from_wire("UPDATE", Some(&foreign), serde_json::Value::Null));
    assert_eq!(position(&f, &el), Point::new(7.0, 7.0));
}
