mod common;

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{Harness, joined, state_event, sync, with_state};
use murmur_client::error::ClientError;
use murmur_types::events::ClientEvent;
use murmur_types::ids::RoomId;

const ROOM: &str = "!r:x";

async fn seeded() -> Harness {
    let h = Harness::new();
    let room = with_state(
        joined(Vec::new(), true, None),
        vec![state_event("$n", "m.room.name", "", json!({"name": "Old name"}))],
    );
    h.client.apply_sync(sync("s1", vec![(ROOM, room)])).await.unwrap();
    h.take_pushed();
    h
}

#[tokio::test]
async fn include_members_fetches_before_returning() {
    let h = seeded().await;
    *h.fake.members.lock().unwrap() = vec![
        state_event("$m1", "m.room.member", "@bob:x", json!({"membership": "join"})),
        state_event("$m2", "m.room.member", "@carol:x", json!({"membership": "join"})),
    ];

    let cancel = CancellationToken::new();
    let without = h
        .client
        .get_room_state(&ROOM.into(), false, false, false, &cancel)
        .await
        .unwrap();
    assert_eq!(without.len(), 1);

    let with = h
        .client
        .get_room_state(&ROOM.into(), true, true, false, &cancel)
        .await
        .unwrap();
    assert_eq!(with.len(), 3);
    assert_eq!(*h.fake.member_calls.lock().unwrap(), 1);
    assert_eq!(*h.fake.state_calls.lock().unwrap(), 0);

    // Member-only refresh changes has_member_list but nothing is pushed
    // for a synchronous call.
    assert!(h.take_pushed().is_empty());
}

#[tokio::test]
async fn refetch_in_background_pushes_changed_room() {
    let h = seeded().await;
    *h.fake.state.lock().unwrap() = vec![
        state_event("$n2", "m.room.name", "", json!({"name": "New name"})),
        state_event("$m1", "m.room.member", "@bob:x", json!({"membership": "join"})),
    ];

    let cancel = CancellationToken::new();
    let returned = h
        .client
        .get_room_state(&ROOM.into(), false, false, true, &cancel)
        .await
        .unwrap();
    assert!(!returned.is_empty());

    let mut pushed = Vec::new();
    for _ in 0..200 {
        pushed = h.take_pushed();
        if !pushed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let Some(ClientEvent::SyncComplete(complete)) = pushed.first() else {
        panic!("expected a sync_complete push, got {:?}", pushed);
    };
    let meta = &complete.rooms[&RoomId::from(ROOM)].meta;
    assert_eq!(meta.name.as_deref(), Some("New name"));
    assert!(meta.has_member_list);
    assert!(complete.rooms[&RoomId::from(ROOM)].events.is_empty());
    assert_eq!(*h.fake.state_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn unknown_room_is_not_found() {
    let h = Harness::new();
    let err = h
        .client
        .get_room_state(&"!nope:x".into(), true, true, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RoomNotFound(_)));
    assert_eq!(err.errcode(), "NOT_FOUND");
}

#[tokio::test]
async fn cancelled_refresh_stores_nothing() {
    let h = seeded().await;
    *h.fake.members.lock().unwrap() = vec![state_event(
        "$m1",
        "m.room.member",
        "@bob:x",
        json!({"membership": "join"}),
    )];
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .client
        .get_room_state(&ROOM.into(), true, true, false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled));

    let state = h
        .client
        .get_room_state(&ROOM.into(), true, false, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(state.len(), 1);
}
