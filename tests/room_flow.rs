//! End-to-end tests for the room coordination core, driven over the same
//! command/event channels the WebSocket sessions use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use typerush::config::PassagePool;
use typerush::directory::{MemoryDirectory, RoomDirectory};
use typerush::presence::{PresenceMirror, StatsUpdate};
use typerush::room::{Registry, RoomCommand, RoomContext, RoomEvent, RoomHandle, open_room};
use typerush::types::{PlayerView, ServerMsg};

struct TestRoom {
    registry: Arc<Registry>,
    mirror: PresenceMirror,
    handle: RoomHandle,
    events: broadcast::Receiver<RoomEvent>,
}

fn open_test_room(room_id: &str) -> TestRoom {
    let registry = Registry::new();
    let directory = Arc::new(MemoryDirectory::new());
    let mirror = PresenceMirror::default();
    let ctx = RoomContext {
        directory,
        passages: Arc::new(PassagePool::from_passages(vec![
            "alpha beta gamma delta".to_string(),
        ])),
        mirror: Some(mirror.clone()),
    };
    let handle = open_room(&registry, room_id, ctx);
    let events = handle.event_tx.subscribe();
    TestRoom {
        registry,
        mirror,
        handle,
        events,
    }
}

async fn recv_event(rx: &mut broadcast::Receiver<RoomEvent>) -> RoomEvent {
    timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for room event")
        .expect("room event channel closed")
}

fn broadcast_msg(event: RoomEvent) -> ServerMsg {
    match event {
        RoomEvent::Broadcast { msg } => msg,
        other => panic!("expected broadcast, got {other:?}"),
    }
}

fn players(event: RoomEvent) -> Vec<PlayerView> {
    match broadcast_msg(event) {
        ServerMsg::PlayersUpdate { players } => players,
        other => panic!("expected players:update, got {other:?}"),
    }
}

fn assert_no_pending_events(room: &mut TestRoom) {
    match room.events.try_recv() {
        Err(broadcast::error::TryRecvError::Empty) => {}
        other => panic!("expected no pending events, got {other:?}"),
    }
}

async fn join(room: &mut TestRoom, conn: &str, name: &str) -> Vec<PlayerView> {
    room.handle
        .cmd_tx
        .send(RoomCommand::Join {
            conn_id: conn.to_string(),
            username: name.to_string(),
        })
        .await
        .unwrap();
    players(recv_event(&mut room.events).await)
}

fn stats(progress: f64, is_final: bool) -> StatsUpdate {
    StatsUpdate {
        username: None,
        wpm: 60.0,
        accuracy: 97.0,
        progress,
        is_final,
    }
}

async fn send(room: &TestRoom, cmd: RoomCommand) {
    room.handle.cmd_tx.send(cmd).await.unwrap();
}

async fn wait_until_closed(room: &TestRoom) {
    for _ in 0..100 {
        if room.registry.get(&room.handle.room_id).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {} was never removed from the registry", room.handle.room_id);
}

#[tokio::test]
async fn first_joiner_becomes_host_and_ties_order_by_username() {
    let mut room = open_test_room("42");

    let view = join(&mut room, "c-alice", "alice").await;
    assert_eq!(view.len(), 1);
    assert!(view[0].is_host);
    assert_eq!(view[0].progress, 0);

    let view = join(&mut room, "c-bob", "bob").await;
    assert_eq!(view.len(), 2);
    assert_eq!(view.iter().filter(|p| p.is_host).count(), 1);
    // Progress tie: ascending username.
    assert_eq!(view[0].username, "alice");
    assert!(view[0].is_host);
    assert_eq!(view[1].username, "bob");
    assert!(!view[1].is_host);

    assert_eq!(room.mirror.participant_count("42"), 2);
}

#[tokio::test]
async fn non_host_start_is_rejected_to_issuer_only() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;
    join(&mut room, "c-bob", "bob").await;

    send(
        &room,
        RoomCommand::Start {
            conn_id: "c-bob".to_string(),
            text: None,
            duration: Some(json!(30)),
        },
    )
    .await;

    match recv_event(&mut room.events).await {
        RoomEvent::SendTo { conn_id, msg } => {
            assert_eq!(conn_id, "c-bob");
            match msg {
                ServerMsg::Error { message } => {
                    assert_eq!(message, "Only the host can start the game");
                }
                other => panic!("expected error, got {other:?}"),
            }
        }
        other => panic!("expected scoped error, got {other:?}"),
    }
    assert_no_pending_events(&mut room);
}

#[tokio::test]
async fn host_start_resets_stats_and_broadcasts_game_start() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;
    join(&mut room, "c-bob", "bob").await;

    send(
        &room,
        RoomCommand::UpdateStats {
            conn_id: "c-bob".to_string(),
            update: stats(100.0, true),
        },
    )
    .await;
    recv_event(&mut room.events).await;

    send(
        &room,
        RoomCommand::Start {
            conn_id: "c-alice".to_string(),
            text: Some("race me".to_string()),
            duration: Some(json!(5)),
        },
    )
    .await;

    let view = players(recv_event(&mut room.events).await);
    assert!(view.iter().all(|p| p.progress == 0 && p.wpm == 0));

    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::GameStart {
            text,
            duration,
            host_id,
            room_id,
            ..
        } => {
            assert_eq!(text, "race me");
            // Out-of-range durations clamp to the nearest bound.
            assert_eq!(duration, 10);
            assert_eq!(host_id, "c-alice");
            assert_eq!(room_id, "42");
        }
        other => panic!("expected game:start, got {other:?}"),
    }
}

#[tokio::test]
async fn start_without_text_picks_a_passage() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;

    send(
        &room,
        RoomCommand::Start {
            conn_id: "c-alice".to_string(),
            text: None,
            duration: None,
        },
    )
    .await;

    players(recv_event(&mut room.events).await);
    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::GameStart { text, duration, .. } => {
            assert_eq!(text, "alpha beta gamma delta");
            assert_eq!(duration, 30);
        }
        other => panic!("expected game:start, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stop_timer_fires_after_the_race_duration() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;

    send(
        &room,
        RoomCommand::Start {
            conn_id: "c-alice".to_string(),
            text: None,
            duration: Some(json!(10)),
        },
    )
    .await;
    players(recv_event(&mut room.events).await);
    broadcast_msg(recv_event(&mut room.events).await);

    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::GameStopTyping { room_id, .. } => assert_eq!(room_id, "42"),
        other => panic!("expected game:stopTyping, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn restart_cancels_the_pending_stop_timer() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;

    send(
        &room,
        RoomCommand::Start {
            conn_id: "c-alice".to_string(),
            text: None,
            duration: Some(json!(10)),
        },
    )
    .await;
    players(recv_event(&mut room.events).await);
    broadcast_msg(recv_event(&mut room.events).await);

    send(
        &room,
        RoomCommand::Restart {
            conn_id: "c-alice".to_string(),
            text: None,
            duration: Some(json!(20)),
        },
    )
    .await;
    players(recv_event(&mut room.events).await);
    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::GameRestart { duration, .. } => assert_eq!(duration, 20),
        other => panic!("expected game:restart, got {other:?}"),
    }

    // Let the stale timer for the first race fire and be discarded.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_no_pending_events(&mut room);

    // A fresh start arms a fresh timer.
    send(
        &room,
        RoomCommand::Start {
            conn_id: "c-alice".to_string(),
            text: None,
            duration: Some(json!(15)),
        },
    )
    .await;
    players(recv_event(&mut room.events).await);
    broadcast_msg(recv_event(&mut room.events).await);
    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::GameStopTyping { room_id, .. } => assert_eq!(room_id, "42"),
        other => panic!("expected game:stopTyping, got {other:?}"),
    }
}

#[tokio::test]
async fn progress_broadcasts_throttle_except_final_reports() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;
    join(&mut room, "c-bob", "bob").await;

    // Within 200ms of the join broadcast: a non-final report is suppressed,
    // the final one right behind it still goes out.
    send(
        &room,
        RoomCommand::UpdateStats {
            conn_id: "c-bob".to_string(),
            update: stats(50.0, false),
        },
    )
    .await;
    send(
        &room,
        RoomCommand::UpdateStats {
            conn_id: "c-bob".to_string(),
            update: stats(100.0, true),
        },
    )
    .await;

    let view = players(recv_event(&mut room.events).await);
    assert_eq!(view[0].username, "bob");
    assert_eq!(view[0].progress, 100);
    assert_no_pending_events(&mut room);

    // Once the throttle window has passed, non-final reports broadcast too.
    tokio::time::sleep(Duration::from_millis(250)).await;
    send(
        &room,
        RoomCommand::UpdateStats {
            conn_id: "c-alice".to_string(),
            update: stats(30.0, false),
        },
    )
    .await;
    let view = players(recv_event(&mut room.events).await);
    assert_eq!(view[1].username, "alice");
    assert_eq!(view[1].progress, 30);
}

#[tokio::test]
async fn stats_reports_for_unknown_participants_are_ignored() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;

    send(
        &room,
        RoomCommand::UpdateStats {
            conn_id: "c-ghost".to_string(),
            update: stats(100.0, true),
        },
    )
    .await;

    // The next observable event is the next join, not a broadcast for the
    // unknown connection.
    let view = join(&mut room, "c-bob", "bob").await;
    assert_eq!(view.len(), 2);
}

#[tokio::test]
async fn chat_messages_are_stamped_and_oversized_ones_dropped() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;

    send(
        &room,
        RoomCommand::Chat {
            conn_id: "c-alice".to_string(),
            user: Some("alice".to_string()),
            text: "x".repeat(501),
        },
    )
    .await;
    send(
        &room,
        RoomCommand::Chat {
            conn_id: "c-alice".to_string(),
            user: Some("alice".to_string()),
            text: "  hello room  ".to_string(),
        },
    )
    .await;

    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::Chat {
            id, user, text, time,
        } => {
            assert!(id.starts_with("msg_"));
            assert_eq!(user, "alice");
            assert_eq!(text, "hello room");
            assert!(time > 0);
        }
        other => panic!("expected chat message, got {other:?}"),
    }
    assert_no_pending_events(&mut room);
}

#[tokio::test]
async fn end_game_is_host_only_and_broadcasts_game_end() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;
    join(&mut room, "c-bob", "bob").await;

    send(&room, RoomCommand::End { conn_id: "c-bob".to_string() }).await;
    match recv_event(&mut room.events).await {
        RoomEvent::SendTo { conn_id, msg } => {
            assert_eq!(conn_id, "c-bob");
            match msg {
                ServerMsg::Error { message } => assert_eq!(message, "Only host can end game"),
                other => panic!("expected error, got {other:?}"),
            }
        }
        other => panic!("expected scoped error, got {other:?}"),
    }

    send(&room, RoomCommand::End { conn_id: "c-alice".to_string() }).await;
    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::GameEnd { room_id, ended_by } => {
            assert_eq!(room_id, "42");
            assert_eq!(ended_by, "c-alice");
        }
        other => panic!("expected game:end, got {other:?}"),
    }
}

#[tokio::test]
async fn non_host_departure_broadcasts_players_update() {
    let mut room = open_test_room("42");
    join(&mut room, "c-alice", "alice").await;
    join(&mut room, "c-bob", "bob").await;

    send(&room, RoomCommand::Leave { conn_id: "c-bob".to_string() }).await;
    let view = players(recv_event(&mut room.events).await);
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].username, "alice");

    // A second leave for the same connection is a no-op: the next event is
    // the next join's roster.
    send(&room, RoomCommand::Leave { conn_id: "c-bob".to_string() }).await;
    let view = join(&mut room, "c-carol", "carol").await;
    assert_eq!(view.len(), 2);
}

#[tokio::test]
async fn host_departure_tears_the_room_down() {
    let registry = Registry::new();
    let directory = Arc::new(MemoryDirectory::new());
    let record = directory
        .create("sprint", "passage", Some("alice"))
        .await
        .unwrap();
    let mirror = PresenceMirror::default();
    let ctx = RoomContext {
        directory: directory.clone(),
        passages: Arc::new(PassagePool::from_passages(vec!["p".to_string()])),
        mirror: Some(mirror.clone()),
    };
    let handle = open_room(&registry, &record.id, ctx);
    let mut events = handle.event_tx.subscribe();

    for (conn, name) in [("c-alice", "alice"), ("c-bob", "bob")] {
        handle
            .cmd_tx
            .send(RoomCommand::Join {
                conn_id: conn.to_string(),
                username: name.to_string(),
            })
            .await
            .unwrap();
        recv_event(&mut events).await;
    }

    handle
        .cmd_tx
        .send(RoomCommand::Disconnect {
            conn_id: "c-alice".to_string(),
            reason: "transport error".to_string(),
        })
        .await
        .unwrap();

    match broadcast_msg(recv_event(&mut events).await) {
        ServerMsg::RoomDeleted { room_id } => assert_eq!(room_id, record.id),
        other => panic!("expected room:deleted, got {other:?}"),
    }

    for _ in 0..100 {
        if registry.get(&record.id).is_none()
            && directory.find(&record.id).await.unwrap().is_none()
            && mirror.participant_count(&record.id) == 0
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room state was not fully torn down");
}

#[tokio::test]
async fn full_race_scenario() {
    let mut room = open_test_room("42");

    let view = join(&mut room, "c-h", "hanna").await;
    assert_eq!(view.len(), 1);
    assert!(view[0].is_host);

    let view = join(&mut room, "c-p", "piotr").await;
    assert_eq!(
        view.iter().map(|p| p.username.as_str()).collect::<Vec<_>>(),
        ["hanna", "piotr"]
    );

    send(
        &room,
        RoomCommand::Start {
            conn_id: "c-h".to_string(),
            text: Some("shared passage".to_string()),
            duration: Some(json!(30)),
        },
    )
    .await;
    players(recv_event(&mut room.events).await);
    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::GameStart { duration, .. } => assert_eq!(duration, 30),
        other => panic!("expected game:start, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    send(
        &room,
        RoomCommand::UpdateStats {
            conn_id: "c-p".to_string(),
            update: stats(50.0, false),
        },
    )
    .await;
    let view = players(recv_event(&mut room.events).await);
    assert_eq!(view[0].username, "piotr");
    assert_eq!(view[0].progress, 50);

    send(
        &room,
        RoomCommand::UpdateStats {
            conn_id: "c-p".to_string(),
            update: stats(100.0, true),
        },
    )
    .await;
    let view = players(recv_event(&mut room.events).await);
    assert_eq!(view[0].username, "piotr");
    assert_eq!(view[0].progress, 100);
    assert_eq!(view[1].username, "hanna");

    send(
        &room,
        RoomCommand::Disconnect {
            conn_id: "c-h".to_string(),
            reason: "connection closed".to_string(),
        },
    )
    .await;
    match broadcast_msg(recv_event(&mut room.events).await) {
        ServerMsg::RoomDeleted { room_id } => assert_eq!(room_id, "42"),
        other => panic!("expected room:deleted, got {other:?}"),
    }
    wait_until_closed(&room).await;
}
