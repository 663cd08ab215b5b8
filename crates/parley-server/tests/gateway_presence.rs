mod common;

use common::*;
use futures_util::SinkExt;
use parley_server::rooms::room_name;
use parley_types::UserId;
use serde_json::json;

#[tokio::test]
async fn joining_announces_online_to_the_room() {
    let server = spawn_server().await;
    let mut alice = server.connect_room(ALICE, BOB).await;
    let _bob = server.connect_room(BOB, ALICE).await;

    let event = next_presence(&mut alice, BOB, "online").await;
    assert_eq!(event, json!({"type": "presence", "user_id": BOB, "status": "online"}));
    server.wait_for_presence(BOB, true).await;
}

#[tokio::test]
async fn late_joiner_learns_the_peer_is_already_online() {
    let server = spawn_server().await;
    let _alice = server.connect_room(ALICE, BOB).await;

    // Alice announced herself before bob existed; bob's probe makes her
    // announce again.
    let (mut bob, _) = tokio_tungstenite::connect_async(server.room_url(BOB, ALICE))
        .await
        .unwrap();
    next_presence(&mut bob, ALICE, "online").await;
}

#[tokio::test]
async fn probes_are_never_delivered_to_clients() {
    let server = spawn_server().await;
    let mut alice = server.connect_room(ALICE, BOB).await;
    let _bob = server.connect_room(BOB, ALICE).await;

    send_json(&mut alice, json!({"message": "sentinel"})).await;
    loop {
        let frame = next_json(&mut alice).await;
        assert_ne!(frame["type"], "presence_probe");
        if frame["type"] == "chat_message" {
            break;
        }
    }
}

#[tokio::test]
async fn offline_is_announced_only_when_the_last_connection_closes() {
    let server = spawn_server().await;
    let mut bob = server.connect_room(BOB, ALICE).await;
    let mut tab1 = server.connect_room(ALICE, BOB).await;
    let mut tab2 = server.connect_room(ALICE, BOB).await;

    tab1.close(None).await.unwrap();
    drop(tab1);

    // Wait for the first release to land, then prove bob heard nothing
    // about it: the next non-online frame he sees is the sentinel.
    let room = room_name(UserId(ALICE), UserId(BOB));
    server.wait_for_group(&room, 2).await;
    server.wait_for_presence(ALICE, true).await;
    send_json(&mut bob, json!({"message": "sentinel"})).await;
    loop {
        let frame = next_json(&mut bob).await;
        assert_ne!(frame["status"], "offline", "offline announced while a tab is open");
        if frame["type"] == "chat_message" {
            break;
        }
    }

    tab2.close(None).await.unwrap();
    drop(tab2);

    next_presence(&mut bob, ALICE, "offline").await;
    server.wait_for_presence(ALICE, false).await;

    send_json(&mut bob, json!({"message": "second sentinel"})).await;
    loop {
        let frame = next_json(&mut bob).await;
        assert_ne!(frame["status"], "offline", "offline announced twice");
        if frame["type"] == "chat_message" {
            break;
        }
    }
}

#[tokio::test]
async fn typing_reaches_the_peer_but_never_the_sender() {
    let server = spawn_server().await;
    let mut alice = server.connect_room(ALICE, BOB).await;
    let mut alice_tab = server.connect_room(ALICE, BOB).await;
    let mut bob = server.connect_room(BOB, ALICE).await;

    send_json(&mut alice, json!({"type": "typing", "is_typing": true})).await;

    let event = next_non_presence(&mut bob).await;
    assert_eq!(event, json!({"type": "typing", "is_typing": true, "sender_id": ALICE}));

    // Neither of alice's connections sees her own indicator.
    send_json(&mut bob, json!({"message": "sentinel"})).await;
    for ws in [&mut alice, &mut alice_tab] {
        let frame = next_non_presence(ws).await;
        assert_eq!(frame["type"], "chat_message");
        assert_eq!(frame["message"], "sentinel");
    }
}

#[tokio::test]
async fn notification_connection_keeps_the_user_online() {
    let server = spawn_server().await;
    let room = server.connect_room(ALICE, BOB).await;
    let mut notify = server.connect_notify(ALICE).await;
    server.wait_for_presence(ALICE, true).await;

    drop(room);
    // The room connection's release must not take the user offline.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    server.wait_for_presence(ALICE, true).await;

    notify.close(None).await.unwrap();
    server.wait_for_presence(ALICE, false).await;
}

#[tokio::test]
async fn offline_reaches_every_room_the_user_was_in() {
    let server = spawn_server().await;
    let mut bob = server.connect_room(BOB, ALICE).await;
    let mut carol = server.connect_room(CAROL, ALICE).await;
    let mut with_bob = server.connect_room(ALICE, BOB).await;
    let mut with_carol = server.connect_room(ALICE, CAROL).await;
    let mut notify = server.connect_notify(ALICE).await;

    // Both rooms close while the notification channel keeps alice online.
    with_bob.close(None).await.unwrap();
    with_carol.close(None).await.unwrap();
    server
        .wait_for_group(&room_name(UserId(ALICE), UserId(BOB)), 1)
        .await;
    server
        .wait_for_group(&room_name(UserId(ALICE), UserId(CAROL)), 1)
        .await;
    server.wait_for_presence(ALICE, true).await;

    // The last connection to go is not in any room, yet both rooms hear it.
    notify.close(None).await.unwrap();
    next_presence(&mut bob, ALICE, "offline").await;
    next_presence(&mut carol, ALICE, "offline").await;
    server.wait_for_presence(ALICE, false).await;
}
