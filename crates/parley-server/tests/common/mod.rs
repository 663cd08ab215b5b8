//! Shared harness for gateway integration tests: a real server on an
//! ephemeral port backed by a temp-file database and the in-process fabric.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parley_db::{create_pool, DbPool, DbRuntimeSettings};
use parley_identity::{create_user, issue_token, TokenSecret};
use parley_server::fabric::Fabric;
use parley_server::presence::{PresenceStore, SqlitePresence};
use parley_server::{app, AppState, GatewayLimits};
use parley_types::UserId;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ALICE: i64 = 1;
pub const BOB: i64 = 2;
pub const CAROL: i64 = 3;

pub const MAX_MESSAGE_LEN: usize = 4096;

const SECRET: &str = "gateway-test-secret";
const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub pool: DbPool,
    pub state: AppState,
    secret: TokenSecret,
    _db: tempfile::TempDir,
}

/// Starts a gateway with users alice (1), bob (2) and carol (3).
pub async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gateway.db");
    let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        parley_db::run_migrations(&conn).unwrap();
        create_user(&conn, UserId(ALICE), "alice").unwrap();
        create_user(&conn, UserId(BOB), "bob").unwrap();
        create_user(&conn, UserId(CAROL), "carol").unwrap();
    }

    let presence = PresenceStore::Sqlite(SqlitePresence::new(pool.clone(), "test-node"));
    let state = AppState::new(
        pool.clone(),
        TokenSecret::derive(SECRET),
        Fabric::local(64),
        presence,
        "test-node".to_string(),
        GatewayLimits {
            max_message_len: MAX_MESSAGE_LEN,
        },
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        pool,
        state,
        secret: TokenSecret::derive(SECRET),
        _db: dir,
    }
}

impl TestServer {
    pub fn token(&self, user: i64) -> String {
        issue_token(UserId(user), &self.secret, 300)
    }

    pub fn room_url(&self, user: i64, peer: i64) -> String {
        format!(
            "ws://{}/ws/chat/{}?token={}",
            self.addr,
            peer,
            self.token(user)
        )
    }

    pub fn notify_url(&self, user: i64) -> String {
        format!("ws://{}/ws/notify?token={}", self.addr, self.token(user))
    }

    /// Opens a room connection and waits until it has announced itself.
    pub async fn connect_room(&self, user: i64, peer: i64) -> Ws {
        let (mut ws, _) = connect_async(self.room_url(user, peer))
            .await
            .expect("room connection should be accepted");
        next_presence(&mut ws, user, "online").await;
        ws
    }

    /// Opens a notification connection and waits until it is subscribed.
    pub async fn connect_notify(&self, user: i64) -> Ws {
        let group = parley_server::rooms::notify_channel(UserId(user));
        let before = self.state.fabric.local_table().group_size(&group).await;
        let (ws, _) = connect_async(self.notify_url(user))
            .await
            .expect("notify connection should be accepted");
        self.wait_for_group(&group, before + 1).await;
        ws
    }

    /// Waits until `group` has exactly `size` local members.
    pub async fn wait_for_group(&self, group: &str, size: usize) {
        let table = self.state.fabric.local_table();
        tokio::time::timeout(WAIT, async {
            while table.group_size(group).await != size {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("group {group} never reached {size} members"));
    }

    /// Waits until every local connection has finished its cleanup.
    pub async fn wait_for_no_connections(&self) {
        let table = self.state.fabric.local_table();
        tokio::time::timeout(WAIT, async {
            while table.connection_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connections were never released");
    }

    /// Waits until the presence store agrees that `user` is `online`.
    pub async fn wait_for_presence(&self, user: i64, online: bool) {
        tokio::time::timeout(WAIT, async {
            while self.state.presence.contains(UserId(user)).await.unwrap() != online {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("user {user} never became online={online}"));
    }
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

pub async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next text frame as JSON. Panics on close or timeout.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Next frame that is not a presence event.
pub async fn next_non_presence(ws: &mut Ws) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] != "presence" {
            return frame;
        }
    }
}

/// Skips frames until one of type `ty` arrives.
pub async fn next_of_type(ws: &mut Ws, ty: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == ty {
            return frame;
        }
    }
}

/// Skips frames until `user` is reported with `status`.
pub async fn next_presence(ws: &mut Ws, user: i64, status: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == "presence" && frame["user_id"] == user && frame["status"] == status {
            return frame;
        }
    }
}

/// Waits for the server's close frame and returns its code and reason.
pub async fn next_close(ws: &mut Ws) -> (u16, String) {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without a close frame")
            .expect("websocket error");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame should carry a code");
            return (u16::from(frame.code), frame.reason.as_str().to_string());
        }
    }
}
