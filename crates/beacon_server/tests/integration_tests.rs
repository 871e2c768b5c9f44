//! End-to-end tests over real TCP sockets.
//!
//! Each test boots its own hub on an ephemeral port with its own temporary
//! configuration directory, then drives it with plain line-oriented clients.

use beacon_server::{Server, ServerSettings};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_TIMEOUT: Duration = Duration::from_millis(300);

struct TestHub {
    addr: SocketAddr,
    server: Arc<Server>,
    task: JoinHandle<()>,
    config_dir: tempfile::TempDir,
}

impl TestHub {
    /// Boots a hub with three provisioned keys and echo disabled, so tests
    /// only see the frames they ask for.
    async fn start() -> Self {
        Self::start_with(Duration::from_secs(60), false).await
    }

    async fn start_with(heartbeat_interval: Duration, echo_enabled: bool) -> Self {
        let config_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            config_dir.path().join("mapping.toml"),
            "auth = \"auth.toml\"\necho = \"echo.toml\"\n",
        )
        .unwrap();
        std::fs::write(
            config_dir.path().join("auth.toml"),
            "[keys]\n\"KEY-ALICE\" = \"Alice\"\n\"KEY-BOB\" = \"Bob\"\n\"KEY-DASH\" = \"Dashboard\"\n",
        )
        .unwrap();
        std::fs::write(
            config_dir.path().join("echo.toml"),
            format!("enabled = {echo_enabled}\n"),
        )
        .unwrap();

        let server = Arc::new(Server::new(ServerSettings {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval,
            config_directory: config_dir.path().to_path_buf(),
        }));
        server.setup().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        let task = tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });

        Self {
            addr,
            server,
            task,
            config_dir,
        }
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connects and consumes the greeting frame.
    async fn connect(addr: SocketAddr) -> Self {
        let (client, greeting) = Self::connect_raw(addr).await;
        assert!(
            greeting.get("version").is_some(),
            "greeting must advertise the protocol version, got {greeting}"
        );
        client
    }

    async fn connect_raw(addr: SocketAddr) -> (Self, Value) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        let greeting = client.recv().await;
        (client, greeting)
    }

    /// Connects and authenticates, then round-trips a `chat-history` request
    /// to be sure the registration is visible before returning. Heartbeat
    /// pings that slip in during the round trip are acknowledged.
    async fn connect_as(addr: SocketAddr, key: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&json!({ "api_key": key })).await;
        client.send(&json!({ "action": "chat-history" })).await;
        loop {
            let reply = client.recv().await;
            if reply["from"] == "chat" {
                break;
            }
            assert_eq!(reply["from"], "ping", "expected history ack, got {reply}");
            client
                .send(&json!({ "pong": reply["timestamp"].clone() }))
                .await;
        }
        client
    }

    async fn send(&mut self, frame: &Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed while a frame was expected");
        serde_json::from_str(&line).expect("server sent a non-JSON line")
    }

    /// Asserts that nothing arrives for a short while.
    async fn expect_quiet(&mut self) {
        if let Ok(line) = timeout(QUIET_TIMEOUT, self.lines.next_line()).await {
            panic!("expected no traffic, got {line:?}");
        }
    }

    async fn expect_closed(&mut self) {
        let eof = timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for the connection to close")
            .unwrap();
        assert_eq!(eof, None, "expected EOF, got a frame");
    }
}

#[tokio::test]
async fn greeting_is_the_first_frame() {
    let hub = TestHub::start().await;
    let (_client, greeting) = Client::connect_raw(hub.addr).await;
    assert!(greeting["version"].is_string());
}

#[tokio::test]
async fn malformed_line_gets_an_error_and_the_connection_survives() {
    let hub = TestHub::start().await;
    let mut client = Client::connect(hub.addr).await;

    client.writer.write_all(b"this is not json\n").await.unwrap();
    let reply = client.recv().await;
    assert_eq!(reply["error"], "No JSON object could be decoded");
    assert_eq!(reply["from"], "core");

    // A bare array parses but is not an object.
    client.writer.write_all(b"[1, 2, 3]\n").await.unwrap();
    let reply = client.recv().await;
    assert_eq!(reply["error"], "No JSON object could be decoded");

    // The connection is still usable.
    client.send(&json!({ "api_key": "KEY-ALICE" })).await;
    client.send(&json!({ "action": "chat-history" })).await;
    assert_eq!(client.recv().await["from"], "chat");
}

#[tokio::test]
async fn frame_without_a_key_is_rejected_with_code_4() {
    let hub = TestHub::start().await;
    let mut client = Client::connect(hub.addr).await;

    client.send(&json!({ "action": "chat-history" })).await;
    let reply = client.recv().await;
    assert_eq!(reply["code"], 4);
    assert_eq!(reply["from"], "auth");
    assert_eq!(reply["status"], "error");
    client.expect_closed().await;
}

#[tokio::test]
async fn unknown_key_is_rejected_with_code_3() {
    let hub = TestHub::start().await;
    let mut client = Client::connect(hub.addr).await;

    client.send(&json!({ "api_key": "KEY-NOBODY" })).await;
    let reply = client.recv().await;
    assert_eq!(reply["code"], 3);
    client.expect_closed().await;
}

#[tokio::test]
async fn non_string_key_is_rejected_with_code_3() {
    let hub = TestHub::start().await;
    let mut client = Client::connect(hub.addr).await;

    client.send(&json!({ "api_key": 12345 })).await;
    let reply = client.recv().await;
    assert_eq!(reply["code"], 3);
    client.expect_closed().await;
}

#[tokio::test]
async fn key_already_in_use_is_rejected_with_code_2() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;

    let mut imposter = Client::connect(hub.addr).await;
    imposter.send(&json!({ "api_key": "KEY-ALICE" })).await;
    let reply = imposter.recv().await;
    assert_eq!(reply["code"], 2);
    imposter.expect_closed().await;

    // The original holder is unaffected.
    alice.send(&json!({ "action": "chat-history" })).await;
    assert_eq!(alice.recv().await["from"], "chat");
}

#[tokio::test]
async fn re_sent_key_warns_with_code_1_but_stays_connected() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;

    alice.send(&json!({ "api_key": "KEY-ALICE" })).await;
    let reply = alice.recv().await;
    assert_eq!(reply["code"], 1);
    assert_eq!(reply["status"], "error");

    alice.send(&json!({ "action": "chat-history" })).await;
    assert_eq!(alice.recv().await["from"], "chat");
}

#[tokio::test]
async fn peers_hear_authentication_and_disconnection() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;

    let bob = Client::connect_as(hub.addr, "KEY-BOB").await;
    let announcement = alice.recv().await;
    assert_eq!(announcement["from"], "auth");
    assert_eq!(announcement["action"], "authenticated");
    assert_eq!(announcement["name"], "Bob");
    assert_eq!(announcement["status"], "success");

    drop(bob);
    let farewell = alice.recv().await;
    assert_eq!(farewell["action"], "disconnected");
    assert_eq!(farewell["name"], "Bob");
}

#[tokio::test]
async fn transient_clients_are_invisible_to_peers() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;

    let mut dashboard = Client::connect(hub.addr).await;
    dashboard
        .send(&json!({ "api_key": "KEY-DASH", "not_server": true }))
        .await;
    alice.expect_quiet().await;

    drop(dashboard);
    alice.expect_quiet().await;

    // The broadcast path still works for a real peer.
    let _bob = Client::connect_as(hub.addr, "KEY-BOB").await;
    assert_eq!(alice.recv().await["name"], "Bob");
}

#[tokio::test]
async fn chat_routes_to_its_target() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;
    let mut bob = Client::connect_as(hub.addr, "KEY-BOB").await;
    assert_eq!(alice.recv().await["name"], "Bob");

    alice
        .send(&json!({
            "action": "chat",
            "message": "hello over there",
            "user": "steve",
            "target": "Bob",
        }))
        .await;
    let relay = bob.recv().await;
    assert_eq!(relay["from"], "chat");
    assert_eq!(relay["message"], "hello over there");
    assert_eq!(relay["user"], "steve");
    assert_eq!(relay["source"], "Alice");
    alice.expect_quiet().await;
}

#[tokio::test]
async fn chat_to_an_unknown_target_reports_code_1() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;

    alice
        .send(&json!({
            "action": "chat",
            "message": "anyone home?",
            "user": "steve",
            "target": "Nobody",
        }))
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply["from"], "chat");
    assert_eq!(reply["code"], 1);
    assert_eq!(reply["error"], "Unable to locate server: Nobody");
}

#[tokio::test]
async fn untargeted_chat_reaches_every_other_peer() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;
    let mut bob = Client::connect_as(hub.addr, "KEY-BOB").await;
    assert_eq!(alice.recv().await["name"], "Bob");

    bob.send(&json!({ "action": "chat", "message": "hi all", "user": "eve" }))
        .await;
    let relay = alice.recv().await;
    assert_eq!(relay["message"], "hi all");
    assert_eq!(relay["source"], "Bob");
    bob.expect_quiet().await;

    bob.send(&json!({ "action": "chat-history" })).await;
    let history = bob.recv().await;
    let entries = history["history"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["message"], "hi all");
    assert_eq!(entries[0]["source"], "Bob");
}

#[tokio::test]
async fn presence_tracks_players_and_answers_list_requests() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;
    let mut bob = Client::connect_as(hub.addr, "KEY-BOB").await;
    assert_eq!(alice.recv().await["name"], "Bob");

    alice
        .send(&json!({ "action": "players", "type": "online", "player": "steve" }))
        .await;
    let update = bob.recv().await;
    assert_eq!(update["from"], "players");
    assert_eq!(update["type"], "online");
    assert_eq!(update["player"], "steve");
    assert_eq!(update["target"], "Alice");

    bob.send(&json!({ "action": "players", "type": "list", "target": "Alice" }))
        .await;
    let listing = bob.recv().await;
    assert_eq!(listing["players"], json!(["steve"]));
    assert_eq!(listing["target"], "Alice");

    bob.send(&json!({ "action": "players", "type": "list" }))
        .await;
    let listing = bob.recv().await;
    assert_eq!(listing["target"], "all");
    assert_eq!(listing["players"]["Alice"], json!(["steve"]));

    alice
        .send(&json!({ "action": "players", "type": "offline", "player": "steve" }))
        .await;
    let update = bob.recv().await;
    assert_eq!(update["type"], "offline");

    bob.send(&json!({ "action": "players", "type": "list", "target": "Alice" }))
        .await;
    assert_eq!(bob.recv().await["players"], json!([]));

    bob.send(&json!({ "action": "players", "type": "frobnicate" }))
        .await;
    let reply = bob.recv().await;
    assert_eq!(reply["error"], "Unknown action type: frobnicate");
}

#[tokio::test]
async fn presence_list_for_an_unknown_peer_is_an_error() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;

    alice
        .send(&json!({ "action": "players", "type": "list", "target": "Nobody" }))
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply["error"], "Unknown server: Nobody");
}

#[tokio::test]
async fn unanswered_pings_close_the_connection() {
    let hub = TestHub::start_with(Duration::from_millis(100), false).await;
    let mut client = Client::connect_as(hub.addr, "KEY-ALICE").await;

    // Swallow pings without ever acknowledging.
    loop {
        let frame = client.recv().await;
        if frame.get("error").is_some() {
            assert_eq!(frame["error"], "Ping timeout");
            assert_eq!(frame["from"], "core");
            break;
        }
        assert_eq!(frame["from"], "ping");
    }
    client.expect_closed().await;
}

#[tokio::test]
async fn answered_pings_keep_the_connection_alive() {
    let hub = TestHub::start_with(Duration::from_millis(100), false).await;
    let mut client = Client::connect_as(hub.addr, "KEY-ALICE").await;

    for _ in 0..6 {
        let ping = client.recv().await;
        assert_eq!(ping["from"], "ping", "unexpected frame: {ping}");
        client
            .send(&json!({ "pong": ping["timestamp"].clone() }))
            .await;
    }

    client.send(&json!({ "action": "chat-history" })).await;
    // Pings may interleave with the reply.
    loop {
        let frame = client.recv().await;
        if frame["from"] == "chat" {
            break;
        }
        assert_eq!(frame["from"], "ping");
        client
            .send(&json!({ "pong": frame["timestamp"].clone() }))
            .await;
    }
}

#[tokio::test]
async fn echo_returns_frames_when_enabled() {
    let hub = TestHub::start_with(Duration::from_secs(60), true).await;
    let mut client = Client::connect(hub.addr).await;

    // The successful authentication frame passes the gate uncancelled, so
    // echo bounces it back too.
    client.send(&json!({ "api_key": "KEY-ALICE" })).await;
    let echoed = client.recv().await;
    assert_eq!(echoed["api_key"], "KEY-ALICE");

    client.send(&json!({ "marker": 42 })).await;
    assert_eq!(client.recv().await["marker"], 42);
}

#[tokio::test]
async fn resent_key_frame_still_reaches_lower_priority_handlers() {
    let hub = TestHub::start_with(Duration::from_secs(60), true).await;
    let mut client = Client::connect(hub.addr).await;

    client.send(&json!({ "api_key": "KEY-ALICE" })).await;
    assert_eq!(client.recv().await["api_key"], "KEY-ALICE");

    // The gate warns first, then the frame travels on as ordinary traffic
    // and gets echoed.
    client
        .send(&json!({ "api_key": "KEY-ALICE", "marker": 7 }))
        .await;
    let warning = client.recv().await;
    assert_eq!(warning["code"], 1);
    assert_eq!(warning["from"], "auth");
    let echoed = client.recv().await;
    assert_eq!(echoed["marker"], 7);
    assert_eq!(echoed["api_key"], "KEY-ALICE");
}

#[tokio::test]
async fn rejected_frames_are_not_echoed() {
    let hub = TestHub::start_with(Duration::from_secs(60), true).await;
    let mut client = Client::connect(hub.addr).await;

    client.send(&json!({ "api_key": "KEY-NOBODY" })).await;
    let reply = client.recv().await;
    assert_eq!(reply["code"], 3, "the only reply is the gate's rejection");
    client.expect_closed().await;
}

#[tokio::test]
async fn shutdown_notifies_clients_and_stops_the_server() {
    let hub = TestHub::start().await;
    let mut alice = Client::connect_as(hub.addr, "KEY-ALICE").await;

    hub.server.shutdown();
    let notice = alice.recv().await;
    assert_eq!(notice["error"], "Server is shutting down");
    assert_eq!(notice["from"], "core");
    alice.expect_closed().await;

    timeout(RECV_TIMEOUT, hub.task)
        .await
        .expect("serve() should return after shutdown")
        .unwrap();

    // serve() drains the live set before tearing extensions down.
    assert_eq!(hub.server.hub().connection_count().await, 0);
}

#[tokio::test]
async fn rotated_keys_take_effect_without_a_restart() {
    let hub = TestHub::start().await;

    let mut early = Client::connect(hub.addr).await;
    early.send(&json!({ "api_key": "KEY-LATE" })).await;
    assert_eq!(early.recv().await["code"], 3);
    early.expect_closed().await;

    std::fs::write(
        hub.config_dir.path().join("auth.toml"),
        "[keys]\n\"KEY-LATE\" = \"Latecomer\"\n",
    )
    .unwrap();

    let _late = Client::connect_as(hub.addr, "KEY-LATE").await;
}
