//! End-to-end shard lifecycle tests against an in-process fake gateway.
//!
//! Each test stands up a real websocket server, points a manager at it
//! and drives the protocol from the server side: HELLO, READY,
//! dispatches, invalid sessions, close codes. Events are observed on a
//! channel-backed publisher.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use courier_gateway::config::{
    BotConfig, EventConfig, GatewayDescriptor, ManagerConfig, MessagingConfig, SessionStartLimit,
    ShardingConfig,
};
use courier_gateway::dispatch::{CourierPayload, PassthroughState};
use courier_gateway::metrics::GatewayMetrics;
use courier_gateway::publisher::ChannelPublisher;
use courier_gateway::shard::{GroupStatus, ShardStatus};
use courier_gateway::supervisor::Courier;
use courier_gateway::Manager;

/// A fake gateway listening on a random local port.
struct FakeGateway {
    listener: TcpListener,
    url: String,
}

impl FakeGateway {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    /// Accept one shard connection and complete the websocket handshake.
    async fn accept(&self) -> GatewayConn {
        let (stream, _) = self.listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        GatewayConn { ws }
    }

    /// Accept a raw TCP connection and drop it before the handshake.
    async fn refuse(&self) {
        let (stream, _) = self.listener.accept().await.unwrap();
        drop(stream);
    }
}

/// Server side of one shard connection.
struct GatewayConn {
    ws: WebSocketStream<TcpStream>,
}

impl GatewayConn {
    async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn hello(&mut self, interval_ms: u64) {
        self.send_json(json!({
            "op": 10,
            "d": { "heartbeat_interval": interval_ms }
        }))
        .await;
    }

    /// Next client frame as JSON, acking heartbeats along the way.
    async fn recv_command(&mut self) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(10), self.ws.next())
                .await
                .expect("timed out waiting for client frame")
                .expect("client hung up")
                .expect("client frame errored");

            let text = match msg {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => panic!("client closed unexpectedly"),
                _ => continue,
            };

            let value: Value = serde_json::from_str(&text).unwrap();
            if value["op"] == 1 {
                self.send_json(json!({"op": 11, "d": null})).await;
                continue;
            }
            return value;
        }
    }

    /// Like `recv_command` but never acks, and returns heartbeats too.
    async fn recv_raw(&mut self) -> Option<Value> {
        loop {
            let msg = timeout(Duration::from_secs(10), self.ws.next())
                .await
                .ok()??
                .ok()?;
            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text.to_string()).ok();
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn close_with(mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.ws.send(Message::Close(Some(frame))).await;
        // Drain until the peer acknowledges the close
        while let Some(Ok(_)) = self.ws.next().await {}
    }
}

struct Harness {
    courier: Arc<Courier>,
    manager: Arc<Manager>,
    group_id: i32,
    bus: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
}

/// Boot a supervisor with one manager pointed at the fake gateway and
/// open a single-shard group.
async fn start_daemon(gateway_url: &str, bot: BotConfig) -> Harness {
    let courier = Arc::new(Courier::new(64, GatewayMetrics::disabled()));

    let config = ManagerConfig {
        identifier: "test".to_string(),
        display_name: "Test".to_string(),
        token: "bot-token".to_string(),
        bot,
        sharding: ShardingConfig {
            auto_sharded: false,
            shard_count: 1,
        },
        messaging: MessagingConfig {
            client_name: "test".to_string(),
            channel_name: "events".to_string(),
            use_random_suffix: false,
        },
        events: EventConfig::default(),
        gateway: GatewayDescriptor {
            url: gateway_url.to_string(),
            shards: 1,
            session_start_limit: SessionStartLimit::default(),
        },
    };

    let manager = courier
        .create_manager(config, Arc::new(PassthroughState))
        .unwrap();
    let (publisher, bus) = ChannelPublisher::new();
    manager.open(publisher);

    let (group_id, _ready) = manager.scale(vec![0], 1, true).await.unwrap();

    Harness {
        courier,
        manager,
        group_id,
        bus,
    }
}

fn fast_bot() -> BotConfig {
    BotConfig {
        retries: 2,
        ..BotConfig::default()
    }
}

/// Wait for the next envelope of a given type, skipping daemon status
/// messages and unrelated events.
async fn next_envelope_of(
    bus: &mut mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    event_type: &str,
) -> CourierPayload {
    loop {
        let (channel, bytes) = timeout(Duration::from_secs(10), bus.recv())
            .await
            .expect("timed out waiting for bus message")
            .expect("bus closed");
        assert_eq!(channel, "events");

        let payload: CourierPayload = rmp_serde::from_slice(&bytes).unwrap();
        if payload.event_type == event_type {
            return payload;
        }
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Drive a connection through HELLO -> IDENTIFY -> READY.
async fn handshake(conn: &mut GatewayConn, session_id: &str) -> Value {
    conn.hello(41250).await;
    let identify = conn.recv_command().await;
    assert_eq!(identify["op"], 2);
    conn.send_json(json!({
        "op": 0,
        "t": "READY",
        "s": null,
        "d": {
            "v": 6,
            "session_id": session_id,
            "user": { "id": "9000", "username": "courier-test", "bot": true }
        }
    }))
    .await;
    identify
}

#[tokio::test]
async fn clean_identify_publishes_dispatches() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let mut harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    let identify = handshake(&mut conn, "S1").await;
    assert_eq!(identify["d"]["token"], "bot-token");
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert!(identify["d"]["properties"]["$os"].is_string());

    conn.send_json(json!({
        "op": 0,
        "t": "GUILD_CREATE",
        "s": 1,
        "d": { "id": "123", "name": "guild" }
    }))
    .await;

    let envelope = next_envelope_of(&mut harness.bus, "GUILD_CREATE").await;
    assert_eq!(envelope.sequence, 1);
    assert_eq!(envelope.data["name"], "guild");
    assert_eq!(envelope.metadata.identifier, "test");

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    let shard = group.shard(0).unwrap();

    wait_for("shard ready", Duration::from_secs(5), || {
        shard.status() == ShardStatus::Ready
    })
    .await;
    wait_for("session stored", Duration::from_secs(5), || {
        shard.session_id() == "S1"
    })
    .await;
    assert_eq!(shard.sequence(), 1);
    assert_eq!(shard.user().unwrap().username, "courier-test");

    wait_for("group ready", Duration::from_secs(5), || {
        group.ctx.status() == GroupStatus::Ready
    })
    .await;

    harness.courier.close().await;
}

#[tokio::test]
async fn resume_preserves_session_and_skips_identify() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    handshake(&mut conn, "S1").await;
    conn.send_json(json!({
        "op": 0,
        "t": "GUILD_CREATE",
        "s": 42,
        "d": { "id": "123" }
    }))
    .await;

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    let shard = group.shard(0).unwrap();
    wait_for("sequence 42", Duration::from_secs(5), || {
        shard.sequence() == 42
    })
    .await;

    // Transient disconnect; session and sequence stay intact
    conn.close_with(4000, "resume me").await;

    let mut reconn = gateway.accept().await;
    reconn.hello(41250).await;

    let resume = reconn.recv_command().await;
    assert_eq!(resume["op"], 6, "expected RESUME, not IDENTIFY");
    assert_eq!(resume["d"]["session_id"], "S1");
    assert_eq!(resume["d"]["seq"], 42);

    reconn
        .send_json(json!({
            "op": 0,
            "t": "GUILD_UPDATE",
            "s": 43,
            "d": { "id": "123" }
        }))
        .await;

    wait_for("sequence 43", Duration::from_secs(5), || {
        shard.sequence() == 43
    })
    .await;
    assert_eq!(shard.status(), ShardStatus::Ready);

    // The identify bucket was never consumed on the resume path
    let bucket = format!("gw:{}:0", harness.manager.ctx.token_hash);
    assert_eq!(harness.manager.ctx.buckets.used(&bucket), 0);

    harness.courier.close().await;
}

#[tokio::test]
async fn non_resumable_invalid_session_reidentifies() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    handshake(&mut conn, "S1").await;
    conn.send_json(json!({
        "op": 0,
        "t": "GUILD_CREATE",
        "s": 7,
        "d": { "id": "123" }
    }))
    .await;

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    let shard = group.shard(0).unwrap();
    wait_for("sequence 7", Duration::from_secs(5), || shard.sequence() == 7).await;

    conn.send_json(json!({ "op": 9, "d": false })).await;
    // The shard closes this socket itself
    while let Some(Ok(_)) = conn.ws.next().await {}

    let mut reconn = gateway.accept().await;
    reconn.hello(41250).await;

    let first = reconn.recv_command().await;
    assert_eq!(first["op"], 2, "non-resumable session must IDENTIFY");

    assert_eq!(shard.sequence(), 0);
    assert_eq!(shard.session_id(), "");

    harness.courier.close().await;
}

#[tokio::test]
async fn missing_heartbeat_acks_force_reconnect() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(
        &gateway.url,
        BotConfig {
            max_heartbeat_failures: 3,
            retries: 3,
            ..BotConfig::default()
        },
    )
    .await;
    let mut conn = accept.await;

    conn.hello(1000).await;
    let identify = conn.recv_raw().await.unwrap();
    assert_eq!(identify["op"], 2);
    conn.send_json(json!({
        "op": 0,
        "t": "READY",
        "s": null,
        "d": { "session_id": "S1" }
    }))
    .await;

    // Swallow heartbeats without acking until the client gives up
    let started = Instant::now();
    let drain = tokio::spawn(async move { while conn.recv_raw().await.is_some() {} });

    let reconn = timeout(Duration::from_secs(8), gateway.accept())
        .await
        .expect("expected a reconnect after missed acks");
    drop(reconn);
    drain.abort();

    // interval 1s, liveness window 3s: the shard holds on through the
    // window before giving up
    assert!(started.elapsed() >= Duration::from_secs(2));

    harness.courier.close().await;
}

#[tokio::test]
async fn fatal_close_code_stops_the_group() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    conn.hello(41250).await;
    let identify = conn.recv_command().await;
    assert_eq!(identify["op"], 2);

    conn.close_with(4014, "Disallowed intent(s).").await;

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    wait_for("group erroring", Duration::from_secs(5), || {
        group.ctx.status() == GroupStatus::Erroring
    })
    .await;
    assert!(group.ctx.error().contains("4014"));

    let shard = group.shard(0).unwrap();
    wait_for("shard closed", Duration::from_secs(5), || {
        shard.status() == ShardStatus::Closed
    })
    .await;

    // No further connection attempts
    assert!(
        timeout(Duration::from_secs(2), gateway.accept()).await.is_err(),
        "fatal close codes must not be retried"
    );

    // The manager survives its group
    assert!(harness.courier.manager("test").is_ok());
    assert!(!harness.manager.ctx.last_error().is_empty());

    harness.courier.close().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_the_error() {
    let gateway = FakeGateway::bind().await;
    let url = gateway.url.clone();

    // Refuse every connection before the websocket handshake
    let refuser = tokio::spawn(async move {
        loop {
            gateway.refuse().await;
        }
    });

    let harness = start_daemon(
        &url,
        BotConfig {
            retries: 2,
            ..BotConfig::default()
        },
    )
    .await;
    let group = harness.manager.shard_group(harness.group_id).unwrap();

    // Two budgeted attempts, then the terminal attempt, then the error
    // lands on the group
    wait_for("group erroring", Duration::from_secs(15), || {
        group.ctx.status() == GroupStatus::Erroring
    })
    .await;
    assert!(!group.ctx.error().is_empty());
    assert!(!harness.manager.ctx.last_error().is_empty());

    let shard = group.shard(0).unwrap();
    wait_for("shard closed", Duration::from_secs(5), || {
        shard.status() == ShardStatus::Closed
    })
    .await;

    refuser.abort();
    harness.courier.close().await;
}

#[tokio::test]
async fn chunking_coalesces_concurrent_callers() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    handshake(&mut conn, "S1").await;
    conn.send_json(json!({
        "op": 0,
        "t": "GUILD_CREATE",
        "s": 1,
        "d": { "id": "123" }
    }))
    .await;

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    let shard = group.shard(0).unwrap();
    wait_for("shard ready", Duration::from_secs(5), || {
        shard.status() == ShardStatus::Ready
    })
    .await;

    const GUILD: u64 = 1029384756;

    let caller_a = {
        let shard = Arc::clone(&shard);
        tokio::spawn(async move {
            let started = Instant::now();
            shard.chunk_guild(GUILD, true).await.unwrap();
            started.elapsed()
        })
    };
    sleep(Duration::from_millis(50)).await;
    let caller_b = {
        let shard = Arc::clone(&shard);
        tokio::spawn(async move {
            let started = Instant::now();
            shard.chunk_guild(GUILD, true).await.unwrap();
            started.elapsed()
        })
    };

    // Exactly one roster request reaches the gateway
    let request = conn.recv_command().await;
    assert_eq!(request["op"], 8);
    assert_eq!(request["d"]["guild_id"], GUILD.to_string());
    assert_eq!(request["d"]["query"], "");
    assert_eq!(request["d"]["limit"], 0);

    for seq in 0..4 {
        conn.send_json(json!({
            "op": 0,
            "t": "GUILD_MEMBERS_CHUNK",
            "s": 10 + seq,
            "d": { "guild_id": GUILD.to_string(), "members": [] }
        }))
        .await;
        sleep(Duration::from_millis(200)).await;
    }

    let elapsed_a = caller_a.await.unwrap();
    let elapsed_b = caller_b.await.unwrap();

    // Both callers return after the idle window closes
    for elapsed in [elapsed_a, elapsed_b] {
        assert!(
            elapsed >= Duration::from_millis(600),
            "caller returned before chunking finished: {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_secs(5),
            "caller took too long: {elapsed:?}"
        );
    }

    // Completion flag is visible for followers arriving late
    let flag = group
        .ctx
        .chunks_complete
        .get(&GUILD)
        .map(|f| f.load(std::sync::atomic::Ordering::Acquire));
    assert_eq!(flag, Some(true));

    // A late caller returns immediately without a second request
    shard.chunk_guild(GUILD, true).await.unwrap();
    let no_request = timeout(Duration::from_millis(500), async {
        loop {
            let value = conn.recv_command().await;
            if value["op"] == 8 {
                return value;
            }
        }
    })
    .await;
    assert!(no_request.is_err(), "no second roster request expected");

    harness.courier.close().await;
}

#[tokio::test]
async fn chunk_timeout_cleans_up_and_fails() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    handshake(&mut conn, "S1").await;
    conn.send_json(json!({
        "op": 0,
        "t": "GUILD_CREATE",
        "s": 1,
        "d": { "id": "123" }
    }))
    .await;

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    let shard = group.shard(0).unwrap();
    wait_for("shard ready", Duration::from_secs(5), || {
        shard.status() == ShardStatus::Ready
    })
    .await;

    const GUILD: u64 = 555;

    // Server never answers the roster request
    let silent = tokio::spawn(async move {
        loop {
            if conn.recv_raw().await.is_none() {
                return;
            }
        }
    });

    let result = shard.chunk_guild(GUILD, true).await;
    assert!(matches!(
        result,
        Err(courier_gateway::GatewayError::ChunkTimeout { guild_id: GUILD })
    ));

    // All per-guild state was removed
    assert!(group.ctx.chunks_complete.get(&GUILD).is_none());
    assert!(group.ctx.chunks_callback.get(&GUILD).is_none());
    assert!(group.ctx.chunk_arrivals.get(&GUILD).is_none());

    silent.abort();
    harness.courier.close().await;
}

#[tokio::test]
async fn closing_a_closed_group_is_a_noop() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    handshake(&mut conn, "S1").await;
    conn.send_json(json!({
        "op": 0,
        "t": "GUILD_CREATE",
        "s": 1,
        "d": { "id": "123" }
    }))
    .await;

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    let shard = group.shard(0).unwrap();
    wait_for("shard ready", Duration::from_secs(5), || {
        shard.status() == ShardStatus::Ready
    })
    .await;

    group.close().await;
    assert_eq!(group.ctx.status(), GroupStatus::Closed);
    assert_eq!(shard.status(), ShardStatus::Closed);

    // Idempotent for both the group and the shard
    group.close().await;
    shard.close().await;
    shard.close().await;
    assert_eq!(group.ctx.status(), GroupStatus::Closed);
    assert_eq!(shard.status(), ShardStatus::Closed);

    harness.courier.close().await;
}

#[tokio::test]
async fn rolling_restart_retires_older_groups() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(&gateway.url, fast_bot()).await;
    let mut conn = accept.await;

    handshake(&mut conn, "S1").await;
    conn.send_json(json!({
        "op": 0,
        "t": "GUILD_CREATE",
        "s": 1,
        "d": { "id": "123" }
    }))
    .await;

    let group1 = harness.manager.shard_group(harness.group_id).unwrap();
    wait_for("first group ready", Duration::from_secs(5), || {
        group1.ctx.status() == GroupStatus::Ready
    })
    .await;

    // Open the successor while the first group is still live
    let accept2 = gateway.accept();
    let (group_id2, _ready) = harness.manager.scale(vec![0], 1, true).await.unwrap();
    assert!(group_id2 > harness.group_id);

    let mut conn2 = accept2.await;
    handshake(&mut conn2, "S2").await;
    conn2
        .send_json(json!({
            "op": 0,
            "t": "GUILD_CREATE",
            "s": 1,
            "d": { "id": "456" }
        }))
        .await;

    let group2 = harness.manager.shard_group(group_id2).unwrap();
    wait_for("successor ready", Duration::from_secs(5), || {
        group2.ctx.status() == GroupStatus::Ready
    })
    .await;

    wait_for("old group replaced", Duration::from_secs(5), || {
        group1.ctx.status() == GroupStatus::Replaced
    })
    .await;

    harness.courier.close().await;
}

#[tokio::test]
async fn first_event_timeout_surfaces_a_connection_error() {
    let gateway = FakeGateway::bind().await;
    let accept = gateway.accept();
    let harness = start_daemon(
        &gateway.url,
        BotConfig {
            retries: 1,
            ..BotConfig::default()
        },
    )
    .await;

    // First attempt: HELLO, then silence after IDENTIFY
    let mut conn = accept.await;
    conn.hello(41250).await;
    let identify = conn.recv_command().await;
    assert_eq!(identify["op"], 2);

    // The exhausted budget allows one terminal attempt, which gets the
    // same silence
    let mut conn2 = timeout(Duration::from_secs(10), gateway.accept())
        .await
        .expect("expected a terminal connection attempt");
    conn2.hello(41250).await;
    let identify = conn2.recv_command().await;
    assert_eq!(identify["op"], 2);

    let group = harness.manager.shard_group(harness.group_id).unwrap();
    wait_for("group erroring", Duration::from_secs(10), || {
        group.ctx.status() == GroupStatus::Erroring
    })
    .await;
    assert!(group.ctx.error().contains("no event within"));

    harness.courier.close().await;
}

#[tokio::test]
async fn session_limit_exhaustion_fails_group_open() {
    let gateway = FakeGateway::bind().await;
    let courier = Arc::new(Courier::new(64, GatewayMetrics::disabled()));

    let config = ManagerConfig {
        identifier: "test".to_string(),
        display_name: "Test".to_string(),
        token: "bot-token".to_string(),
        bot: BotConfig::default(),
        sharding: ShardingConfig {
            auto_sharded: false,
            shard_count: 4,
        },
        messaging: MessagingConfig {
            client_name: "test".to_string(),
            channel_name: "events".to_string(),
            use_random_suffix: false,
        },
        events: EventConfig::default(),
        gateway: GatewayDescriptor {
            url: gateway.url.clone(),
            shards: 4,
            session_start_limit: SessionStartLimit {
                total: 1000,
                remaining: 2,
                reset_after: 0,
                max_concurrency: 1,
            },
        },
    };

    let manager = courier
        .create_manager(config, Arc::new(PassthroughState))
        .unwrap();
    let (publisher, _bus) = ChannelPublisher::new();
    manager.open(publisher);

    let result = manager.scale(vec![0, 1, 2, 3], 4, true).await;
    assert!(matches!(
        result,
        Err(courier_gateway::GatewayError::SessionLimitExhausted {
            requested: 4,
            remaining: 2
        })
    ));

    courier.close().await;
}
