//! Shard connection state machine.
//!
//! Each shard owns one websocket to the gateway, its heartbeat task and
//! reader task, and runs the connect/listen/reconnect loop. Sessions
//! are resumed when `(session_id, sequence)` survive a disconnect;
//! otherwise the shard re-identifies through the per-token concurrency
//! bucket.

mod chunk;
mod group;
mod status;

pub use group::{GroupContext, ShardGroup};
pub use status::{GroupStatus, HeartbeatTimes, ShardStatus};

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dispatch;
use crate::error::GatewayError;
use crate::manager::ManagerContext;
use crate::wire::{
    self, GatewayOp, Hello, Identify, IdentifyProperties, InvalidSession, MemberChunkRef, Ready,
    ReceivedPayload, Resume, SentPayload, User, RECONNECT_CLOSE_CODE, WEBSOCKET_READ_LIMIT,
};

/// Inbound frames buffered between the reader task and the main loop.
const MESSAGE_CHANNEL_BUFFER: usize = 64;

/// How long to wait for the first event after IDENTIFY/RESUME. The
/// gateway reports problems such as disallowed intents inside this
/// window by closing the socket.
const FIRST_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound frames allowed per shard per minute, with headroom reserved
/// for heartbeats which bypass the bucket entirely.
const WS_SEND_LIMIT: usize = 115;
const WS_SEND_WINDOW: Duration = Duration::from_secs(60);

/// One IDENTIFY per concurrency bucket per this window.
const IDENTIFY_RATELIMIT: Duration = Duration::from_millis(5500);

/// Reconnect backoff bounds.
const RECONNECT_WAIT_START: Duration = Duration::from_secs(1);
const RECONNECT_WAIT_MAX: Duration = Duration::from_secs(600);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// One live connection: the channels fed by the reader task plus the
/// scope that kills the reader and heartbeat when it ends.
struct Conn {
    token: CancellationToken,
    msg_tx: mpsc::Sender<ReceivedPayload>,
    msg_rx: mpsc::Receiver<ReceivedPayload>,
    err_rx: mpsc::Receiver<GatewayError>,
}

/// Why the listen loop returned.
enum Exit {
    Cancelled,
    Fatal(GatewayError),
    Reconnect { code: u16 },
}

/// A single gateway connection for one slice of the guild space.
pub struct Shard {
    pub shard_id: u32,
    group: Arc<GroupContext>,
    manager: Arc<ManagerContext>,

    status: RwLock<ShardStatus>,
    heartbeat: RwLock<HeartbeatTimes>,
    heartbeat_interval: RwLock<Duration>,
    heartbeat_active: AtomicBool,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,

    sequence: AtomicI64,
    session_id: RwLock<String>,
    user: RwLock<Option<User>>,

    retries: AtomicI32,
    events: AtomicI64,
    pub start: Instant,

    ready_tx: watch::Sender<bool>,
    ready_fired: AtomicBool,

    sink: Mutex<Option<WsSink>>,
}

impl Shard {
    pub(crate) fn new(
        group: Arc<GroupContext>,
        manager: Arc<ManagerContext>,
        shard_id: u32,
    ) -> Arc<Self> {
        let retries = manager.config.read().bot.retries;
        let (ready_tx, _) = watch::channel(false);

        Arc::new(Self {
            shard_id,
            group,
            manager,
            status: RwLock::new(ShardStatus::Idle),
            heartbeat: RwLock::new(HeartbeatTimes::fresh()),
            heartbeat_interval: RwLock::new(Duration::from_secs(45)),
            heartbeat_active: AtomicBool::new(false),
            heartbeat_task: Mutex::new(None),
            sequence: AtomicI64::new(0),
            session_id: RwLock::new(String::new()),
            user: RwLock::new(None),
            retries: AtomicI32::new(retries),
            events: AtomicI64::new(0),
            start: Instant::now(),
            ready_tx,
            ready_fired: AtomicBool::new(false),
            sink: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ShardStatus {
        *self.status.read()
    }

    pub fn sequence(&self) -> i64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    pub fn user(&self) -> Option<User> {
        self.user.read().clone()
    }

    pub fn events_received(&self) -> i64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn retries_left(&self) -> i32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn heartbeat_active(&self) -> bool {
        self.heartbeat_active.load(Ordering::SeqCst)
    }

    /// Round-trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Duration {
        self.heartbeat.read().latency()
    }

    pub fn ready_subscribe(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    fn set_status(&self, status: ShardStatus) {
        *self.status.write() = status;

        debug!(
            manager = %self.manager.identifier,
            group_id = self.group.id,
            shard_id = self.shard_id,
            status = status.as_str(),
            "Shard status changed"
        );

        let manager = Arc::clone(&self.manager);
        let shard_id = self.shard_id;
        tokio::spawn(async move {
            let data = serde_json::json!({
                "shard_id": shard_id,
                "status": status.code(),
            });
            if let Err(e) = manager.publish_event("SHARD_STATUS", data).await {
                debug!(error = %e, "Failed to publish shard status");
            }
        });
    }

    /// Ready means IDENTIFY succeeded and the first event has flowed,
    /// or RESUME was sent. The group-facing signal fires once per shard
    /// lifetime; status flips back to Ready after every reconnect.
    fn mark_ready(&self) {
        let first = !self.ready_fired.swap(true, Ordering::AcqRel);
        if !first && self.status() == ShardStatus::Ready {
            return;
        }
        self.set_status(ShardStatus::Ready);
        if first {
            let _ = self.ready_tx.send(true);
        }
    }

    fn send_bucket(&self) -> String {
        format!("ws:{}:{}", self.shard_id, self.group.shard_count())
    }

    fn identify_bucket(&self) -> String {
        let max_concurrency = self
            .manager
            .gateway
            .read()
            .session_start_limit
            .max_concurrency
            .max(1);
        format!(
            "gw:{}:{}",
            self.manager.token_hash,
            self.shard_id % max_concurrency
        )
    }

    /// Drive the shard until its group stops: connect, listen, and
    /// reconnect with backoff. Fatal close codes stop the whole group.
    pub async fn run(self: Arc<Self>) {
        debug!(shard_id = self.shard_id, "Opening shard");

        let mut conn = match self.establish().await {
            Some(conn) => conn,
            None => {
                self.finish().await;
                return;
            }
        };

        loop {
            match self.listen(&mut conn).await {
                Exit::Cancelled => break,
                Exit::Fatal(e) => {
                    self.group.fail(e.to_string());
                    self.manager
                        .process
                        .metrics
                        .record_error(self.shard_id, e.error_type_label());
                    break;
                }
                Exit::Reconnect { code } => {
                    conn.token.cancel();
                    self.close_socket(code).await;
                    self.set_status(ShardStatus::Reconnecting);

                    match self.establish().await {
                        Some(next) => conn = next,
                        None => break,
                    }
                }
            }
        }

        conn.token.cancel();
        self.close_socket(CloseCode::Normal.into()).await;
        self.finish().await;
    }

    /// Connect with retries, converting terminal failures into a group
    /// stop. Returns None when the shard should exit its run loop.
    async fn establish(self: &Arc<Self>) -> Option<Conn> {
        match self.reconnect_loop().await {
            Ok(conn) => Some(conn),
            Err(GatewayError::Cancelled) => None,
            Err(e) => {
                error!(
                    shard_id = self.shard_id,
                    error = %e,
                    "Shard could not re-establish a connection"
                );
                self.manager
                    .process
                    .metrics
                    .record_error(self.shard_id, e.error_type_label());
                self.group.fail(e.to_string());
                None
            }
        }
    }

    /// Connect, backing off exponentially on transient failures. The
    /// retry budget resets on success; once it runs out a single final
    /// attempt decides the shard's fate.
    async fn reconnect_loop(self: &Arc<Self>) -> Result<Conn, GatewayError> {
        let mut wait = RECONNECT_WAIT_START;

        loop {
            if self.group.token.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            match self.connect().await {
                Ok(conn) => {
                    let configured = self.manager.config.read().bot.retries;
                    self.retries.store(configured, Ordering::SeqCst);
                    return Ok(conn);
                }
                Err(e) if e.is_fatal_close() => return Err(e),
                Err(e) => {
                    let left = self.retries.fetch_sub(1, Ordering::SeqCst) - 1;
                    if left <= 0 {
                        warn!(
                            shard_id = self.shard_id,
                            "Ran out of retries whilst connecting, making final attempt"
                        );
                        self.close_socket(CloseCode::Normal.into()).await;
                        return self.connect().await;
                    }

                    warn!(
                        shard_id = self.shard_id,
                        error = %e,
                        retry_in_secs = wait.as_secs(),
                        retries_left = left,
                        "Failed to connect to gateway"
                    );

                    tokio::select! {
                        _ = self.group.token.cancelled() => return Err(GatewayError::Cancelled),
                        _ = sleep(wait) => {}
                    }
                    wait = (wait * 2).min(RECONNECT_WAIT_MAX);
                }
            }
        }
    }

    /// One connection attempt: dial, HELLO, heartbeat, IDENTIFY or
    /// RESUME, and the first-event gate.
    async fn connect(self: &Arc<Self>) -> Result<Conn, GatewayError> {
        let conn_token = self.group.token.child_token();

        match self.connect_inner(&conn_token).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                conn_token.cancel();
                self.close_socket(CloseCode::Normal.into()).await;
                Err(e)
            }
        }
    }

    async fn connect_inner(
        self: &Arc<Self>,
        conn_token: &CancellationToken,
    ) -> Result<Conn, GatewayError> {
        self.set_status(ShardStatus::Waiting);

        // One heartbeat task at a time; the previous connection's task
        // exits promptly once its scope is cancelled.
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            let _ = task.await;
        }

        let (gateway_url, max_concurrency) = {
            let gateway = self.manager.gateway.read();
            (
                gateway.url.clone(),
                gateway.session_start_limit.max_concurrency.max(1),
            )
        };
        let concurrency_bucket = self.shard_id % max_concurrency;
        trace!(shard_id = self.shard_id, concurrency_bucket, "Using concurrency bucket");

        self.manager
            .buckets
            .create(&self.send_bucket(), WS_SEND_LIMIT, WS_SEND_WINDOW);
        self.manager
            .buckets
            .create(&self.identify_bucket(), 1, IDENTIFY_RATELIMIT);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WEBSOCKET_READ_LIMIT);
        ws_config.max_frame_size = Some(WEBSOCKET_READ_LIMIT);

        trace!(shard_id = self.shard_id, url = %gateway_url, "Dialing gateway");
        let (stream, _response) =
            connect_async_with_config(gateway_url.as_str(), Some(ws_config), false).await?;
        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);

        let (msg_tx, mut msg_rx) = mpsc::channel(MESSAGE_CHANNEL_BUFFER);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        self.spawn_reader(source, msg_tx.clone(), err_tx.clone(), conn_token.clone());

        // First frame must be HELLO.
        let hello_msg = tokio::select! {
            Some(err) = err_rx.recv() => return Err(err),
            msg = msg_rx.recv() => msg.ok_or(GatewayError::StreamEnded)?,
        };
        if hello_msg.op != GatewayOp::Hello {
            warn!(
                shard_id = self.shard_id,
                op = u8::from(hello_msg.op),
                "Expected HELLO as first frame"
            );
        }
        let hello: Hello = hello_msg.decode_data()?;

        *self.heartbeat.write() = HeartbeatTimes::fresh();
        *self.heartbeat_interval.write() = Duration::from_millis(hello.heartbeat_interval);

        self.set_status(ShardStatus::Connecting);

        debug!(
            shard_id = self.shard_id,
            interval_ms = hello.heartbeat_interval,
            "Retrieved HELLO from gateway"
        );

        self.spawn_heartbeat(conn_token.clone(), err_tx.clone()).await;

        let sequence = self.sequence();
        let session_id = self.session_id();

        if session_id.is_empty() || sequence == 0 {
            self.identify().await?;
        } else {
            self.resume().await?;
            // Resumption is assumed good until the gateway says otherwise.
            self.mark_ready();
        }

        // Hold here briefly: rejections such as disallowed intents
        // arrive as a close within this window.
        let first = timeout(FIRST_EVENT_TIMEOUT, async {
            tokio::select! {
                Some(err) = err_rx.recv() => Err(err),
                msg = msg_rx.recv() => Ok(msg),
            }
        })
        .await;

        match first {
            Err(_elapsed) => {
                return Err(GatewayError::ConnectTimeout {
                    shard_id: self.shard_id,
                    timeout_secs: FIRST_EVENT_TIMEOUT.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(None)) => return Err(GatewayError::StreamEnded),
            Ok(Ok(Some(msg))) => {
                debug!(
                    shard_id = self.shard_id,
                    op = u8::from(msg.op),
                    event_type = msg.event_type.as_deref().unwrap_or(""),
                    "Received first event"
                );
                self.mark_ready();
                // Requeue so the main loop handles it.
                let _ = msg_tx.send(msg).await;
            }
        }

        self.manager.buckets.reset(&self.identify_bucket());

        trace!(shard_id = self.shard_id, "Finished connecting");

        Ok(Conn {
            token: conn_token.clone(),
            msg_tx,
            msg_rx,
            err_rx,
        })
    }

    /// Reader task: frames in, payloads out. Binary frames are
    /// zlib-inflated before parsing. Any failure lands on the error
    /// channel and ends the task.
    fn spawn_reader(
        self: &Arc<Self>,
        mut source: WsSource,
        msg_tx: mpsc::Sender<ReceivedPayload>,
        err_tx: mpsc::Sender<GatewayError>,
        token: CancellationToken,
    ) {
        let shard_id = self.shard_id;
        let identifier = self.manager.identifier.clone();
        let metrics = self.manager.process.metrics.clone();
        // Weak so a lingering reader cannot outlive its group's shard.
        let shard = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => return,
                    item = source.next() => item,
                };

                let frame = match item {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        let _ = err_tx.try_send(e.into());
                        return;
                    }
                    None => {
                        let _ = err_tx.try_send(GatewayError::StreamEnded);
                        return;
                    }
                };

                let body = match frame {
                    Message::Text(text) => text.as_bytes().to_vec(),
                    Message::Binary(buf) => match wire::inflate(&buf) {
                        Ok(body) => body,
                        Err(e) => {
                            let _ = err_tx.try_send(e);
                            return;
                        }
                    },
                    Message::Close(frame) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = err_tx.try_send(GatewayError::GatewayClosed { code, reason });
                        return;
                    }
                    // Pings and pongs are handled by the protocol layer.
                    _ => continue,
                };

                let mut msg = match wire::decode_payload(&body) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(shard_id, error = %e, "Failed to unmarshal message");
                        continue;
                    }
                };
                msg.add_trace("unmarshal");

                if let Some(shard) = shard.upgrade() {
                    shard.events.fetch_add(1, Ordering::Relaxed);
                }
                metrics.record_event(&identifier, shard_id);

                if msg_tx.send(msg).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Heartbeat task: tick at the negotiated interval, bypass the send
    /// bucket, and flag the connection dead when acks stop coming.
    async fn spawn_heartbeat(
        self: &Arc<Self>,
        token: CancellationToken,
        err_tx: mpsc::Sender<GatewayError>,
    ) {
        let shard = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if shard.heartbeat_active.swap(true, Ordering::SeqCst) {
                return;
            }

            loop {
                let interval = *shard.heartbeat_interval.read();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }

                trace!(shard_id = shard.shard_id, "Heartbeating");
                let sequence = shard.sequence();
                let result = shard.send_event(GatewayOp::Heartbeat, sequence).await;

                let (sent_at, last_ack) = {
                    let mut hb = shard.heartbeat.write();
                    hb.last_sent = Instant::now();
                    (hb.last_sent, hb.last_ack)
                };

                let max_failures = shard.manager.config.read().bot.max_heartbeat_failures;
                let liveness = interval * max_failures;
                let stale = sent_at.duration_since(last_ack);

                if result.is_err() || stale > liveness {
                    let err = match result {
                        Err(e) => {
                            error!(shard_id = shard.shard_id, error = %e, "Failed to heartbeat, reconnecting");
                            e
                        }
                        Ok(()) => {
                            warn!(
                                shard_id = shard.shard_id,
                                stale_ms = stale.as_millis() as u64,
                                max_failures,
                                "Gateway failed to ACK within the liveness window, reconnecting"
                            );
                            GatewayError::HeartbeatFailure {
                                shard_id: shard.shard_id,
                                elapsed_ms: stale.as_millis() as u64,
                            }
                        }
                    };
                    let _ = err_tx.try_send(err);
                    break;
                }
            }

            shard.heartbeat_active.store(false, Ordering::SeqCst);
        });

        *self.heartbeat_task.lock().await = Some(handle);
    }

    /// Main loop: read frames and act on them until the connection
    /// fails or the group stops.
    async fn listen(&self, conn: &mut Conn) -> Exit {
        loop {
            let msg = tokio::select! {
                _ = self.group.token.cancelled() => return Exit::Cancelled,
                result = Self::read_message(conn) => result,
            };

            match msg {
                Ok(msg) => {
                    if let Some(exit) = self.on_event(msg, conn).await {
                        return exit;
                    }
                }
                Err(e) => {
                    if e.is_fatal_close() {
                        warn!(
                            shard_id = self.shard_id,
                            error = %e,
                            "Closing shard group, cannot continue with this token or configuration"
                        );
                        return Exit::Fatal(e);
                    }

                    warn!(shard_id = self.shard_id, error = %e, "Error reading from gateway, reconnecting");
                    self.manager
                        .process
                        .metrics
                        .record_error(self.shard_id, e.error_type_label());
                    return Exit::Reconnect {
                        code: CloseCode::Normal.into(),
                    };
                }
            }
        }
    }

    /// Next inbound payload, with pending errors taking priority.
    async fn read_message(conn: &mut Conn) -> Result<ReceivedPayload, GatewayError> {
        if let Ok(err) = conn.err_rx.try_recv() {
            return Err(err);
        }

        tokio::select! {
            Some(err) = conn.err_rx.recv() => Err(err),
            msg = conn.msg_rx.recv() => {
                let mut msg = msg.ok_or(GatewayError::StreamEnded)?;
                msg.add_trace("read");
                Ok(msg)
            }
        }
    }

    /// Act on one inbound payload. Returns Some when the listen loop
    /// must stop.
    async fn on_event(&self, msg: ReceivedPayload, _conn: &mut Conn) -> Option<Exit> {
        match msg.op {
            GatewayOp::Dispatch => {
                // Sequence is stored in receive order even though
                // dispatch work fans out to the pool.
                if let Some(sequence) = msg.sequence {
                    self.sequence.store(sequence, Ordering::SeqCst);
                }

                self.inspect_dispatch(&msg);
                self.mark_ready();

                let manager = Arc::clone(&self.manager);
                let group_id = self.group.id;
                let shard_id = self.shard_id;
                tokio::spawn(async move {
                    if let Err(e) =
                        dispatch::handle_dispatch(manager, group_id, shard_id, msg).await
                    {
                        debug!(shard_id, error = %e, "Failed to handle event");
                    }
                });
            }
            GatewayOp::Heartbeat => {
                debug!(shard_id = self.shard_id, "Received heartbeat request");
                let sequence = self.sequence();
                if let Err(e) = self.send_event(GatewayOp::Heartbeat, sequence).await {
                    error!(
                        shard_id = self.shard_id,
                        error = %e,
                        "Failed to heartbeat in response to gateway, reconnecting"
                    );
                    return Some(Exit::Reconnect {
                        code: CloseCode::Normal.into(),
                    });
                }
            }
            GatewayOp::Reconnect => {
                info!(shard_id = self.shard_id, "Reconnecting in response to gateway");
                return Some(Exit::Reconnect {
                    code: RECONNECT_CLOSE_CODE,
                });
            }
            GatewayOp::InvalidSession => {
                let resumable = msg
                    .decode_data::<InvalidSession>()
                    .map(|InvalidSession(resumable)| resumable)
                    .unwrap_or(false);

                if !resumable {
                    self.session_id.write().clear();
                    self.sequence.store(0, Ordering::SeqCst);
                }

                warn!(
                    shard_id = self.shard_id,
                    resumable, "Received invalid session from gateway"
                );
                return Some(Exit::Reconnect {
                    code: RECONNECT_CLOSE_CODE,
                });
            }
            GatewayOp::Hello => {
                // Late re-negotiation; the heartbeat task picks up the
                // new interval on its next tick.
                match msg.decode_data::<Hello>() {
                    Ok(hello) => {
                        *self.heartbeat.write() = HeartbeatTimes::fresh();
                        *self.heartbeat_interval.write() =
                            Duration::from_millis(hello.heartbeat_interval);
                        debug!(
                            shard_id = self.shard_id,
                            interval_ms = hello.heartbeat_interval,
                            "Retrieved HELLO from gateway"
                        );
                    }
                    Err(e) => warn!(shard_id = self.shard_id, error = %e, "Malformed HELLO"),
                }
            }
            GatewayOp::HeartbeatAck => {
                let latency = {
                    let mut hb = self.heartbeat.write();
                    hb.last_ack = Instant::now();
                    hb.last_ack.duration_since(hb.last_sent)
                };
                self.manager
                    .process
                    .metrics
                    .record_heartbeat(self.shard_id, latency);
                debug!(
                    shard_id = self.shard_id,
                    rtt_ms = latency.as_millis() as u64,
                    "Received heartbeat ACK"
                );
            }
            GatewayOp::Identify
            | GatewayOp::Resume
            | GatewayOp::RequestGuildMembers
            | GatewayOp::StatusUpdate
            | GatewayOp::VoiceStateUpdate => {}
            GatewayOp::Unknown(op) => {
                warn!(
                    shard_id = self.shard_id,
                    op,
                    event_type = msg.event_type.as_deref().unwrap_or(""),
                    "Gateway sent unknown packet"
                );
            }
        }

        None
    }

    /// Pull session bookkeeping out of dispatch events the daemon has
    /// to understand: READY, RESUMED and member chunks.
    fn inspect_dispatch(&self, msg: &ReceivedPayload) {
        match msg.event_type.as_deref() {
            Some("READY") => match msg.decode_data::<Ready>() {
                Ok(ready) => {
                    *self.session_id.write() = ready.session_id.clone();
                    if let Some(user) = ready.user {
                        info!(
                            shard_id = self.shard_id,
                            session_id = %ready.session_id,
                            user = %user.username,
                            "Shard ready"
                        );
                        *self.user.write() = Some(user);
                    } else {
                        info!(
                            shard_id = self.shard_id,
                            session_id = %ready.session_id,
                            "Shard ready"
                        );
                    }
                }
                Err(e) => warn!(shard_id = self.shard_id, error = %e, "Malformed READY"),
            },
            Some("RESUMED") => {
                info!(shard_id = self.shard_id, "Shard resumed");
            }
            Some("GUILD_MEMBERS_CHUNK") => {
                if let Ok(chunk) = msg.decode_data::<MemberChunkRef>() {
                    self.signal_chunk_arrival(chunk.guild_id);
                }
            }
            _ => {}
        }
    }

    /// Send IDENTIFY, serialized through the per-token concurrency
    /// bucket and debited from the session-start budget.
    async fn identify(&self) -> Result<(), GatewayError> {
        self.manager
            .gateway
            .write()
            .session_start_limit
            .remaining -= 1;

        self.manager.buckets.wait(&self.identify_bucket()).await;

        debug!(shard_id = self.shard_id, "Sending identify");

        let (token, bot) = {
            let config = self.manager.config.read();
            (config.token.clone(), config.bot.clone())
        };

        self.send_event(
            GatewayOp::Identify,
            Identify {
                token,
                properties: IdentifyProperties::for_daemon(),
                compress: bot.compression,
                large_threshold: bot.large_threshold,
                shard: [self.shard_id, self.group.shard_count()],
                presence: bot.default_presence,
                guild_subscriptions: bot.guild_subscriptions,
                intents: bot.intents,
            },
        )
        .await
    }

    /// Resume the previous session with the stored sequence.
    async fn resume(&self) -> Result<(), GatewayError> {
        debug!(shard_id = self.shard_id, "Sending resume");

        let token = self.manager.config.read().token.clone();
        self.send_event(
            GatewayOp::Resume,
            Resume {
                token,
                session_id: self.session_id(),
                seq: self.sequence(),
            },
        )
        .await
    }

    pub(crate) async fn send_event<T: serde::Serialize>(
        &self,
        op: GatewayOp,
        data: T,
    ) -> Result<(), GatewayError> {
        self.write_json(op, SentPayload { op, data }).await
    }

    /// Marshal and send a frame. Heartbeats bypass the send bucket so
    /// liveness survives member-chunk bursts; everything else queues on
    /// the per-shard budget.
    async fn write_json<T: serde::Serialize>(
        &self,
        op: GatewayOp,
        payload: SentPayload<T>,
    ) -> Result<(), GatewayError> {
        let frame = serde_json::to_string(&payload).map_err(GatewayError::Payload)?;

        if op != GatewayOp::Heartbeat {
            self.manager.buckets.wait(&self.send_bucket()).await;
        }

        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink
                .send(Message::Text(frame.into()))
                .await
                .map_err(GatewayError::from),
            None => Err(GatewayError::StreamEnded),
        }
    }

    /// Close the websocket with a code. Always succeeds; a socket that
    /// is already gone is not an error.
    async fn close_socket(&self, code: u16) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            debug!(shard_id = self.shard_id, code, "Closing websocket connection");
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                debug!(shard_id = self.shard_id, error = %e, "Error closing websocket");
            }
        }
    }

    /// Stop this shard directly. A no-op when already closed.
    pub async fn close(&self) {
        if self.status() == ShardStatus::Closed {
            return;
        }
        self.close_socket(CloseCode::Normal.into()).await;
        self.set_status(ShardStatus::Closed);
    }

    async fn finish(&self) {
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
            let _ = task.await;
            self.heartbeat_active.store(false, Ordering::SeqCst);
        }
        if self.status() != ShardStatus::Closed {
            self.set_status(ShardStatus::Closed);
        }
    }
}
