//! Downstream relay: terminates viewer WebSockets, gates admission, runs the
//! per-viewer protocol state machine, and fans coalesced upstream events out
//! to subscribed viewers.

pub mod connection;
pub mod session;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{
        header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL, USER_AGENT},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::Config;
use crate::metrics;
use crate::rendezvous::RendezvousCache;
use crate::shard::coalesce::BroadcastSink;
use crate::shard::ShardHandle;
use session::SessionStore;
use tidewatch_proto::downstream::{close_code, negotiate_version, ViewerFrame, ViewerOpcode};
use tidewatch_proto::upstream::GatewayFrame;

/// Per-viewer state shared between the socket task, the watchdog, and the
/// broadcast path. Viewers live in an explicit arena keyed by `id`; removal
/// is an explicit arena delete.
pub struct ViewerShared {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub fingerprint: String,
    pub protocol_version: &'static str,
    tx: mpsc::UnboundedSender<Message>,
    /// Cancelled at destroy; unblocks the watchdog and the read loop.
    pub closed: CancellationToken,
    pub seq: AtomicU64,
    pub identified: AtomicBool,
    pub destroyed: AtomicBool,
    pub watchdog_started: AtomicBool,
    pub is_alive: AtomicBool,
    pub missed_pings: AtomicU32,
    pub session_id: Mutex<Option<String>>,
    /// Ordered; the first entry is the primary tracked subject.
    pub subscribed: Mutex<Vec<String>>,
}

impl ViewerShared {
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        fingerprint: String,
        protocol_version: &'static str,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            fingerprint,
            protocol_version,
            tx,
            closed: CancellationToken::new(),
            seq: AtomicU64::new(0),
            identified: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            watchdog_started: AtomicBool::new(false),
            is_alive: AtomicBool::new(false),
            missed_pings: AtomicU32::new(0),
            session_id: Mutex::new(None),
            subscribed: Mutex::new(Vec::new()),
        })
    }

    pub fn send_frame(&self, frame: ViewerFrame) {
        match serde_json::to_string(&frame) {
            Ok(text) => {
                let _ = self.tx.send(Message::Text(text));
            }
            Err(err) => warn!(viewer = self.id, error = %err, "failed to encode viewer frame"),
        }
    }

    pub fn send_control(&self, op: ViewerOpcode, d: Value) {
        self.send_frame(ViewerFrame::control(op, d));
    }

    /// Dispatch frames are the only sequenced frames: each one increments
    /// this viewer's outbound counter and carries the new value.
    pub fn send_dispatch(&self, kind: &str, d: Value) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.send_frame(ViewerFrame::dispatch(kind, seq, d));
        seq
    }

    pub fn send_socket(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    pub fn is_subscribed(&self, subject_id: &str) -> bool {
        self.subscribed.lock().iter().any(|id| id == subject_id)
    }

    pub fn primary_subject(&self) -> Option<String> {
        self.subscribed.lock().first().cloned()
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RelayState {
    pub cfg: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub rendezvous: Arc<RendezvousCache>,
    pub shard: ShardHandle,
    connections: DashMap<u64, Arc<ViewerShared>>,
    next_viewer_id: AtomicU64,
    admissions: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RelayState {
    pub fn new(
        cfg: Arc<Config>,
        sessions: Arc<SessionStore>,
        rendezvous: Arc<RendezvousCache>,
        shard: ShardHandle,
    ) -> Self {
        Self {
            cfg,
            sessions,
            rendezvous,
            shard,
            connections: DashMap::new(),
            next_viewer_id: AtomicU64::new(1),
            admissions: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn next_id(&self) -> u64 {
        self.next_viewer_id.fetch_add(1, Ordering::SeqCst)
    }

    fn register(&self, viewer: Arc<ViewerShared>) {
        self.connections.insert(viewer.id, viewer);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.connections.remove(&id);
    }

    fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.cfg.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|origin| {
            self.cfg
                .allowed_origins
                .iter()
                .any(|allowed| allowed == origin)
        })
    }

    /// Per-source-address token bucket, refilled continuously at the
    /// configured admissions-per-second rate.
    fn admit(&self, ip: IpAddr) -> bool {
        let rate = f64::from(self.cfg.admissions_per_second);
        let now = Instant::now();
        let mut buckets = self.admissions.lock();
        let bucket = buckets.entry(ip).or_insert(TokenBucket {
            tokens: rate,
            last_refill: now,
        });
        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * rate;
        bucket.tokens = (bucket.tokens + refill).min(rate);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Fan a dispatch out to every identified viewer subscribed to the
    /// subject. A linear scan over live connections; fine at the configured
    /// connection ceiling, revisit before raising the cap.
    pub fn broadcast(&self, subject_id: &str, kind: &str, payload: Value) {
        let mut delivered = 0usize;
        for entry in self.connections.iter() {
            let viewer = entry.value();
            if viewer.identified.load(Ordering::SeqCst) && viewer.is_subscribed(subject_id) {
                viewer.send_dispatch(kind, payload.clone());
                delivered += 1;
            }
        }
        metrics::BROADCASTS_FLUSHED.inc();
        debug!(subject_id, kind, delivered, "broadcast delivered");
    }

    // Collaborator surface for the HTTP layer.

    /// Start tracking a subject: asks the gateway for member data, which
    /// lands in the rendezvous cache.
    pub fn add_user(&self, subject_id: &str) {
        self.shard.request_members(vec![subject_id.to_string()]);
    }

    /// Refresh a tracked subject's enriched data.
    pub fn update_user(&self, subject_id: &str) {
        self.shard.request_members(vec![subject_id.to_string()]);
    }

    /// Stop tracking a subject and drop its cached data.
    pub fn remove_user(&self, subject_id: &str) {
        self.rendezvous.delete(subject_id);
    }

    /// Raw passthrough to the gateway socket.
    pub fn send(&self, frame: GatewayFrame) {
        self.shard.send(frame);
    }
}

impl BroadcastSink for RelayState {
    fn deliver(&self, subject_id: &str, kind: &str, payload: Value) {
        self.broadcast(subject_id, kind, payload);
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.connection_count(),
        "sessions": state.sessions.len(),
    }))
}

async fn metrics_text() -> String {
    metrics::render()
}

/// WebSocket upgrade handler. Origin and rate-limit rejections happen
/// before the upgrade completes; the connection cap is signalled with a
/// distinct close code after upgrade so the client can tell "busy" from
/// "refused".
pub async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());
    if !state.origin_allowed(origin) {
        metrics::ADMISSIONS_REJECTED
            .with_label_values(&["origin"])
            .inc();
        debug!(?origin, "refusing viewer: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }
    if !state.admit(remote_addr.ip()) {
        metrics::ADMISSIONS_REJECTED
            .with_label_values(&["rate_limited"])
            .inc();
        debug!(%remote_addr, "refusing viewer: admission rate exceeded");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let offers = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let version = negotiate_version(offers.split(','));
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    ws.protocols([
        tidewatch_proto::downstream::PROTOCOL_V2,
        tidewatch_proto::downstream::PROTOCOL_V1,
    ])
    .on_upgrade(move |socket| handle_socket(socket, state, remote_addr, user_agent, version))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<RelayState>,
    remote_addr: SocketAddr,
    user_agent: Option<String>,
    protocol_version: &'static str,
) {
    // Hard cap on live connections: close with "server busy" and create no
    // viewer record.
    if state.connection_count() >= state.cfg.max_connections {
        metrics::ADMISSIONS_REJECTED
            .with_label_values(&["capacity"])
            .inc();
        warn!(%remote_addr, "refusing viewer: connection cap reached");
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::OVERLOADED,
                reason: "server busy".into(),
            })))
            .await;
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let viewer = ViewerShared::new(
        state.next_id(),
        remote_addr,
        session::fingerprint(&remote_addr, user_agent.as_deref()),
        protocol_version,
        tx,
    );
    state.register(viewer.clone());
    debug!(viewer = viewer.id, %remote_addr, protocol_version, "viewer connected");

    // Writer task: everything outbound funnels through one channel so a
    // slow viewer only ever stalls its own task.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    viewer.send_frame(ViewerFrame::hello(state.cfg.viewer_heartbeat_interval_ms));

    loop {
        tokio::select! {
            maybe_msg = receiver.next() => match maybe_msg {
                Some(Ok(Message::Text(text))) => {
                    connection::handle_frame(&state, &viewer, &text);
                }
                Some(Ok(Message::Pong(_))) => {
                    // Transport-level liveness from the watchdog's pings.
                    viewer.is_alive.store(true, Ordering::SeqCst);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(viewer = viewer.id, error = %err, "viewer socket error");
                    break;
                }
            },
            _ = viewer.closed.cancelled() => {
                // A close frame is already queued; give the peer a bounded
                // window to finish the handshake, then force-terminate.
                let _ = timeout(Duration::from_secs(5), async {
                    while let Some(msg) = receiver.next().await {
                        if matches!(msg, Err(_) | Ok(Message::Close(_))) {
                            break;
                        }
                    }
                })
                .await;
                break;
            }
        }
    }

    connection::destroy(&state, &viewer, close_code::NORMAL);
    writer.abort();
    debug!(viewer = viewer.id, "viewer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard;

    fn test_state(cfg: Config) -> Arc<RelayState> {
        let cfg = Arc::new(cfg);
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(
            cfg.session_ttl_seconds,
        )));
        let rendezvous = Arc::new(RendezvousCache::new());
        // The receiver half is dropped; handle sends become no-ops, which is
        // fine for state-machine tests.
        let (handle, _rx) = shard::command_channel();
        Arc::new(RelayState::new(cfg, sessions, rendezvous, handle))
    }

    #[tokio::test]
    async fn empty_allowlist_admits_any_origin() {
        let state = test_state(Config::default());
        assert!(state.origin_allowed(None));
        assert!(state.origin_allowed(Some("https://anything.example")));
    }

    #[tokio::test]
    async fn allowlist_requires_a_listed_origin() {
        let state = test_state(Config {
            allowed_origins: vec!["https://ok.example".into()],
            ..Config::default()
        });
        assert!(state.origin_allowed(Some("https://ok.example")));
        assert!(!state.origin_allowed(Some("https://evil.example")));
        assert!(!state.origin_allowed(None));
    }

    #[tokio::test(start_paused = true)]
    async fn admission_bucket_exhausts_and_refills() {
        let state = test_state(Config {
            admissions_per_second: 2,
            ..Config::default()
        });
        let ip: IpAddr = "10.1.1.1".parse().unwrap();

        assert!(state.admit(ip));
        assert!(state.admit(ip));
        assert!(!state.admit(ip));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(state.admit(ip));

        // A different source address has its own bucket.
        let other: IpAddr = "10.1.1.2".parse().unwrap();
        assert!(state.admit(other));
    }
}
