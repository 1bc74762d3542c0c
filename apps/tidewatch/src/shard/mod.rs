//! Upstream shard: owns the single outbound socket to the remote gateway and
//! keeps exactly one logical session alive across socket churn. Implements
//! identify/resume, heartbeat liveness with zombie detection, bounded-backoff
//! connection establishment, and close-code driven recovery. Inbound events
//! are normalized into the rendezvous cache and the coalesced broadcast queue.

pub mod coalesce;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::metrics;
use crate::rendezvous::RendezvousCache;
use coalesce::Coalescer;
use tidewatch_proto::upstream::{
    decode_frame, heartbeat_frame, identify_frame, recovery_for_close, request_members_frame,
    resume_frame, subject_id_of, DispatchEvent, GatewayEvent, GatewayFrame, RecoveryDirective,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_AWAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("exhausted {attempts} connection attempts to the gateway")]
    ConnectExhausted { attempts: u32 },
    #[error("gateway refused the session with close code {code}")]
    Fatal { code: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Idle,
    Connecting,
    Resuming,
    Ready,
}

/// Session state carried across socket churn. Preserved on resume-style
/// recovery, cleared on reconnect-style recovery.
#[derive(Debug, Default, Clone)]
pub struct ShardSession {
    pub seq: Option<u64>,
    pub token: Option<String>,
    pub resume_url: Option<Url>,
}

#[derive(Debug)]
pub enum ShardCommand {
    /// Forward a viewer's subject list upstream as a member request.
    RequestMembers { subject_ids: Vec<String> },
    /// Raw frame from the HTTP collaborator's `send` surface.
    Send(GatewayFrame),
    Shutdown,
}

#[derive(Clone)]
pub struct ShardHandle {
    tx: mpsc::UnboundedSender<ShardCommand>,
}

impl ShardHandle {
    pub fn request_members(&self, subject_ids: Vec<String>) {
        let _ = self.tx.send(ShardCommand::RequestMembers { subject_ids });
    }

    pub fn send(&self, frame: GatewayFrame) {
        let _ = self.tx.send(ShardCommand::Send(frame));
    }

    /// Idempotent: shutting down an already-idle shard is a no-op.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ShardCommand::Shutdown);
    }
}

pub fn command_channel() -> (ShardHandle, mpsc::UnboundedReceiver<ShardCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ShardHandle { tx }, rx)
}

enum Outcome {
    Recover(RecoveryDirective),
    Fatal { code: u16 },
    Shutdown,
}

enum Connect {
    Stream(Box<WsStream>),
    Shutdown,
}

pub struct Shard {
    cfg: Arc<Config>,
    status: ShardStatus,
    session: ShardSession,
    rendezvous: Arc<RendezvousCache>,
    coalescer: Arc<Coalescer>,
    /// Set on socket errors, cleared on every successful open; decides
    /// recovery for close codes outside the policy table.
    network_error_seen: bool,
    resume_replay_count: u64,
    last_heartbeat_latency: Option<Duration>,
}

impl Shard {
    pub fn new(cfg: Arc<Config>, rendezvous: Arc<RendezvousCache>, coalescer: Arc<Coalescer>) -> Self {
        Self {
            cfg,
            status: ShardStatus::Idle,
            session: ShardSession::default(),
            rendezvous,
            coalescer,
            network_error_seen: false,
            resume_replay_count: 0,
            last_heartbeat_latency: None,
        }
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    /// Round-trip latency of the most recently acked heartbeat.
    pub fn heartbeat_latency(&self) -> Option<Duration> {
        self.last_heartbeat_latency
    }

    fn can_resume(&self) -> bool {
        self.session.token.is_some()
            && self.session.seq.is_some()
            && self.session.resume_url.is_some()
    }

    fn connect_endpoint(&self) -> String {
        match (&self.session.resume_url, self.can_resume()) {
            (Some(url), true) => url.to_string(),
            _ => self.cfg.gateway_url.clone(),
        }
    }

    /// Run until shut down or a fatal error. Reconnects per the recovery
    /// policy; fatal errors (exhausted connects, unrecoverable close codes)
    /// are surfaced to the caller, who owns the process-level decision.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ShardCommand>,
    ) -> Result<(), ShardError> {
        loop {
            let endpoint = self.connect_endpoint();
            let resuming = self.can_resume();
            let stream = match self
                .establish_connection(&endpoint, resuming, &mut commands)
                .await?
            {
                Connect::Stream(stream) => stream,
                Connect::Shutdown => {
                    self.status = ShardStatus::Idle;
                    return Ok(());
                }
            };

            match self.drive(*stream, &mut commands).await {
                Outcome::Shutdown => {
                    self.status = ShardStatus::Idle;
                    info!("shard shut down");
                    return Ok(());
                }
                Outcome::Fatal { code } => {
                    self.status = ShardStatus::Idle;
                    self.session = ShardSession::default();
                    return Err(ShardError::Fatal { code });
                }
                Outcome::Recover(directive) => {
                    self.status = ShardStatus::Idle;
                    match directive {
                        RecoveryDirective::Resume => {
                            metrics::SHARD_RECOVERIES.with_label_values(&["resume"]).inc();
                            info!(seq = ?self.session.seq, "recovering gateway session via resume");
                        }
                        RecoveryDirective::Reconnect | RecoveryDirective::None => {
                            metrics::SHARD_RECOVERIES
                                .with_label_values(&["reconnect"])
                                .inc();
                            info!("recovering with a fresh gateway session");
                            self.session = ShardSession::default();
                        }
                    }
                }
            }
        }
    }

    /// Bounded connection attempts with exponential backoff and jitter.
    /// Exhausting the attempts is fatal. Commands arriving while
    /// disconnected are dropped with a warning, never queued.
    async fn establish_connection(
        &mut self,
        endpoint: &str,
        resuming: bool,
        commands: &mut mpsc::UnboundedReceiver<ShardCommand>,
    ) -> Result<Connect, ShardError> {
        let base = Duration::from_millis(self.cfg.connect_base_delay_ms);
        let max = Duration::from_millis(self.cfg.connect_max_delay_ms);

        for attempt in 1..=self.cfg.connect_attempts {
            if drain_disconnected_commands(commands) {
                return Ok(Connect::Shutdown);
            }
            self.status = if resuming {
                ShardStatus::Resuming
            } else {
                ShardStatus::Connecting
            };

            match connect_async(endpoint).await {
                Ok((stream, _)) => {
                    info!(endpoint, attempt, "gateway socket open");
                    self.network_error_seen = false;
                    return Ok(Connect::Stream(Box::new(stream)));
                }
                Err(err) => {
                    self.network_error_seen = true;
                    warn!(endpoint, attempt, error = %err, "gateway connect failed");
                    if attempt < self.cfg.connect_attempts {
                        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=1000));
                        sleep(backoff_delay(attempt, base, max) + jitter).await;
                    }
                }
            }
        }

        self.status = ShardStatus::Idle;
        Err(ShardError::ConnectExhausted {
            attempts: self.cfg.connect_attempts,
        })
    }

    /// Drive one socket until it closes. Returns what to do next.
    async fn drive(
        &mut self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<ShardCommand>,
    ) -> Outcome {
        let (mut write_half, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let writer_cfg = self.cfg.clone();
        let writer = tokio::spawn(async move {
            let mut budget = SendBudget::new(&writer_cfg);
            while let Some(msg) = out_rx.recv().await {
                if matches!(msg, Message::Text(_)) {
                    budget.acquire().await;
                }
                let is_close = matches!(msg, Message::Close(_));
                if write_half.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Handshake timing state for this socket. The jittered first
        // heartbeat and the recurring timer are deadlines inside the select
        // loop so teardown cancels them by dropping the loop.
        let mut heartbeat_interval: Option<Duration> = None;
        let mut first_heartbeat_at: Option<Instant> = None;
        let mut next_heartbeat_at: Option<Instant> = None;
        let mut acked = true;
        let mut heartbeat_sent_at: Option<Instant> = None;

        let mut close_code: Option<u16> = None;
        let mut outcome: Option<Outcome> = None;
        let mut initiated_close = false;

        loop {
            let first_deadline = first_heartbeat_at;
            let next_deadline = next_heartbeat_at;

            tokio::select! {
                maybe_msg = read.next() => match maybe_msg {
                    Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                        Ok(GatewayEvent::Hello { heartbeat_interval_ms }) => {
                            let interval = Duration::from_millis(heartbeat_interval_ms);
                            heartbeat_interval = Some(interval);
                            let jitter = Duration::from_millis(
                                (rand::thread_rng().gen::<f64>() * heartbeat_interval_ms as f64)
                                    as u64,
                            );
                            first_heartbeat_at = Some(Instant::now() + jitter);
                            debug!(
                                interval_ms = heartbeat_interval_ms,
                                jitter_ms = jitter.as_millis() as u64,
                                "gateway hello received"
                            );
                        }
                        Ok(GatewayEvent::HeartbeatAck) => {
                            acked = true;
                            if let Some(sent_at) = heartbeat_sent_at.take() {
                                let latency = sent_at.elapsed();
                                self.last_heartbeat_latency = Some(latency);
                                debug!(latency_ms = latency.as_millis() as u64, "heartbeat acked");
                            }
                        }
                        Ok(GatewayEvent::HeartbeatRequest) => {
                            send_frame(&out_tx, &heartbeat_frame(self.session.seq));
                        }
                        Ok(GatewayEvent::Reconnect) => {
                            info!("gateway requested reconnect");
                            outcome = Some(Outcome::Recover(RecoveryDirective::Resume));
                            initiated_close = true;
                            let _ = out_tx.send(Message::Close(None));
                            break;
                        }
                        Ok(GatewayEvent::InvalidSession { resumable }) => {
                            warn!(resumable, "gateway invalidated the session");
                            let directive = if resumable {
                                RecoveryDirective::Resume
                            } else {
                                RecoveryDirective::Reconnect
                            };
                            outcome = Some(Outcome::Recover(directive));
                            initiated_close = true;
                            let _ = out_tx.send(Message::Close(None));
                            break;
                        }
                        Ok(GatewayEvent::Dispatch { seq, event }) => {
                            self.handle_dispatch(seq, event);
                        }
                        Err(err) => {
                            warn!(error = %err, "skipping undecodable gateway frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        debug!(code = ?close_code, "gateway closed the socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "gateway socket error");
                        self.network_error_seen = true;
                        break;
                    }
                    None => {
                        self.network_error_seen = true;
                        break;
                    }
                },

                // Jittered first heartbeat, then resume or identify, then the
                // recurring timer starts.
                _ = async { sleep_until(first_deadline.unwrap()).await },
                    if first_deadline.is_some() =>
                {
                    first_heartbeat_at = None;
                    let interval = heartbeat_interval.unwrap_or(Duration::from_secs(45));
                    send_frame(&out_tx, &heartbeat_frame(self.session.seq));
                    acked = false;
                    heartbeat_sent_at = Some(Instant::now());

                    if self.can_resume() {
                        let token = self.session.token.clone().unwrap_or_default();
                        let seq = self.session.seq.unwrap_or(0);
                        self.status = ShardStatus::Resuming;
                        self.resume_replay_count = 0;
                        send_frame(
                            &out_tx,
                            &resume_frame(&self.cfg.gateway_token, &token, seq),
                        );
                        info!(seq, "resume requested");
                    } else {
                        send_frame(&out_tx, &identify_frame(&self.cfg.gateway_token));
                        info!("identify sent");
                    }
                    next_heartbeat_at = Some(Instant::now() + interval);
                }

                // Recurring heartbeat. An unacked previous cycle means the
                // socket is a zombie: tear down and resume instead of sending.
                _ = async { sleep_until(next_deadline.unwrap()).await },
                    if next_deadline.is_some() =>
                {
                    if !acked {
                        warn!("heartbeat unacked; presuming zombie connection");
                        metrics::ZOMBIE_TEARDOWNS.inc();
                        outcome = Some(Outcome::Recover(RecoveryDirective::Resume));
                        initiated_close = true;
                        let _ = out_tx.send(Message::Close(None));
                        break;
                    }
                    acked = false;
                    heartbeat_sent_at = Some(Instant::now());
                    send_frame(&out_tx, &heartbeat_frame(self.session.seq));
                    let interval = heartbeat_interval.unwrap_or(Duration::from_secs(45));
                    next_heartbeat_at = Some(Instant::now() + interval);
                }

                cmd = commands.recv() => match cmd {
                    Some(ShardCommand::RequestMembers { subject_ids }) => {
                        if self.status == ShardStatus::Ready {
                            send_frame(&out_tx, &request_members_frame(&subject_ids));
                        } else {
                            warn!("dropping member request while gateway session not ready");
                        }
                    }
                    Some(ShardCommand::Send(frame)) => {
                        send_frame(&out_tx, &frame);
                    }
                    Some(ShardCommand::Shutdown) | None => {
                        outcome = Some(Outcome::Shutdown);
                        initiated_close = true;
                        let _ = out_tx.send(Message::Close(None));
                        break;
                    }
                },
            }
        }

        // If we initiated the close, await the peer's close (or time out)
        // so the handshake completes before the socket drops.
        if initiated_close {
            let _ = timeout(CLOSE_AWAIT, async {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Close(frame)) => {
                            close_code = close_code.or(frame.map(|f| u16::from(f.code)));
                            break;
                        }
                        Err(_) => break,
                        _ => {}
                    }
                }
            })
            .await;
        }
        drop(out_tx);
        let _ = timeout(CLOSE_AWAIT, writer).await;

        if let Some(outcome) = outcome {
            return outcome;
        }

        let fallback = if self.network_error_seen {
            RecoveryDirective::Reconnect
        } else {
            RecoveryDirective::Resume
        };
        match close_code {
            Some(code) => match recovery_for_close(code) {
                Some(RecoveryDirective::None) => Outcome::Fatal { code },
                Some(directive) => Outcome::Recover(directive),
                None => Outcome::Recover(fallback),
            },
            None => Outcome::Recover(fallback),
        }
    }

    fn handle_dispatch(&mut self, seq: Option<u64>, event: DispatchEvent) {
        if let Some(seq) = seq {
            self.session.seq = Some(seq);
            if self.status == ShardStatus::Resuming {
                self.resume_replay_count += 1;
            }
        }

        match event {
            DispatchEvent::Ready(ready) => {
                self.status = ShardStatus::Ready;
                self.session.token = Some(ready.session_id.clone());
                self.session.resume_url = match Url::parse(&ready.resume_gateway_url) {
                    Ok(url) => Some(url),
                    Err(err) => {
                        warn!(error = %err, "ready carried an unparsable resume endpoint");
                        None
                    }
                };
                self.resume_replay_count = 0;
                info!(session = %ready.session_id, "gateway session ready");
            }
            DispatchEvent::Resumed => {
                self.status = ShardStatus::Ready;
                info!(
                    replayed = self.resume_replay_count,
                    "gateway session resumed"
                );
            }
            DispatchEvent::PresenceUpdate {
                subject_id,
                payload,
            } => {
                self.rendezvous.set(&subject_id, payload.clone());
                self.coalescer.emit(&subject_id, "PRESENCE_UPDATE", payload);
            }
            DispatchEvent::GuildMembersChunk(chunk) => {
                for member in chunk.members {
                    match subject_id_of(&member) {
                        Some(subject_id) => {
                            self.rendezvous.set(&subject_id, member.clone());
                            self.coalescer.emit(&subject_id, "MEMBER_CHUNK", member);
                        }
                        None => debug!("member chunk entry without a subject id"),
                    }
                }
            }
            DispatchEvent::MessageCreate(payload) => {
                if let Some(subject_id) = subject_id_of(&payload) {
                    self.coalescer.emit(&subject_id, "MESSAGE_CREATE", payload);
                }
            }
            DispatchEvent::Other { kind, .. } => {
                debug!(kind, "ignoring dispatch outside the relayed set");
            }
        }
    }
}

fn send_frame(out_tx: &mpsc::UnboundedSender<Message>, frame: &GatewayFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = out_tx.send(Message::Text(text));
        }
        Err(err) => warn!(error = %err, "failed to encode gateway frame"),
    }
}

/// Drain commands arriving while no socket exists. Sends are dropped with a
/// warning rather than queued; returns true when a shutdown was requested.
fn drain_disconnected_commands(commands: &mut mpsc::UnboundedReceiver<ShardCommand>) -> bool {
    use mpsc::error::TryRecvError;
    loop {
        match commands.try_recv() {
            Ok(ShardCommand::Shutdown) => return true,
            Ok(_) => warn!("dropping outbound gateway send while disconnected"),
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// Rolling outbound budget. The gateway enforces its own per-window send
/// limit; staying a few sends under it avoids a rate-limit close.
struct SendBudget {
    remaining: u32,
    budget: u32,
    window: Duration,
    window_resets_at: Instant,
}

impl SendBudget {
    fn new(cfg: &Config) -> Self {
        let window = Duration::from_secs(cfg.send_window_seconds);
        Self {
            remaining: cfg.send_budget_per_window,
            budget: cfg.send_budget_per_window,
            window,
            window_resets_at: Instant::now() + window,
        }
    }

    async fn acquire(&mut self) {
        let now = Instant::now();
        if now >= self.window_resets_at {
            self.remaining = self.budget;
            self.window_resets_at = now + self.window;
        }
        if self.remaining == 0 {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
            sleep_until(self.window_resets_at + jitter).await;
            self.remaining = self.budget;
            self.window_resets_at = Instant::now() + self.window;
        }
        self.remaining -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(30_000);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(5, base, max), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(10, base, max), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn send_budget_sleeps_to_window_reset_when_exhausted() {
        let cfg = Config {
            send_budget_per_window: 2,
            send_window_seconds: 60,
            ..Config::default()
        };
        let mut budget = SendBudget::new(&cfg);

        let start = Instant::now();
        budget.acquire().await;
        budget.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third send crosses the budget: it waits out the window.
        budget.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[test]
    fn resume_requires_full_session_state() {
        let cfg = Arc::new(Config::default());
        let rendezvous = Arc::new(RendezvousCache::new());
        let sink: Arc<dyn coalesce::BroadcastSink> = Arc::new(NullSink);
        let coalescer = Arc::new(Coalescer::new(
            Duration::from_secs(5),
            Duration::from_secs(60),
            sink,
        ));
        let mut shard = Shard::new(cfg, rendezvous, coalescer);

        assert!(!shard.can_resume());
        shard.session.token = Some("sess".into());
        shard.session.seq = Some(12);
        assert!(!shard.can_resume());
        shard.session.resume_url = Some(Url::parse("ws://resume.example").unwrap());
        assert!(shard.can_resume());
        assert_eq!(shard.connect_endpoint(), "ws://resume.example/");
    }

    struct NullSink;

    impl coalesce::BroadcastSink for NullSink {
        fn deliver(&self, _subject_id: &str, _kind: &str, _payload: serde_json::Value) {}
    }
}
