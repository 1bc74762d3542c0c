//! Per-viewer protocol state machine: identify, heartbeat, resume,
//! subscribe, presence relay, and teardown. Frames that fail to decode or
//! carry an unknown opcode get a notice and the connection stays up;
//! session-level failures destroy the connection with an invalid-session
//! close.

use axum::extract::ws::{CloseFrame, Message};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::{RelayState, ViewerShared};
use crate::metrics;
use crate::relay::session::ResumeOutcome;
use tidewatch_proto::downstream::{close_code, decode_client_frame, ClientCommand, ViewerOpcode};
use tidewatch_proto::upstream::subject_id_of;

pub fn handle_frame(state: &Arc<RelayState>, viewer: &Arc<ViewerShared>, text: &str) {
    match decode_client_frame(text) {
        Ok(cmd) => handle_command(state, viewer, cmd),
        Err(err) => {
            debug!(viewer = viewer.id, error = %err, "undecodable viewer frame");
            viewer.send_control(
                ViewerOpcode::DecodeError,
                json!({ "message": err.to_string() }),
            );
        }
    }
}

pub fn handle_command(state: &Arc<RelayState>, viewer: &Arc<ViewerShared>, cmd: ClientCommand) {
    match cmd {
        ClientCommand::Identify { token, subject_ids } => {
            identify(state, viewer, token, subject_ids)
        }
        ClientCommand::Heartbeat => heartbeat(viewer),
        ClientCommand::Resume { session_id, seq } => resume(state, viewer, session_id, seq),
        ClientCommand::Subscribe { subject_ids } => subscribe(state, viewer, subject_ids),
        ClientCommand::Presence { payload } => presence(viewer, payload),
        ClientCommand::Unknown { op } => {
            viewer.send_control(ViewerOpcode::InvalidOpcode, json!({ "op": op }));
        }
    }
}

fn identify(
    state: &Arc<RelayState>,
    viewer: &Arc<ViewerShared>,
    token: String,
    subject_ids: Vec<String>,
) {
    if viewer.identified.load(Ordering::SeqCst) || token.trim().is_empty() || subject_ids.is_empty()
    {
        destroy(state, viewer, close_code::INVALID_SESSION);
        return;
    }
    if let Err(err) = state
        .sessions
        .identify(&token, &viewer.fingerprint, subject_ids.clone())
    {
        warn!(viewer = viewer.id, error = %err, "identify rejected");
        destroy(state, viewer, close_code::INVALID_SESSION);
        return;
    }

    *viewer.session_id.lock() = Some(token.clone());
    *viewer.subscribed.lock() = subject_ids.clone();
    viewer.identified.store(true, Ordering::SeqCst);
    viewer.send_dispatch(
        "READY",
        json!({
            "session_id": token,
            "subject_ids": subject_ids,
            "protocol_version": viewer.protocol_version,
        }),
    );
    spawn_watchdog(state.clone(), viewer.clone());
    // Prime the rendezvous cache with the tracked subjects' member data.
    state.shard.request_members(subject_ids);
    debug!(viewer = viewer.id, "viewer identified");
}

fn heartbeat(viewer: &Arc<ViewerShared>) {
    if !viewer.identified.load(Ordering::SeqCst) {
        viewer.send_control(
            ViewerOpcode::NotAuthenticated,
            json!({ "message": "identify before heartbeating" }),
        );
        return;
    }
    viewer.missed_pings.store(0, Ordering::SeqCst);
    viewer.is_alive.store(true, Ordering::SeqCst);
    viewer.send_frame(tidewatch_proto::downstream::ViewerFrame::heartbeat_ack(
        viewer.seq.load(Ordering::SeqCst),
    ));
}

fn resume(state: &Arc<RelayState>, viewer: &Arc<ViewerShared>, session_id: String, seq: u64) {
    match state.sessions.resume(&session_id, seq) {
        ResumeOutcome::Matched {
            subject_ids,
            last_seq,
        } => {
            *viewer.session_id.lock() = Some(session_id.clone());
            viewer.seq.store(last_seq, Ordering::SeqCst);
            *viewer.subscribed.lock() = subject_ids;
            viewer.identified.store(true, Ordering::SeqCst);
            viewer.missed_pings.store(0, Ordering::SeqCst);
            viewer.send_dispatch("RESUMED", json!({ "session_id": session_id }));
            spawn_watchdog(state.clone(), viewer.clone());
            debug!(viewer = viewer.id, session = %session_id, "viewer resumed");
        }
        ResumeOutcome::Mismatch => {
            debug!(viewer = viewer.id, session = %session_id, "resume rejected");
            viewer.send_control(
                ViewerOpcode::SessionInvalidated,
                json!({ "resumable": false }),
            );
        }
    }
}

fn subscribe(state: &Arc<RelayState>, viewer: &Arc<ViewerShared>, subject_ids: Vec<String>) {
    if !viewer.identified.load(Ordering::SeqCst) {
        viewer.send_control(
            ViewerOpcode::NotAuthenticated,
            json!({ "message": "identify before subscribing" }),
        );
        return;
    }
    if subject_ids.is_empty() {
        return;
    }
    state.shard.request_members(subject_ids);
}

/// Echo a presence payload back, but only when it names the viewer's
/// primary tracked subject.
fn presence(viewer: &Arc<ViewerShared>, payload: serde_json::Value) {
    if !viewer.identified.load(Ordering::SeqCst) {
        viewer.send_control(
            ViewerOpcode::NotAuthenticated,
            json!({ "message": "identify before relaying presence" }),
        );
        return;
    }
    let primary = viewer.primary_subject();
    if subject_id_of(&payload) == primary {
        viewer.send_dispatch("PRESENCE_UPDATE", payload);
    } else {
        debug!(
            viewer = viewer.id,
            "dropping presence payload for a non-primary subject"
        );
    }
}

/// Tear a viewer down. Idempotent; safe to call from the socket task and
/// the watchdog concurrently. Certain close codes notify the viewer before
/// the close frame so the client knows whether to resume or reconnect.
pub fn destroy(state: &RelayState, viewer: &Arc<ViewerShared>, code: u16) {
    if viewer.destroyed.swap(true, Ordering::SeqCst) {
        return;
    }

    match code {
        close_code::HEARTBEAT_TIMEOUT => {
            viewer.send_control(
                ViewerOpcode::ResumeSuggested,
                json!({ "reason": "heartbeat timeout" }),
            );
        }
        close_code::OVERLOADED => {
            viewer.send_control(
                ViewerOpcode::ReconnectRequired,
                json!({ "reason": "server overloaded" }),
            );
        }
        close_code::INVALID_SESSION => {
            viewer.send_control(
                ViewerOpcode::SessionInvalidated,
                json!({ "resumable": false }),
            );
        }
        _ => {}
    }

    // Persist the sequence checkpoint and start the session TTL clock; the
    // record stays resumable until it fires.
    if let Some(session_id) = viewer.session_id.lock().clone() {
        state
            .sessions
            .checkpoint(&session_id, viewer.seq.load(Ordering::SeqCst));
    }

    viewer.send_socket(Message::Close(Some(CloseFrame {
        code,
        reason: close_reason(code).into(),
    })));
    state.remove(viewer.id);
    viewer.closed.cancel();
    debug!(viewer = viewer.id, code, "viewer destroyed");
}

fn close_reason(code: u16) -> &'static str {
    match code {
        close_code::NORMAL => "closing",
        close_code::INTERNAL_ERROR => "internal error",
        close_code::OVERLOADED => "server busy",
        close_code::INVALID_SESSION => "invalid session",
        close_code::HEARTBEAT_TIMEOUT => "heartbeat timeout",
        _ => "",
    }
}

/// Server-side watchdog, independent of client-initiated heartbeats: every
/// interval it charges a missed ping unless the liveness flag was set since
/// the last tick, and destroys the viewer once the budget is spent.
pub fn spawn_watchdog(state: Arc<RelayState>, viewer: Arc<ViewerShared>) {
    if viewer.watchdog_started.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        let period = Duration::from_millis(state.cfg.viewer_heartbeat_interval_ms);
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = viewer.closed.cancelled() => return,
                _ = ticker.tick() => {
                    if viewer.missed_pings.load(Ordering::SeqCst) >= state.cfg.max_missed_pings {
                        metrics::VIEWER_TIMEOUTS.inc();
                        destroy(&state, &viewer, close_code::HEARTBEAT_TIMEOUT);
                        return;
                    }
                    let was_alive = viewer.is_alive.swap(false, Ordering::SeqCst);
                    if !was_alive {
                        let missed = viewer.missed_pings.fetch_add(1, Ordering::SeqCst) + 1;
                        if missed >= state.cfg.max_missed_pings {
                            metrics::VIEWER_TIMEOUTS.inc();
                            destroy(&state, &viewer, close_code::HEARTBEAT_TIMEOUT);
                            return;
                        }
                        viewer.send_socket(Message::Ping(Vec::new()));
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::session::SessionStore;
    use crate::rendezvous::RendezvousCache;
    use crate::shard::{self, ShardCommand};
    use std::net::SocketAddr;
    use tidewatch_proto::downstream::ViewerFrame;
    use tokio::sync::mpsc;

    fn test_state(cfg: Config) -> (Arc<RelayState>, mpsc::UnboundedReceiver<ShardCommand>) {
        let cfg = Arc::new(cfg);
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(
            cfg.session_ttl_seconds,
        )));
        let rendezvous = Arc::new(RendezvousCache::new());
        let (handle, rx) = shard::command_channel();
        (
            Arc::new(RelayState::new(cfg, sessions, rendezvous, handle)),
            rx,
        )
    }

    fn test_viewer() -> (Arc<ViewerShared>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let viewer = ViewerShared::new(1, addr, "fp-test".into(), "tidewatch.v2", tx);
        (viewer, rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> ViewerFrame {
        match rx.try_recv().expect("expected a queued frame") {
            Message::Text(text) => serde_json::from_str(&text).expect("frame decodes"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    fn next_close(rx: &mut mpsc::UnboundedReceiver<Message>) -> u16 {
        loop {
            match rx.try_recv().expect("expected a queued close") {
                Message::Close(Some(frame)) => return frame.code,
                Message::Close(None) => panic!("close frame carried no code"),
                _ => continue,
            }
        }
    }

    fn identify_cmd(token: &str, subjects: &[&str]) -> ClientCommand {
        ClientCommand::Identify {
            token: token.into(),
            subject_ids: subjects.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn identify_returns_a_sequenced_ready() {
        let (state, _shard_rx) = test_state(Config::default());
        let (viewer, mut rx) = test_viewer();

        handle_command(&state, &viewer, identify_cmd("sess-1", &["42"]));

        let ready = next_frame(&mut rx);
        assert_eq!(ready.op, ViewerOpcode::Dispatch as u8);
        assert_eq!(ready.t.as_deref(), Some("READY"));
        assert_eq!(ready.s, Some(1));
        assert_eq!(ready.d["session_id"], "sess-1");
        assert!(viewer.identified.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn identify_twice_is_an_invalid_session() {
        let (state, _shard_rx) = test_state(Config::default());
        let (viewer, mut rx) = test_viewer();

        handle_command(&state, &viewer, identify_cmd("sess-1", &["42"]));
        let _ready = next_frame(&mut rx);
        handle_command(&state, &viewer, identify_cmd("sess-2", &["42"]));

        let notice = next_frame(&mut rx);
        assert_eq!(notice.op, ViewerOpcode::SessionInvalidated as u8);
        assert_eq!(next_close(&mut rx), close_code::INVALID_SESSION);
        assert!(viewer.destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn identify_requires_token_and_subjects() {
        let (state, _shard_rx) = test_state(Config::default());

        let (viewer, mut rx) = test_viewer();
        handle_command(&state, &viewer, identify_cmd("", &["42"]));
        let notice = next_frame(&mut rx);
        assert_eq!(notice.op, ViewerOpcode::SessionInvalidated as u8);
        assert_eq!(next_close(&mut rx), close_code::INVALID_SESSION);

        let (viewer, mut rx) = test_viewer();
        handle_command(&state, &viewer, identify_cmd("sess-1", &[]));
        let notice = next_frame(&mut rx);
        assert_eq!(notice.op, ViewerOpcode::SessionInvalidated as u8);
        assert_eq!(next_close(&mut rx), close_code::INVALID_SESSION);
    }

    #[tokio::test]
    async fn heartbeat_requires_identify_then_acks_with_current_seq() {
        let (state, _shard_rx) = test_state(Config::default());
        let (viewer, mut rx) = test_viewer();

        handle_command(&state, &viewer, ClientCommand::Heartbeat);
        assert_eq!(
            next_frame(&mut rx).op,
            ViewerOpcode::NotAuthenticated as u8
        );

        handle_command(&state, &viewer, identify_cmd("sess-1", &["42"]));
        let _ready = next_frame(&mut rx);
        viewer.missed_pings.store(2, Ordering::SeqCst);

        handle_command(&state, &viewer, ClientCommand::Heartbeat);
        let ack = next_frame(&mut rx);
        assert_eq!(ack.op, ViewerOpcode::HeartbeatAck as u8);
        assert_eq!(ack.d["seq"], 1);
        assert_eq!(viewer.missed_pings.load(Ordering::SeqCst), 0);
        assert!(viewer.is_alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn resume_restores_the_checkpointed_session() {
        let (state, _shard_rx) = test_state(Config::default());
        state
            .sessions
            .identify("sess-r", "fp-test", vec!["7".into(), "8".into()])
            .unwrap();
        state.sessions.checkpoint("sess-r", 5);

        let (viewer, mut rx) = test_viewer();
        handle_command(
            &state,
            &viewer,
            ClientCommand::Resume {
                session_id: "sess-r".into(),
                seq: 5,
            },
        );

        let resumed = next_frame(&mut rx);
        assert_eq!(resumed.t.as_deref(), Some("RESUMED"));
        assert_eq!(resumed.s, Some(6)); // continues from the checkpoint
        assert!(viewer.identified.load(Ordering::SeqCst));
        assert_eq!(
            *viewer.subscribed.lock(),
            vec!["7".to_string(), "8".to_string()]
        );
    }

    #[tokio::test]
    async fn resume_mismatch_invalidates_without_carryover() {
        let (state, _shard_rx) = test_state(Config::default());
        state
            .sessions
            .identify("sess-r", "fp-test", vec!["7".into()])
            .unwrap();
        state.sessions.checkpoint("sess-r", 5);

        let (viewer, mut rx) = test_viewer();
        handle_command(
            &state,
            &viewer,
            ClientCommand::Resume {
                session_id: "sess-r".into(),
                seq: 4,
            },
        );

        let notice = next_frame(&mut rx);
        assert_eq!(notice.op, ViewerOpcode::SessionInvalidated as u8);
        assert_eq!(notice.d["resumable"], false);
        assert!(!viewer.identified.load(Ordering::SeqCst));
        assert!(viewer.subscribed.lock().is_empty());
        assert!(!viewer.destroyed.load(Ordering::SeqCst)); // stays connected
    }

    #[tokio::test]
    async fn subscribe_forwards_subjects_upstream() {
        let (state, mut shard_rx) = test_state(Config::default());
        let (viewer, mut rx) = test_viewer();

        handle_command(&state, &viewer, identify_cmd("sess-1", &["42"]));
        let _ready = next_frame(&mut rx);
        // identify primes the cache with its own member request
        assert!(matches!(
            shard_rx.try_recv(),
            Ok(ShardCommand::RequestMembers { .. })
        ));

        handle_command(
            &state,
            &viewer,
            ClientCommand::Subscribe {
                subject_ids: vec!["7".into(), "8".into()],
            },
        );
        match shard_rx.try_recv() {
            Ok(ShardCommand::RequestMembers { subject_ids }) => {
                assert_eq!(subject_ids, vec!["7", "8"]);
            }
            other => panic!("expected a member request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_echoes_only_the_primary_subject() {
        let (state, _shard_rx) = test_state(Config::default());
        let (viewer, mut rx) = test_viewer();
        handle_command(&state, &viewer, identify_cmd("sess-1", &["42", "7"]));
        let _ready = next_frame(&mut rx);

        handle_command(
            &state,
            &viewer,
            ClientCommand::Presence {
                payload: json!({ "user": { "id": "42" }, "status": "dnd" }),
            },
        );
        let echoed = next_frame(&mut rx);
        assert_eq!(echoed.t.as_deref(), Some("PRESENCE_UPDATE"));
        assert_eq!(echoed.d["status"], "dnd");

        handle_command(
            &state,
            &viewer,
            ClientCommand::Presence {
                payload: json!({ "user": { "id": "7" }, "status": "idle" }),
            },
        );
        assert!(rx.try_recv().is_err()); // non-primary subject, dropped
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_do_not_disconnect() {
        let (state, _shard_rx) = test_state(Config::default());
        let (viewer, mut rx) = test_viewer();

        handle_frame(&state, &viewer, "not json at all");
        assert_eq!(next_frame(&mut rx).op, ViewerOpcode::DecodeError as u8);

        handle_frame(&state, &viewer, r#"{"op":42,"d":null}"#);
        let notice = next_frame(&mut rx);
        assert_eq!(notice.op, ViewerOpcode::InvalidOpcode as u8);
        assert_eq!(notice.d["op"], 42);

        assert!(!viewer.destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_checkpoints_the_session() {
        let (state, _shard_rx) = test_state(Config::default());
        let (viewer, mut rx) = test_viewer();
        handle_command(&state, &viewer, identify_cmd("sess-1", &["42"]));
        let _ready = next_frame(&mut rx);

        destroy(&state, &viewer, close_code::HEARTBEAT_TIMEOUT);
        destroy(&state, &viewer, close_code::HEARTBEAT_TIMEOUT);

        let notice = next_frame(&mut rx);
        assert_eq!(notice.op, ViewerOpcode::ResumeSuggested as u8);
        assert_eq!(next_close(&mut rx), close_code::HEARTBEAT_TIMEOUT);
        assert!(rx.try_recv().is_err()); // second destroy sent nothing

        let record = state.sessions.get("sess-1").unwrap();
        assert_eq!(record.last_seq, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_viewer_is_destroyed_after_exactly_max_missed_ticks() {
        let (state, _shard_rx) = test_state(Config {
            viewer_heartbeat_interval_ms: 1000,
            max_missed_pings: 3,
            ..Config::default()
        });
        let (viewer, mut rx) = test_viewer();
        handle_command(&state, &viewer, identify_cmd("sess-1", &["42"]));
        let _ready = next_frame(&mut rx);

        // Two ticks in: pinged twice, still connected.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(!viewer.destroyed.load(Ordering::SeqCst));
        assert_eq!(viewer.missed_pings.load(Ordering::SeqCst), 2);

        // Third tick spends the budget.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(viewer.destroyed.load(Ordering::SeqCst));

        // Drain the two watchdog pings, then the teardown notice + close.
        let mut pings = 0;
        loop {
            match rx.try_recv().expect("expected more frames") {
                Message::Ping(_) => pings += 1,
                Message::Text(text) => {
                    let frame: ViewerFrame = serde_json::from_str(&text).unwrap();
                    assert_eq!(frame.op, ViewerOpcode::ResumeSuggested as u8);
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(pings, 2);
        assert_eq!(next_close(&mut rx), close_code::HEARTBEAT_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_the_watchdog_satisfied() {
        let (state, _shard_rx) = test_state(Config {
            viewer_heartbeat_interval_ms: 1000,
            max_missed_pings: 3,
            ..Config::default()
        });
        let (viewer, mut rx) = test_viewer();
        handle_command(&state, &viewer, identify_cmd("sess-1", &["42"]));
        let _ready = next_frame(&mut rx);

        for _ in 0..6 {
            handle_command(&state, &viewer, ClientCommand::Heartbeat);
            tokio::time::sleep(Duration::from_millis(900)).await;
        }
        assert!(!viewer.destroyed.load(Ordering::SeqCst));
    }
}
