use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static ADMISSIONS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tidewatch_admissions_rejected_total",
            "Viewer sockets refused at admission",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BROADCASTS_FLUSHED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tidewatch_broadcasts_flushed_total",
        "Coalesced broadcasts delivered to the fan-out path",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COALESCED_SUPERSEDED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tidewatch_coalesced_superseded_total",
        "Payloads dropped because a newer payload arrived in the same quiet window",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SHARD_RECOVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tidewatch_shard_recoveries_total",
            "Upstream socket teardowns by recovery directive",
        ),
        &["directive"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ZOMBIE_TEARDOWNS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tidewatch_zombie_teardowns_total",
        "Upstream connections presumed dead after a missed heartbeat ack",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static VIEWER_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tidewatch_viewer_timeouts_total",
        "Viewer connections destroyed by the heartbeat watchdog",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
