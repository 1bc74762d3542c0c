//! The gateway-side protocol: JSON frames `{op, d, s?, t?}` consumed from
//! (and sent to) the remote push-event gateway. Tidewatch does not own this
//! protocol; it decodes the subset of opcodes and dispatch kinds it relays.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ProtocolError;

/// Numeric opcodes on the gateway socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayOpcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    Resume = 6,
    Reconnect = 7,
    RequestMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl GatewayOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }
}

/// Raw gateway frame as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// A gateway frame decoded into exactly one variant per opcode.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Hello { heartbeat_interval_ms: u64 },
    /// The gateway may request an immediate heartbeat.
    HeartbeatRequest,
    HeartbeatAck,
    Reconnect,
    InvalidSession { resumable: bool },
    Dispatch { seq: Option<u64>, event: DispatchEvent },
}

/// Dispatch sub-kinds the relay cares about. Anything else is carried
/// through as `Other` so sequence bookkeeping still sees it.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Ready(ReadyData),
    Resumed,
    MessageCreate(Value),
    GuildMembersChunk(MembersChunk),
    PresenceUpdate { subject_id: String, payload: Value },
    Other { kind: String, payload: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    pub resume_gateway_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersChunk {
    pub members: Vec<Value>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub chunk_count: u32,
}

/// Pull the subject id out of an opaque payload. Presence and member
/// payloads nest it under `user`, messages under `author`, and the gateway
/// serializes ids as strings or integers depending on the event.
pub fn subject_id_of(payload: &Value) -> Option<String> {
    let id = payload
        .get("user")
        .and_then(|u| u.get("id"))
        .or_else(|| payload.get("author").and_then(|a| a.get("id")))
        .or_else(|| payload.get("user_id"))
        .or_else(|| payload.get("id"))?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn decode_frame(text: &str) -> Result<GatewayEvent, ProtocolError> {
    let frame: GatewayFrame = serde_json::from_str(text)?;
    let op = GatewayOpcode::from_u8(frame.op).ok_or(ProtocolError::UnknownOpcode(frame.op))?;

    match op {
        GatewayOpcode::Hello => {
            let interval = frame
                .d
                .get("heartbeat_interval")
                .and_then(Value::as_u64)
                .ok_or(ProtocolError::MissingField("heartbeat_interval"))?;
            Ok(GatewayEvent::Hello {
                heartbeat_interval_ms: interval,
            })
        }
        GatewayOpcode::Heartbeat => Ok(GatewayEvent::HeartbeatRequest),
        GatewayOpcode::HeartbeatAck => Ok(GatewayEvent::HeartbeatAck),
        GatewayOpcode::Reconnect => Ok(GatewayEvent::Reconnect),
        GatewayOpcode::InvalidSession => Ok(GatewayEvent::InvalidSession {
            resumable: frame.d.as_bool().unwrap_or(false),
        }),
        GatewayOpcode::Dispatch => {
            let kind = frame.t.ok_or(ProtocolError::MissingEventKind)?;
            let event = match kind.as_str() {
                "READY" => DispatchEvent::Ready(serde_json::from_value(frame.d)?),
                "RESUMED" => DispatchEvent::Resumed,
                "MESSAGE_CREATE" => DispatchEvent::MessageCreate(frame.d),
                "GUILD_MEMBERS_CHUNK" => {
                    DispatchEvent::GuildMembersChunk(serde_json::from_value(frame.d)?)
                }
                "PRESENCE_UPDATE" => {
                    let subject_id =
                        subject_id_of(&frame.d).ok_or(ProtocolError::MissingField("user.id"))?;
                    DispatchEvent::PresenceUpdate {
                        subject_id,
                        payload: frame.d,
                    }
                }
                _ => DispatchEvent::Other {
                    kind,
                    payload: frame.d,
                },
            };
            Ok(GatewayEvent::Dispatch {
                seq: frame.s,
                event,
            })
        }
        // Identify / Resume / RequestMembers are client-to-gateway only.
        GatewayOpcode::Identify | GatewayOpcode::Resume | GatewayOpcode::RequestMembers => {
            Err(ProtocolError::UnknownOpcode(frame.op))
        }
    }
}

pub fn heartbeat_frame(seq: Option<u64>) -> GatewayFrame {
    GatewayFrame {
        op: GatewayOpcode::Heartbeat as u8,
        d: seq.map(|s| json!(s)).unwrap_or(Value::Null),
        s: None,
        t: None,
    }
}

pub fn identify_frame(token: &str) -> GatewayFrame {
    GatewayFrame {
        op: GatewayOpcode::Identify as u8,
        d: json!({ "token": token }),
        s: None,
        t: None,
    }
}

pub fn resume_frame(token: &str, session_token: &str, seq: u64) -> GatewayFrame {
    GatewayFrame {
        op: GatewayOpcode::Resume as u8,
        d: json!({ "token": token, "session_id": session_token, "seq": seq }),
        s: None,
        t: None,
    }
}

pub fn request_members_frame(subject_ids: &[String]) -> GatewayFrame {
    GatewayFrame {
        op: GatewayOpcode::RequestMembers as u8,
        d: json!({ "user_ids": subject_ids }),
        s: None,
        t: None,
    }
}

/// What the shard should do after its socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDirective {
    /// Fatal; surface to the process owner, keep the shard down.
    None,
    /// Drop session state and identify from scratch.
    Reconnect,
    /// Keep session state and resume at the held sequence.
    Resume,
}

/// Gateway close codes with a pinned recovery policy.
pub mod close_code {
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;
}

/// Recovery policy for a gateway close code. Returns `Option::None` for
/// codes outside the table; the shard then falls back on whether a network
/// error was observed since the last successful open.
pub fn recovery_for_close(code: u16) -> Option<RecoveryDirective> {
    use close_code::*;
    match code {
        AUTHENTICATION_FAILED | INVALID_SHARD | SHARDING_REQUIRED | INVALID_INTENTS
        | DISALLOWED_INTENTS => Some(RecoveryDirective::None),
        UNKNOWN_ERROR | UNKNOWN_OPCODE | DECODE_ERROR | RATE_LIMITED | SESSION_TIMEOUT => {
            Some(RecoveryDirective::Resume)
        }
        NOT_AUTHENTICATED | ALREADY_AUTHENTICATED | INVALID_SEQ => {
            Some(RecoveryDirective::Reconnect)
        }
        // Server-initiated going-away closes: the session is gone with it.
        1000 | 1001 => Some(RecoveryDirective::Reconnect),
        _ => None,
    }
}
