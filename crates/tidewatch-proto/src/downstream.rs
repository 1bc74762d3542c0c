//! The viewer-side protocol owned by tidewatch: JSON frames `{op, d, t?, s?}`
//! served to downstream WebSocket viewers. Dispatch frames carry the viewer's
//! own sequence number in `s`; control frames are unsequenced.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ViewerOpcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    Presence = 3,
    Subscribe = 4,
    Resume = 6,
    Hello = 10,
    HeartbeatAck = 11,
    InvalidOpcode = 12,
    DecodeError = 13,
    NotAuthenticated = 14,
    RateLimited = 15,
    SessionInvalidated = 16,
    ReconnectRequired = 17,
    ResumeSuggested = 18,
    Error = 19,
}

impl ViewerOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::Presence),
            4 => Some(Self::Subscribe),
            6 => Some(Self::Resume),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            12 => Some(Self::InvalidOpcode),
            13 => Some(Self::DecodeError),
            14 => Some(Self::NotAuthenticated),
            15 => Some(Self::RateLimited),
            16 => Some(Self::SessionInvalidated),
            17 => Some(Self::ReconnectRequired),
            18 => Some(Self::ResumeSuggested),
            19 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
}

impl ViewerFrame {
    pub fn control(op: ViewerOpcode, d: Value) -> Self {
        Self {
            op: op as u8,
            d,
            t: None,
            s: None,
        }
    }

    pub fn dispatch(kind: &str, seq: u64, d: Value) -> Self {
        Self {
            op: ViewerOpcode::Dispatch as u8,
            d,
            t: Some(kind.to_string()),
            s: Some(seq),
        }
    }

    pub fn hello(heartbeat_interval_ms: u64) -> Self {
        Self::control(
            ViewerOpcode::Hello,
            json!({ "heartbeat_interval": heartbeat_interval_ms }),
        )
    }

    pub fn heartbeat_ack(seq: u64) -> Self {
        Self::control(ViewerOpcode::HeartbeatAck, json!({ "seq": seq }))
    }
}

/// Frames a viewer may send, one variant per client opcode.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Identify {
        token: String,
        subject_ids: Vec<String>,
    },
    Heartbeat,
    Resume {
        session_id: String,
        seq: u64,
    },
    Subscribe {
        subject_ids: Vec<String>,
    },
    Presence {
        payload: Value,
    },
    /// Valid frame, opcode outside the client set.
    Unknown {
        op: u8,
    },
}

#[derive(Debug, Deserialize)]
struct IdentifyData {
    token: String,
    #[serde(default)]
    subject_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResumeData {
    session_id: String,
    seq: u64,
}

#[derive(Debug, Deserialize)]
struct SubscribeData {
    #[serde(default)]
    subject_ids: Vec<String>,
}

pub fn decode_client_frame(text: &str) -> Result<ClientCommand, ProtocolError> {
    let frame: ViewerFrame = serde_json::from_str(text)?;
    match ViewerOpcode::from_u8(frame.op) {
        Some(ViewerOpcode::Identify) => {
            let data: IdentifyData = serde_json::from_value(frame.d)?;
            Ok(ClientCommand::Identify {
                token: data.token,
                subject_ids: data.subject_ids,
            })
        }
        Some(ViewerOpcode::Heartbeat) => Ok(ClientCommand::Heartbeat),
        Some(ViewerOpcode::Resume) => {
            let data: ResumeData = serde_json::from_value(frame.d)?;
            Ok(ClientCommand::Resume {
                session_id: data.session_id,
                seq: data.seq,
            })
        }
        Some(ViewerOpcode::Subscribe) => {
            let data: SubscribeData = serde_json::from_value(frame.d)?;
            Ok(ClientCommand::Subscribe {
                subject_ids: data.subject_ids,
            })
        }
        Some(ViewerOpcode::Presence) => Ok(ClientCommand::Presence { payload: frame.d }),
        _ => Ok(ClientCommand::Unknown { op: frame.op }),
    }
}

/// Close codes tidewatch uses toward viewers.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const OVERLOADED: u16 = 1013;
    pub const INVALID_SESSION: u16 = 4004;
    pub const HEARTBEAT_TIMEOUT: u16 = 4009;
}

pub const PROTOCOL_V1: &str = "tidewatch.v1";
pub const PROTOCOL_V2: &str = "tidewatch.v2";

/// Pick the newest protocol version from a client's subprotocol offers,
/// falling back to v1 when nothing newer is offered.
pub fn negotiate_version<'a, I>(offers: I) -> &'static str
where
    I: IntoIterator<Item = &'a str>,
{
    for offer in offers {
        if offer.trim() == PROTOCOL_V2 {
            return PROTOCOL_V2;
        }
    }
    PROTOCOL_V1
}
