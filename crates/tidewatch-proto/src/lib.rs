//! Shared wire-protocol definitions for the tidewatch relay.
//! Keeping these in a dedicated crate allows regeneration of bindings
//! for other consumers without pulling in the runtime code.

pub mod downstream;
pub mod upstream;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("dispatch frame missing event kind")]
    MissingEventKind,
    #[error("payload missing field `{0}`")]
    MissingField(&'static str),
}
