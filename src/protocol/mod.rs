//! Protocol definitions and constants

pub mod handshake;

pub use handshake::{
    accept_upgrade, client_handshake, read_preamble, read_request, reject, Preamble,
    RequestHead, UpgradeRequest,
};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Unexpected request: {0}")]
    UnexpectedRequest(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Request head exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// HTTP status a server answers this error with
    pub fn status(&self) -> u16 {
        match self {
            ProtocolError::UnknownSession(_) => 404,
            ProtocolError::HeaderTooLarge(_) => 431,
            _ => 400,
        }
    }
}

/// Upgrade token of the tunnel protocol
pub const UPGRADE_PROTOCOL: &str = "dwnb";

/// Response header carrying the session token
pub const SESSION_HEADER: &str = "Dwnb-Session";

/// Path of the upgrade endpoint
pub const TUNNEL_PATH: &str = "/tunnel";

/// Maximum request/response head size
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 30;
