//! Tunnel layer - framed multiplexing over bonded links
//!
//! Provides:
//! - Frame encoding/decoding
//! - Per-stream reassembly and backpressure
//! - The stream table and link scheduler
//! - Session orchestration across several links

mod frame;
mod link;
mod registry;
mod scheduler;
mod session;
mod stream;
mod table;

pub use frame::{
    flags, write_frame, Frame, FrameKind, FrameReader, FRAME_HEADER_SIZE, FRAME_VERSION, MAGIC,
};
pub use link::{Link, LinkHealth, LinkId, LinkStats};
pub use registry::SessionRegistry;
pub use scheduler::LinkSet;
pub use session::{Session, SessionState};
pub use stream::{Flow, LogicalStream, Receipt, StreamState};
pub use table::{Dispatch, Role, StreamTable};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Malformed frame: bad magic {0:02x?}")]
    MalformedFrame([u8; 4]),

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    TruncatedFrame { needed: usize, available: usize },

    #[error("Payload too large: {0} > {1}")]
    PayloadTooLarge(usize, usize),

    #[error("No link available")]
    NoLinkAvailable,

    #[error("Stream {0} stalled on a sequence gap")]
    StreamStalled(u32),

    #[error("Stream {0} idle")]
    StreamIdle(u32),

    #[error("Stream {0} reorder buffer overflow")]
    BufferOverflow(u32),

    #[error("Backend dial to {target} failed: {reason}")]
    BackendDialFailure { target: String, reason: String },

    #[error("Stream {0} open timed out")]
    OpenTimeout(u32),

    #[error("Stream {0} refused by peer")]
    OpenRefused(u32),

    #[error("Stream {0} reset by peer")]
    StreamReset(u32),

    #[error("Stream {0} protocol violation: {1}")]
    ProtocolViolation(u32, &'static str),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Too many streams")]
    TooManyStreams,

    #[error("Session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Wire-level errors are fatal to the link that produced them
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            TunnelError::MalformedFrame(_)
                | TunnelError::TruncatedFrame { .. }
                | TunnelError::PayloadTooLarge(..)
        )
    }
}

/// Maximum number of concurrent streams per session
pub const MAX_STREAMS: usize = 4096;

/// Default maximum payload size (64 KiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Default per-stream reorder budget (1 MiB)
pub const DEFAULT_STREAM_BUDGET: usize = 1024 * 1024;
