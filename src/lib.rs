//! # Dualwan Tunnel
//!
//! Bonds several unreliable, independently latent links (for example two
//! mobile WAN uplinks) into one logical tunnel carrying proxied TCP streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Proxy Layer                      │
//! │      (HTTP CONNECT front-end, stream bridges)       │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Layer                     │
//! │   (stream table, link scheduler, link read loops)   │
//! ├─────────────────────────────────────────────────────┤
//! │                    Frame Layer                      │
//! │     (DWNB frames, per-stream seq reassembly)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                    │
//! │  (HTTP Upgrade handshake, TCP/TLS, bound dialing)   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Frames of one stream may arrive over any link in any order; each stream
//! reassembles them by sequence number before handing bytes to its backend.

pub mod config;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port for the tunnel server
pub const DEFAULT_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
