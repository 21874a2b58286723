//! Transport layer implementations
//!
//! Provides the dialers that establish physical links:
//! - TCP, optionally bound to a local address so each link leaves through
//!   its own WAN interface
//! - TLS over TCP

mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use tcp::TcpDialer;

#[cfg(feature = "tls")]
pub use tls::{load_acceptor, TlsDialer};

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A bidirectional byte stream usable as a link or a backend
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn Io>;

/// Establishes outgoing connections
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`, binding the local end to `bind` when given
    async fn dial(&self, addr: &str, bind: Option<&str>) -> Result<BoxedIo, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }
}
