//! Proxy front-ends and the stream bridge
//!
//! Provides:
//! - the bridge between a logical stream and a backend byte stream
//! - a local HTTP CONNECT proxy that opens tunnel streams
//! - a local SOCKS5 proxy that does the same

pub mod bridge;

#[cfg(feature = "http-proxy")]
mod http;

#[cfg(feature = "socks5")]
mod socks5;

pub use bridge::{BackendConnector, TcpConnector};

#[cfg(feature = "http-proxy")]
pub use http::HttpProxyServer;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Server;

use crate::protocol::ProtocolError;
use crate::tunnel::TunnelError;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// IPv6 address and port
    Ipv6(Ipv6Addr, u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Parse `host:port`, `[v6]:port` or `host port`
    pub fn parse(input: &str) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(input.to_string());
        let input = input.trim();

        let (host, port) = match input.split_once(char::is_whitespace) {
            Some((host, port)) => (host, port.trim()),
            None => input.rsplit_once(':').ok_or_else(invalid)?,
        };
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(Address::Ipv4(ip, port));
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(ip, port));
        }
        if host.contains(':') {
            return Err(invalid());
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) | Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            Address::parse("example.com:443").unwrap(),
            Address::Domain("example.com".into(), 443)
        );
        assert_eq!(
            Address::parse("10.0.0.1 22").unwrap(),
            Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 22)
        );
        assert_eq!(
            Address::parse("[::1]:8080").unwrap().to_string(),
            "[::1]:8080"
        );
        assert_eq!(Address::parse("example.com:443").unwrap().port(), 443);
    }

    #[test]
    fn test_parse_invalid_address() {
        assert!(Address::parse("example.com").is_err());
        assert!(Address::parse("example.com:http").is_err());
        assert!(Address::parse(":80").is_err());
    }
}
