//! Raw TCP dialer

use super::{BoxedIo, Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

/// Raw TCP dialer
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Connect and return the concrete stream
    pub async fn connect(
        &self,
        addr: &str,
        bind: Option<&str>,
    ) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, self.open(addr, bind))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }
        Ok(stream)
    }

    async fn open(&self, addr: &str, bind: Option<&str>) -> Result<TcpStream, TransportError> {
        let Some(bind) = bind else {
            return Ok(TcpStream::connect(addr).await?);
        };

        let local = parse_bind(bind)?;
        let mut last_err = None;
        for remote in lookup_host(addr).await? {
            if remote.is_ipv4() != local.is_ipv4() {
                continue;
            }
            let socket = if remote.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(local)?;
            debug!(%local, %remote, "dialing bound link");
            match socket.connect(remote).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => TransportError::Io(e),
            None => TransportError::ConnectionFailed(format!(
                "no address of {} matches local {}",
                addr, local
            )),
        })
    }
}

/// Accepts "ip" or "ip:port"
fn parse_bind(bind: &str) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = bind.parse::<SocketAddr>() {
        return Ok(addr);
    }
    bind.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 0))
        .map_err(|_| TransportError::ConnectionFailed(format!("invalid bind address: {}", bind)))
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, bind: Option<&str>) -> Result<BoxedIo, TransportError> {
        Ok(Box::new(self.connect(addr, bind).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dial() {
        // Start a simple echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            peer
        });

        let dialer = TcpDialer::default();
        let mut io = dialer
            .dial(&addr.to_string(), Some("127.0.0.1"))
            .await
            .unwrap();

        let msg = b"Hello, TCP!";
        io.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = io.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        let peer = server.await.unwrap();
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn test_parse_bind() {
        assert_eq!(
            parse_bind("10.0.0.2").unwrap(),
            "10.0.0.2:0".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_bind("10.0.0.2:4000").unwrap(),
            "10.0.0.2:4000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind("wan0").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(TcpDialer::default()
            .connect(&addr.to_string(), None)
            .await
            .is_err());
    }
}
