//! HTTP CONNECT proxy front-end
//!
//! Each accepted `CONNECT host:port` opens a stream on the current tunnel
//! session and bridges the client socket to it.

use super::{Address, ProxyError};
use crate::protocol::{read_request, reject, RequestHead};
use crate::tunnel::{Session, TunnelError};
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// HTTP CONNECT proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    /// Optional basic authentication as "username:password"
    auth: Option<Arc<str>>,
}

impl HttpProxyServer {
    /// Create a new HTTP proxy server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Require Basic `Proxy-Authorization` with these credentials
    pub fn with_auth(mut self, credentials: impl Into<String>) -> Self {
        self.auth = Some(Arc::from(credentials.into()));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, each on the session current at accept time
    pub async fn run(self, sessions: watch::Receiver<Arc<Session>>) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New HTTP proxy connection from {}", peer_addr);

            let session = sessions.borrow().clone();
            let auth = self.auth.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, session, auth).await {
                    debug!(peer = %peer_addr, error = %e, "HTTP proxy request failed");
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    session: Arc<Session>,
    auth: Option<Arc<str>>,
) -> Result<(), ProxyError> {
    stream.set_nodelay(true).ok();

    let head = match read_request(&mut stream).await {
        Ok(head) => head,
        Err(e) => {
            reject(&mut stream, e.status()).await.ok();
            return Err(e.into());
        }
    };

    if let Some(expected) = &auth {
        if !authorized(&head, expected) {
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"dualwan\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await?;
            return Err(ProxyError::AuthenticationFailed);
        }
    }

    if head.method != "CONNECT" {
        reject(&mut stream, 405).await?;
        return Err(ProxyError::MethodNotAllowed(head.method));
    }

    let address = match Address::parse(&head.target) {
        Ok(address) => address,
        Err(e) => {
            reject(&mut stream, 400).await?;
            return Err(e);
        }
    };

    let id = match session.connect(&address.to_string()).await {
        Ok(id) => id,
        Err(e) => {
            warn!(dest = %address, error = %e, "CONNECT failed");
            reject(&mut stream, 502).await?;
            return Err(e.into());
        }
    };

    debug!(stream = id, dest = %address, "HTTP CONNECT established");
    if let Err(e) = stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
    {
        session.abort_stream(id, &TunnelError::Io(e));
        return Ok(());
    }

    session.spawn_bridge(id, stream)?;
    Ok(())
}

fn authorized(head: &RequestHead, expected: &str) -> bool {
    head.header("proxy-authorization")
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .ok()
        })
        .map(|decoded| decoded == expected.as_bytes())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(auth: Option<&str>) -> RequestHead {
        let mut text = String::from("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n");
        if let Some(auth) = auth {
            text.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        text.push_str("\r\n");
        RequestHead::parse(&text).unwrap()
    }

    #[test]
    fn test_basic_auth() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pass");
        assert!(authorized(&head(Some(&format!("Basic {}", encoded))), "user:pass"));
        assert!(!authorized(&head(Some(&format!("Basic {}", encoded))), "user:other"));
        assert!(!authorized(&head(Some("Bearer abc")), "user:pass"));
        assert!(!authorized(&head(None), "user:pass"));
    }
}
