//! SOCKS5 proxy front-end (RFC 1928, CONNECT only)
//!
//! Each accepted CONNECT opens a stream on the current tunnel session. The
//! success reply is only sent once the far end has dialed the target.

use super::{Address, ProxyError};
use crate::tunnel::{Session, TunnelError};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password subnegotiation version (RFC 1929)
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    fn for_error(error: &TunnelError) -> Self {
        match error {
            TunnelError::BackendDialFailure { .. } | TunnelError::OpenTimeout(_) => {
                Reply::HostUnreachable
            }
            _ => Reply::GeneralFailure,
        }
    }
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    /// Optional username/password authentication
    auth: Option<Arc<(String, String)>>,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Require username/password authentication, given as "user:password"
    pub fn with_auth(mut self, credentials: &str) -> Self {
        let (user, pass) = credentials.split_once(':').unwrap_or((credentials, ""));
        self.auth = Some(Arc::new((user.to_string(), pass.to_string())));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, each on the session current at accept time
    pub async fn run(self, sessions: watch::Receiver<Arc<Session>>) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let session = sessions.borrow().clone();
            let auth = self.auth.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, session, auth).await {
                    debug!(peer = %peer_addr, error = %e, "SOCKS5 request failed");
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    session: Arc<Session>,
    auth: Option<Arc<(String, String)>>,
) -> Result<(), ProxyError> {
    stream.set_nodelay(true).ok();

    negotiate(&mut stream, auth.as_deref()).await?;
    let address = read_connect(&mut stream).await?;

    let id = match session.connect(&address.to_string()).await {
        Ok(id) => id,
        Err(e) => {
            warn!(dest = %address, error = %e, "SOCKS5 CONNECT failed");
            stream
                .write_all(&make_reply(Reply::for_error(&e), &address))
                .await?;
            return Err(e.into());
        }
    };

    debug!(stream = id, dest = %address, "SOCKS5 CONNECT established");
    if let Err(e) = stream
        .write_all(&make_reply(Reply::Succeeded, &address))
        .await
    {
        session.abort_stream(id, &TunnelError::Io(e));
        return Ok(());
    }

    session.spawn_bridge(id, stream)?;
    Ok(())
}

/// Method selection and, when required, username/password authentication
async fn negotiate<S>(stream: &mut S, auth: Option<&(String, String)>) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 255];
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    let offered = &buf[..nmethods];

    let wanted = if auth.is_some() {
        AuthMethod::UsernamePassword
    } else {
        AuthMethod::NoAuth
    };
    let method = if offered.contains(&(wanted as u8)) {
        wanted
    } else {
        AuthMethod::NoAcceptable
    };

    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    match (method, auth) {
        (AuthMethod::NoAcceptable, _) => Err(ProxyError::AuthenticationFailed),
        (AuthMethod::UsernamePassword, Some((user, pass))) => {
            stream.read_exact(&mut buf[..2]).await?;
            if buf[0] != AUTH_VERSION {
                return Err(ProxyError::AuthenticationFailed);
            }
            let ulen = buf[1] as usize;
            let mut username = vec![0u8; ulen];
            stream.read_exact(&mut username).await?;

            stream.read_exact(&mut buf[..1]).await?;
            let mut password = vec![0u8; buf[0] as usize];
            stream.read_exact(&mut password).await?;

            let ok = username == user.as_bytes() && password == pass.as_bytes();
            stream
                .write_all(&[AUTH_VERSION, if ok { 0x00 } else { 0x01 }])
                .await?;
            if ok {
                Ok(())
            } else {
                Err(ProxyError::AuthenticationFailed)
            }
        }
        _ => Ok(()),
    }
}

/// Read the request; anything but CONNECT is answered and refused
async fn read_connect<S>(stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(head[0]));
    }

    let unspecified = Address::Ipv4(Ipv4Addr::UNSPECIFIED, 0);
    let command = match Command::try_from(head[1]) {
        Ok(command) => command,
        Err(e) => {
            stream
                .write_all(&make_reply(Reply::CommandNotSupported, &unspecified))
                .await?;
            return Err(e);
        }
    };
    let address = match AddressType::try_from(head[3]) {
        Ok(kind) => read_address(stream, kind).await?,
        Err(e) => {
            stream
                .write_all(&make_reply(Reply::AddressTypeNotSupported, &unspecified))
                .await?;
            return Err(e);
        }
    };

    if command != Command::Connect {
        stream
            .write_all(&make_reply(Reply::CommandNotSupported, &address))
            .await?;
        return Err(ProxyError::UnsupportedCommand(command as u8));
    }
    Ok(address)
}

async fn read_address<R: AsyncRead + Unpin>(
    reader: &mut R,
    kind: AddressType,
) -> Result<Address, ProxyError> {
    let address = match kind {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            reader.read_exact(&mut ip).await?;
            Address::Ipv4(Ipv4Addr::from(ip), reader.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            reader.read_exact(&mut ip).await?;
            Address::Ipv6(Ipv6Addr::from(ip), reader.read_u16().await?)
        }
        AddressType::Domain => {
            let len = reader.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| ProxyError::InvalidAddress("non-UTF-8 domain".into()))?;
            Address::Domain(domain, reader.read_u16().await?)
        }
    };
    Ok(address)
}

fn make_reply(reply: Reply, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];

    match addr {
        Address::Ipv4(ip, port) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            // A domain longer than 255 bytes cannot have been requested
            let name = &domain.as_bytes()[..domain.len().min(255)];
            buf.push(AddressType::Domain as u8);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name);
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_no_auth_connect_domain() {
        let (mut client, mut server) = duplex(1024);

        let task = tokio::spawn(async move {
            negotiate(&mut server, None).await?;
            read_connect(&mut server).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let address = task.await.unwrap().unwrap();
        assert_eq!(address, Address::Domain("example.com".into(), 443));
    }

    #[tokio::test]
    async fn test_password_auth() {
        let creds = ("user".to_string(), "secret".to_string());
        let (mut client, mut server) = duplex(1024);

        let expected = creds.clone();
        let task = tokio::spawn(async move { negotiate(&mut server, Some(&expected)).await });

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x02]);

        client
            .write_all(&[0x01, 4, b'u', b's', b'e', b'r', 5, b'w', b'r', b'o', b'n', b'g'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);
        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_auth_required_but_not_offered() {
        let creds = ("user".to_string(), "secret".to_string());
        let (mut client, mut server) = duplex(1024);
        let task = tokio::spawn(async move { negotiate(&mut server, Some(&creds)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bind_is_refused() {
        let (mut client, mut server) = duplex(1024);
        let task = tokio::spawn(async move { read_connect(&mut server).await });

        let mut request = vec![0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1];
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::UnsupportedCommand(0x02))
        ));
    }

    #[test]
    fn test_reply_layout() {
        let reply = make_reply(Reply::Succeeded, &Address::Ipv6(Ipv6Addr::LOCALHOST, 8080));
        assert_eq!(reply.len(), 4 + 16 + 2);
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x04]);
        assert_eq!(&reply[20..], &8080u16.to_be_bytes());

        assert_eq!(
            Reply::for_error(&TunnelError::BackendDialFailure {
                target: "h:1".into(),
                reason: "refused".into(),
            }),
            Reply::HostUnreachable
        );
    }
}
