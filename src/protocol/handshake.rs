//! Link handshake and connection preambles
//!
//! A link starts life as an HTTP/1.1 request:
//! ```text
//! GET /tunnel?link=main&session=<token>&target=host:port HTTP/1.1
//! Host: tunnel.example.com
//! Connection: Upgrade
//! Upgrade: dwnb
//! ```
//! answered by `101 Switching Protocols` with a `Dwnb-Session` header.
//! Heads are read one byte at a time so no frame bytes are consumed.
//!
//! The server also understands a plain `CONNECT host:port HTTP/1.1`
//! request and the bare `CONNECT host port` line.

use super::{ProtocolError, MAX_HEAD_SIZE, SESSION_HEADER, TUNNEL_PATH, UPGRADE_PROTOCOL};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A parsed HTTP request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head (request line plus header lines)
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut lines = text.lines();
        let request_line = lines.next().unwrap_or_default();

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
            return Err(ProtocolError::UnexpectedRequest(request_line.to_string()));
        }

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Ok(Self {
            method: parts[0].to_string(),
            target: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
        })
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.target)
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        let (_, query) = self.target.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| percent_decode(v))
            .filter(|v| !v.is_empty())
    }
}

/// Parameters of a link upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Link name, e.g. "main" or "helper"
    pub link: String,
    /// Token of the session to join
    pub session: Option<String>,
    /// Fixed backend for CONNECT-style sessions
    pub target: Option<String>,
}

impl UpgradeRequest {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            session: None,
            target: None,
        }
    }

    pub fn with_session(mut self, token: impl Into<String>) -> Self {
        self.session = Some(token.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Render the request head
    pub fn encode(&self, host: &str) -> String {
        let mut target = format!("{}?link={}", TUNNEL_PATH, percent_encode(&self.link));
        if let Some(session) = &self.session {
            target.push_str("&session=");
            target.push_str(&percent_encode(session));
        }
        if let Some(dest) = &self.target {
            target.push_str("&target=");
            target.push_str(&percent_encode(dest));
        }

        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: {}\r\n\r\n",
            target, host, UPGRADE_PROTOCOL
        )
    }

    fn from_head(head: &RequestHead) -> Result<Self, ProtocolError> {
        let upgrade = head.header("upgrade").unwrap_or_default();
        if !upgrade.eq_ignore_ascii_case(UPGRADE_PROTOCOL) {
            return Err(ProtocolError::HandshakeFailed(format!(
                "unsupported upgrade: {:?}",
                upgrade
            )));
        }

        let link = head
            .query_param("link")
            .ok_or_else(|| ProtocolError::HandshakeFailed("missing link parameter".into()))?;

        Ok(Self {
            link,
            session: head.query_param("session"),
            target: head.query_param("target"),
        })
    }
}

/// What an accepted connection asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    /// Tunnel link upgrade
    Upgrade(UpgradeRequest),
    /// `CONNECT host:port HTTP/1.1`
    Connect(String),
    /// `CONNECT host port`
    RawConnect(String),
    /// Any other HTTP request
    Other(RequestHead),
}

/// Read and classify the first bytes of an accepted connection
pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Preamble, ProtocolError> {
    let mut head = Vec::with_capacity(256);
    read_line(reader, &mut head).await?;

    let first = String::from_utf8_lossy(&head).trim_end().to_string();
    let parts: Vec<&str> = first.split_whitespace().collect();
    if let ["CONNECT", host, port] = parts.as_slice() {
        if let Ok(port) = port.parse::<u16>() {
            return Ok(Preamble::RawConnect(join_host_port(host, port)));
        }
    }

    loop {
        let start = head.len();
        read_line(reader, &mut head).await?;
        if is_blank(&head[start..]) {
            break;
        }
    }

    let head = RequestHead::parse(&String::from_utf8_lossy(&head))?;
    match head.method.as_str() {
        "CONNECT" => Ok(Preamble::Connect(head.target.clone())),
        "GET" if head.path() == TUNNEL_PATH => Ok(Preamble::Upgrade(UpgradeRequest::from_head(&head)?)),
        _ => Ok(Preamble::Other(head)),
    }
}

/// Read an HTTP request head (used by the local CONNECT proxy)
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RequestHead, ProtocolError> {
    let head = read_head(reader).await?;
    RequestHead::parse(&head)
}

/// Send the upgrade request and wait for the session token
pub async fn client_handshake<S>(
    io: &mut S,
    host: &str,
    request: &UpgradeRequest,
) -> Result<String, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(request.encode(host).as_bytes()).await?;
    io.flush().await?;

    let head = read_head(io).await?;
    let status_line = head.lines().next().unwrap_or_default().to_string();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProtocolError::HandshakeFailed(status_line.clone()))?;

    match status {
        101 => head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(SESSION_HEADER))
            .map(|(_, v)| v.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ProtocolError::HandshakeFailed("missing session token".into())),
        404 => Err(ProtocolError::UnknownSession(
            request.session.clone().unwrap_or_default(),
        )),
        _ => Err(ProtocolError::HandshakeFailed(status_line)),
    }
}

/// Accept a link upgrade
pub async fn accept_upgrade<W: AsyncWrite + Unpin>(writer: &mut W, token: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: {}\r\nConnection: Upgrade\r\n{}: {}\r\n\r\n",
        UPGRADE_PROTOCOL, SESSION_HEADER, token
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// Answer with an error status and no body
pub async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, status: u16) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status,
        reason(status)
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

pub(crate) fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        431 => "Request Header Fields Too Large",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut head = Vec::with_capacity(256);
    loop {
        let start = head.len();
        read_line(reader, &mut head).await?;
        if is_blank(&head[start..]) && start > 0 {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Append one line (including its `\n`) to `buf`
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProtocolError::HeaderTooLarge(MAX_HEAD_SIZE));
        }
        if reader.read(&mut byte).await? == 0 {
            return Err(ProtocolError::HandshakeFailed(
                "connection closed during handshake".into(),
            ));
        }
        buf.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(());
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'[' | b']' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upgrade_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = UpgradeRequest::new("helper")
            .with_session("00ff")
            .with_target("10.0.0.1:22");

        let server_task = tokio::spawn(async move {
            let preamble = read_preamble(&mut server).await.unwrap();
            accept_upgrade(&mut server, "00ff").await.unwrap();
            // Frame bytes right after the head must be left unread
            let mut rest = [0u8; 4];
            server.read_exact(&mut rest).await.unwrap();
            (preamble, rest)
        });

        let token = client_handshake(&mut client, "tunnel.example.com", &request)
            .await
            .unwrap();
        client.write_all(b"DWNB").await.unwrap();

        let (preamble, rest) = server_task.await.unwrap();
        assert_eq!(token, "00ff");
        assert_eq!(preamble, Preamble::Upgrade(request));
        assert_eq!(&rest, b"DWNB");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = UpgradeRequest::new("main").with_session("dead");

        tokio::spawn(async move {
            read_preamble(&mut server).await.unwrap();
            reject(&mut server, 404).await.unwrap();
        });

        let err = client_handshake(&mut client, "h", &request).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownSession(t) if t == "dead"));
    }

    #[tokio::test]
    async fn test_wrong_upgrade_token() {
        let mut input: &[u8] =
            b"GET /tunnel?link=main HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let err = read_preamble(&mut input).await.unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeFailed(_)));
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_connect_preambles() {
        let mut http: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        assert_eq!(
            read_preamble(&mut http).await.unwrap(),
            Preamble::Connect("example.com:443".into())
        );

        let mut raw: &[u8] = b"CONNECT example.com 80\nhello";
        assert_eq!(
            read_preamble(&mut raw).await.unwrap(),
            Preamble::RawConnect("example.com:80".into())
        );
        assert_eq!(raw, b"hello");

        let mut raw6: &[u8] = b"CONNECT ::1 8080\n";
        assert_eq!(
            read_preamble(&mut raw6).await.unwrap(),
            Preamble::RawConnect("[::1]:8080".into())
        );
    }

    #[tokio::test]
    async fn test_other_request() {
        let mut input: &[u8] = b"GET /healthz HTTP/1.1\r\nHost: h\r\n\r\n";
        match read_preamble(&mut input).await.unwrap() {
            Preamble::Other(head) => assert_eq!(head.path(), "/healthz"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_head_too_large() {
        let mut big = b"GET /tunnel?link=main HTTP/1.1\r\n".to_vec();
        big.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        let mut input: &[u8] = &big;
        assert!(matches!(
            read_preamble(&mut input).await,
            Err(ProtocolError::HeaderTooLarge(_))
        ));
    }

    #[test]
    fn test_query_decoding() {
        let head = RequestHead::parse(
            "GET /tunnel?link=main&target=example.com%3A443&session= HTTP/1.1\r\nUpgrade: dwnb\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.path(), "/tunnel");
        assert_eq!(head.query_param("target").as_deref(), Some("example.com:443"));
        assert_eq!(head.query_param("session"), None);
        assert_eq!(head.header("UPGRADE"), Some("dwnb"));
    }
}
