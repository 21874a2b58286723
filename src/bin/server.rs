//! Dualwan Tunnel Server
//!
//! Accepts tunnel links over TLS (or plain TCP when insecure) and:
//! - Upgrades `/tunnel` requests into links of new or existing sessions
//! - Dials the backend of every stream a client opens
//! - Serves plain `CONNECT` requests as direct, non-multiplexed tunnels

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use dualwan_tunnel::{
    config::{generate_example_config, Config, TunnelConfig},
    protocol::{accept_upgrade, read_preamble, reject, Preamble, ProtocolError, HANDSHAKE_TIMEOUT},
    proxy::{BackendConnector, TcpConnector},
    transport::{load_acceptor, Io},
    tunnel::{Session, SessionRegistry},
};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Dualwan Tunnel Server - bonded multi-link tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "dualwan-server")]
#[command(about = "Dualwan Tunnel Server - bonds several links into one tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Server state shared across connections
struct ServerState {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn BackendConnector>,
    tunnel: TunnelConfig,
    /// Connection semaphore for limiting concurrent connections
    conn_semaphore: Arc<Semaphore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        println!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    // Environment-only deployments run without a config file
    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    config.apply_env();

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    let server_config = config.server.clone().unwrap_or_default();

    let tls_acceptor = if server_config.insecure {
        warn!("TLS disabled, serving plaintext links");
        None
    } else {
        match (&server_config.tls_cert, &server_config.tls_key) {
            (Some(cert), Some(key)) => Some(
                load_acceptor(cert, key).context("Failed to load TLS certificate and key")?,
            ),
            _ => bail!("tls_cert and tls_key are required unless insecure is set"),
        }
    };

    let state = Arc::new(ServerState {
        registry: Arc::new(SessionRegistry::new()),
        connector: Arc::new(TcpConnector::new(config.tunnel.connect_timeout())),
        tunnel: config.tunnel.clone(),
        conn_semaphore: Arc::new(Semaphore::new(server_config.max_connections)),
    });

    if let Some(health_addr) = &server_config.health_listen {
        let listener = TcpListener::bind(health_addr)
            .await
            .context("Failed to bind health endpoint")?;
        info!("Health endpoint on {}", health_addr);
        tokio::spawn(serve_health(listener));
    }

    let listen_addr = args.listen.unwrap_or(server_config.listen);

    info!("Dualwan Tunnel Server v{}", dualwan_tunnel::VERSION);
    info!("Listening on {}", listen_addr);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);

                        let state = Arc::clone(&state);
                        let acceptor = tls_acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, state, acceptor).await {
                                debug!("Connection error from {}: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    state.registry.close_all();
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    let Ok(permit) = state.conn_semaphore.clone().try_acquire_owned() else {
        warn!("Connection limit reached, dropping {}", peer);
        return Ok(());
    };
    stream.set_nodelay(true).ok();

    let handshake_timeout = Duration::from_secs(HANDSHAKE_TIMEOUT);
    match acceptor {
        Some(acceptor) => {
            let tls = tokio::time::timeout(handshake_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| anyhow!("TLS handshake timed out"))?
                .context("TLS handshake failed")?;
            serve(Guarded::new(tls, permit), peer, state).await
        }
        None => serve(Guarded::new(stream, permit), peer, state).await,
    }
}

async fn serve<S: Io>(mut io: S, peer: SocketAddr, state: Arc<ServerState>) -> Result<()> {
    let handshake_timeout = Duration::from_secs(HANDSHAKE_TIMEOUT);
    let preamble = match tokio::time::timeout(handshake_timeout, read_preamble(&mut io)).await {
        Ok(Ok(preamble)) => preamble,
        Ok(Err(e)) => {
            reject(&mut io, e.status()).await.ok();
            return Err(e.into());
        }
        Err(_) => bail!("handshake timed out"),
    };

    match preamble {
        Preamble::Upgrade(request) => {
            let (session, created) = match &request.session {
                Some(token) => match state.registry.get(token) {
                    Some(session) => (session, false),
                    None => {
                        reject(&mut io, 404).await.ok();
                        return Err(ProtocolError::UnknownSession(token.clone()).into());
                    }
                },
                None => {
                    let session = Session::acceptor(
                        request.target.clone(),
                        Some(state.connector.clone()),
                        state.tunnel.clone(),
                    );
                    state.registry.insert(session.clone());
                    (session, true)
                }
            };

            if let Err(e) = accept_upgrade(&mut io, session.token()).await {
                if created {
                    session.close();
                }
                return Err(e.into());
            }

            let link = session.attach_link(request.link.clone(), io)?;
            info!(
                session = %session.token(),
                link,
                name = %request.link,
                %peer,
                dest = ?session.target(),
                "link attached"
            );
            Ok(())
        }
        Preamble::Connect(target) => direct_tunnel(io, &target, true, &state).await,
        Preamble::RawConnect(target) => direct_tunnel(io, &target, false, &state).await,
        Preamble::Other(head) => {
            debug!("Unexpected {} {} from {}", head.method, head.target, peer);
            reject(&mut io, 404).await.ok();
            Ok(())
        }
    }
}

/// One backend connection per client connection, no multiplexing
async fn direct_tunnel<S: Io>(mut io: S, target: &str, http: bool, state: &ServerState) -> Result<()> {
    let mut backend = match state.connector.connect(target).await {
        Ok(backend) => backend,
        Err(e) => {
            if http {
                reject(&mut io, 502).await.ok();
            }
            return Err(e.into());
        }
    };

    if http {
        io.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
    }

    debug!("Direct tunnel to {}", target);
    let (up, down) = tokio::io::copy_bidirectional(&mut io, &mut backend).await?;
    debug!("Direct tunnel to {} closed ({} up, {} down)", target, up, down);
    Ok(())
}

async fn serve_health(listener: TcpListener) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            continue;
        };
        tokio::spawn(async move {
            let ok = matches!(
                read_preamble(&mut stream).await,
                Ok(Preamble::Other(head)) if head.method == "GET" && head.path() == "/healthz"
            );
            if ok {
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await
                    .ok();
            } else {
                reject(&mut stream, 404).await.ok();
            }
        });
    }
}

/// Holds a connection slot for as long as the stream lives
struct Guarded<S> {
    inner: S,
    _permit: OwnedSemaphorePermit,
}

impl<S> Guarded<S> {
    fn new(inner: S, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner,
            _permit: permit,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Guarded<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Guarded<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
