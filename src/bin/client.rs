//! Dualwan Tunnel Client
//!
//! Bonds every configured uplink into one tunnel session and:
//! - Runs local HTTP CONNECT and SOCKS5 proxies whose requests become tunnel streams
//! - Or forwards every local connection to one fixed target
//! - Re-dials dead links and re-creates the session if it was lost

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use dualwan_tunnel::{
    config::{ClientConfig, Config, LinkConfig, TunnelConfig},
    protocol::{client_handshake, ProtocolError, UpgradeRequest, HANDSHAKE_TIMEOUT},
    proxy::{HttpProxyServer, Socks5Server},
    transport::{BoxedIo, Dialer, TcpDialer, TlsDialer, TransportConfig},
    tunnel::Session,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// How often dead links are re-dialed
const REDIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Dualwan Tunnel Client - bonds several uplinks into one tunnel
#[derive(Parser, Debug)]
#[command(name = "dualwan-client")]
#[command(about = "Dualwan Tunnel Client - bonds several uplinks into one tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local HTTP proxy address (overrides config)
    #[arg(long)]
    http: Option<String>,

    /// Local SOCKS5 proxy address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Everything needed to (re)build the session
struct Client {
    dialer: Box<dyn Dialer>,
    config: ClientConfig,
    tunnel: TunnelConfig,
    host: String,
    /// Fixed backend when running as a forwarder
    target: Option<String>,
}

impl Client {
    /// Dial one link and run the upgrade handshake
    async fn dial_link(&self, link: &LinkConfig, session: Option<&str>) -> Result<(BoxedIo, String)> {
        let mut io = self
            .dialer
            .dial(&self.config.server, link.bind.as_deref())
            .await
            .with_context(|| format!("Failed to dial link {}", link.name))?;

        let mut request = UpgradeRequest::new(link.name.clone());
        if let Some(token) = session {
            request = request.with_session(token);
        }
        if let Some(target) = &self.target {
            request = request.with_target(target.clone());
        }

        let token = tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT),
            client_handshake(&mut io, &self.host, &request),
        )
        .await
        .map_err(|_| anyhow!("Handshake on link {} timed out", link.name))??;

        Ok((io, token))
    }

    /// Dial every link; the first one to succeed creates the session
    async fn establish(&self) -> Result<Arc<Session>> {
        let mut session: Option<Arc<Session>> = None;

        for link in &self.config.links {
            let result = match session.clone() {
                Some(existing) => self.join(&existing, link).await,
                None => match self.dial_link(link, None).await {
                    Ok((io, token)) => {
                        let created =
                            Session::initiator(token, self.target.clone(), self.tunnel.clone());
                        created.attach_link(link.name.clone(), io)?;
                        info!(session = %created.token(), link = %link.name, "session established");
                        session = Some(created);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = result {
                warn!(link = %link.name, "Link unavailable: {:#}", e);
            }
        }

        session.ok_or_else(|| anyhow!("No link could reach {}", self.config.server))
    }

    /// Add one more link to an existing session
    async fn join(&self, session: &Arc<Session>, link: &LinkConfig) -> Result<()> {
        let (io, _) = self.dial_link(link, Some(session.token())).await?;
        session.attach_link(link.name.clone(), io)?;
        info!(session = %session.token(), link = %link.name, "link joined");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    let mut client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(http) = args.http {
        client_config.http_listen = Some(http);
        client_config.forward_listen = None;
    }
    if let Some(socks5) = args.socks5 {
        client_config.socks5_listen = Some(socks5);
        client_config.forward_listen = None;
    }
    if client_config.links.is_empty() {
        bail!("No links configured");
    }

    let tcp = TcpDialer::new(TransportConfig {
        connect_timeout: config.tunnel.connect_timeout(),
        nodelay: true,
    });
    let dialer: Box<dyn Dialer> = if client_config.insecure {
        warn!("TLS disabled, links are plaintext");
        Box::new(tcp)
    } else {
        let sni = client_config
            .tls_sni
            .clone()
            .unwrap_or_else(|| client_config.server_host().to_string());
        Box::new(TlsDialer::new(tcp, sni, false).context("Failed to set up TLS")?)
    };

    let target = match (&client_config.forward_listen, &client_config.forward_target) {
        (Some(_), Some(target)) => Some(target.clone()),
        (Some(_), None) => bail!("forward_listen requires forward_target"),
        _ => None,
    };

    let client = Arc::new(Client {
        dialer,
        host: client_config
            .host
            .clone()
            .unwrap_or_else(|| client_config.server_host().to_string()),
        config: client_config.clone(),
        tunnel: config.tunnel.clone(),
        target,
    });

    info!("Dualwan Tunnel Client v{}", dualwan_tunnel::VERSION);
    info!(
        "Bonding {} link(s) to {}",
        client.config.links.len(),
        client.config.server
    );

    let session = client.establish().await?;
    let (sessions_tx, sessions) = watch::channel(session);
    tokio::spawn(supervise(client.clone(), sessions_tx));

    let front_end = async {
        if let Some(listen) = &client_config.forward_listen {
            return run_forward(listen, sessions.clone()).await;
        }
        if client_config.http_listen.is_none() && client_config.socks5_listen.is_none() {
            bail!("None of http_listen, socks5_listen or forward_listen configured");
        }

        let http = async {
            let Some(listen) = &client_config.http_listen else {
                return Ok::<(), anyhow::Error>(());
            };
            let mut proxy = HttpProxyServer::bind(listen).await?;
            if let Some(auth) = &client_config.proxy_auth {
                proxy = proxy.with_auth(auth.clone());
            }
            proxy.run(sessions.clone()).await.map_err(anyhow::Error::from)
        };
        let socks5 = async {
            let Some(listen) = &client_config.socks5_listen else {
                return Ok::<(), anyhow::Error>(());
            };
            let mut proxy = Socks5Server::bind(listen).await?;
            if let Some(auth) = &client_config.proxy_auth {
                proxy = proxy.with_auth(auth);
            }
            proxy.run(sessions.clone()).await.map_err(anyhow::Error::from)
        };

        tokio::try_join!(http, socks5).map(|_| ())
    };

    tokio::select! {
        result = front_end => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    sessions.borrow().close();
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

/// Re-dial missing links; re-create the session once it is gone
async fn supervise(client: Arc<Client>, sessions: watch::Sender<Arc<Session>>) {
    let mut ticker = tokio::time::interval(REDIAL_INTERVAL);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let session = sessions.borrow().clone();

        if session.is_closed() {
            match client.establish().await {
                Ok(fresh) => {
                    info!(session = %fresh.token(), "session re-created");
                    sessions.send_replace(fresh);
                }
                Err(e) => warn!("Reconnect failed: {:#}", e),
            }
            continue;
        }

        let present = session.link_names();
        for link in &client.config.links {
            if present.contains(&link.name) {
                continue;
            }
            if let Err(e) = client.join(&session, link).await {
                warn!(link = %link.name, "Re-dial failed: {:#}", e);
                if matches!(e.downcast_ref::<ProtocolError>(), Some(ProtocolError::UnknownSession(_))) {
                    // The server forgot the session; start over next tick
                    session.close();
                    break;
                }
            }
        }
        debug!(
            session = %session.token(),
            links = session.link_count(),
            healthy = session.healthy_links(),
            streams = session.stream_count(),
            "session status"
        );
        for (id, health, stats) in session.link_stats() {
            debug!(
                link = id,
                ?health,
                sent = stats.bytes_sent,
                received = stats.bytes_received,
                outstanding = stats.outstanding,
                "link status"
            );
        }
    }
}

/// Tunnel every accepted connection to the session's fixed target
async fn run_forward(listen: &str, sessions: watch::Receiver<Arc<Session>>) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .context("Failed to bind forward listener")?;
    info!("Forwarding {} through the tunnel", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let session = sessions.borrow().clone();

        let opened = session
            .open_local()
            .and_then(|id| session.spawn_bridge(id, stream).map(|_| id));
        match opened {
            Ok(id) => debug!(stream = id, %peer, "forwarding connection"),
            Err(e) => warn!(%peer, error = %e, "Cannot open stream"),
        }
    }
}
