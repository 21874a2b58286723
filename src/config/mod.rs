//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel protocol tuning
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the tunnel cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.tunnel.validate()?;
        if let Some(client) = &self.client {
            if client.links.iter().any(|l| l.name.is_empty()) {
                return Err(crate::Error::Config("link names must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Override server settings from the process environment
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| var(key).filter(|v| !v.is_empty());
        let keys = ["TLS_CERT", "TLS_KEY", "LISTEN_ADDR", "METRICS_ADDR", "INSECURE"];
        if keys.iter().all(|k| set(k).is_none()) {
            return;
        }

        let server = self.server.get_or_insert_with(ServerConfig::default);
        if let Some(cert) = set("TLS_CERT") {
            server.tls_cert = Some(cert);
        }
        if let Some(key) = set("TLS_KEY") {
            server.tls_key = Some(key);
        }
        if let Some(listen) = set("LISTEN_ADDR") {
            server.listen = listen;
        }
        if let Some(health) = set("METRICS_ADDR") {
            server.health_listen = Some(health);
        }
        if set("INSECURE").is_some() {
            server.insecure = true;
        }
    }
}

/// Tunnel protocol tuning, shared by both ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Largest accepted frame payload
    pub max_payload_size: usize,
    /// Reorder bytes per stream before the backend read side is paused
    pub stream_buffer_budget: usize,
    pub gap_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub idle_timeout_secs: u64,
    /// Backend read size
    pub chunk_size: usize,
    pub open_timeout_secs: u64,
    pub send_retry_timeout_secs: u64,
    /// Backend dial timeout
    pub connect_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_payload_size: crate::tunnel::DEFAULT_MAX_PAYLOAD,
            stream_buffer_budget: crate::tunnel::DEFAULT_STREAM_BUDGET,
            gap_timeout_secs: 30,
            keepalive_interval_secs: 15,
            idle_timeout_secs: 300,
            chunk_size: 16 * 1024,
            open_timeout_secs: 10,
            send_retry_timeout_secs: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl TunnelConfig {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_secs(self.gap_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn send_retry_timeout(&self) -> Duration {
        Duration::from_secs(self.send_retry_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        let nonzero = [
            ("max_payload_size", self.max_payload_size as u64),
            ("stream_buffer_budget", self.stream_buffer_budget as u64),
            ("chunk_size", self.chunk_size as u64),
            ("gap_timeout_secs", self.gap_timeout_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("open_timeout_secs", self.open_timeout_secs),
            ("send_retry_timeout_secs", self.send_retry_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(crate::Error::Config(format!("tunnel.{} must be greater than 0", name)));
            }
        }
        if self.max_payload_size > u32::MAX as usize {
            return Err(crate::Error::Config(
                "tunnel.max_payload_size does not fit the frame length field".into(),
            ));
        }
        Ok(())
    }

    /// Chunk size never exceeds the payload limit
    pub fn read_chunk(&self) -> usize {
        self.chunk_size.clamp(1, self.max_payload_size.max(1))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// TLS certificate path
    pub tls_cert: Option<String>,
    /// TLS key path
    pub tls_key: Option<String>,
    /// Serve plaintext links
    pub insecure: bool,
    /// Health endpoint address
    pub health_listen: Option<String>,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            tls_cert: None,
            tls_key: None,
            insecure: false,
            health_listen: None,
            max_connections: 1000,
        }
    }
}

/// One physical uplink of the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkConfig {
    /// Name sent in the upgrade request (e.g. "main", "helper")
    pub name: String,
    /// Local address to bind before dialing, pinning the link to one WAN
    #[serde(default)]
    pub bind: Option<String>,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Host header value; defaults to the server host
    pub host: Option<String>,
    /// TLS SNI; defaults to the server host
    pub tls_sni: Option<String>,
    /// Dial links without TLS
    pub insecure: bool,
    /// Uplinks to bond
    pub links: Vec<LinkConfig>,
    /// Local HTTP CONNECT proxy address
    pub http_listen: Option<String>,
    /// Local SOCKS5 proxy address
    pub socks5_listen: Option<String>,
    /// Local forward listener; every connection is tunneled to `forward_target`
    pub forward_listen: Option<String>,
    pub forward_target: Option<String>,
    /// Required `user:password` for the local proxies
    pub proxy_auth: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            host: None,
            tls_sni: None,
            insecure: false,
            links: vec![
                LinkConfig {
                    name: "main".to_string(),
                    bind: None,
                },
                LinkConfig {
                    name: "helper".to_string(),
                    bind: None,
                },
            ],
            http_listen: Some("127.0.0.1:8080".to_string()),
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            forward_listen: None,
            forward_target: None,
            proxy_auth: None,
        }
    }
}

impl ClientConfig {
    /// Server host without the port
    pub fn server_host(&self) -> &str {
        match self.server.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                host.trim_start_matches('[').trim_end_matches(']')
            }
            _ => &self.server,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        tunnel: TunnelConfig::default(),
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let tunnel = TunnelConfig::default();
        assert_eq!(tunnel.max_payload_size, 65536);
        assert_eq!(tunnel.gap_timeout(), Duration::from_secs(30));
        assert_eq!(tunnel.keepalive_interval(), Duration::from_secs(15));
        assert_eq!(tunnel.read_chunk(), 16 * 1024);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse(
            r#"
            [tunnel]
            gap_timeout_secs = 5

            [client]
            server = "tunnel.example.com:443"
            links = [{ name = "main", bind = "192.168.1.10" }, { name = "helper" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.gap_timeout_secs, 5);
        assert_eq!(config.tunnel.idle_timeout_secs, 300);
        let client = config.client.unwrap();
        assert_eq!(client.links.len(), 2);
        assert_eq!(client.links[0].bind.as_deref(), Some("192.168.1.10"));
        assert_eq!(client.links[1].bind, None);
        assert_eq!(client.server_host(), "tunnel.example.com");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for field in ["keepalive_interval_secs", "gap_timeout_secs", "open_timeout_secs"] {
            let text = format!("[tunnel]\n{} = 0\n", field);
            match Config::parse(&text) {
                Err(crate::Error::Config(msg)) => assert!(msg.contains(field), "{}", msg),
                other => panic!("{} = 0 gave {:?}", field, other.map(|_| ())),
            }
        }

        let mut tunnel = TunnelConfig::default();
        assert!(tunnel.validate().is_ok());
        tunnel.chunk_size = 0;
        assert!(tunnel.validate().is_err());
    }

    #[test]
    fn test_load_validates() {
        let path = std::env::temp_dir().join(format!("dwnb-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[tunnel]\nkeepalive_interval_secs = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(crate::Error::Config(_))));

        generate_example_config().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(
            loaded.client.unwrap().socks5_listen.as_deref(),
            Some("127.0.0.1:1080")
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_example_round_trip() {
        let example = generate_example_config();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.client.unwrap().links, example.client.unwrap().links);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TLS_CERT", "/etc/cert.pem"),
            ("LISTEN_ADDR", "0.0.0.0:8443"),
            ("METRICS_ADDR", "127.0.0.1:9090"),
            ("INSECURE", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_vars(|k| vars.get(k).map(|v| v.to_string()));

        let server = config.server.unwrap();
        assert_eq!(server.tls_cert.as_deref(), Some("/etc/cert.pem"));
        assert_eq!(server.tls_key, None);
        assert_eq!(server.listen, "0.0.0.0:8443");
        assert_eq!(server.health_listen.as_deref(), Some("127.0.0.1:9090"));
        assert!(server.insecure);
    }

    #[test]
    fn test_env_untouched_without_vars() {
        let mut config = Config::default();
        config.apply_vars(|_| None);
        assert!(config.server.is_none());
    }
}
