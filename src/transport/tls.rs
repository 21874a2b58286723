//! TLS links
//!
//! Client side wraps a [`TcpDialer`] connection in TLS, verifying against
//! the webpki roots unless configured as insecure. Server side loads a PEM
//! certificate chain and key into an acceptor.

use super::{BoxedIo, Dialer, TcpDialer, TransportError};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring as ring_provider;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

/// TLS dialer for links
pub struct TlsDialer {
    tcp: TcpDialer,
    tls_config: Arc<ClientConfig>,
    sni: String,
}

impl TlsDialer {
    /// Create a dialer presenting `sni`; `insecure` skips certificate checks
    pub fn new(tcp: TcpDialer, sni: impl Into<String>, insecure: bool) -> Result<Self, TransportError> {
        let provider = Arc::new(ring_provider::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let tls_config = if insecure {
            warn!("TLS certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
                .with_no_client_auth()
        } else {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        Ok(Self {
            tcp,
            tls_config: Arc::new(tls_config),
            sni: sni.into(),
        })
    }

    /// Get the SNI being used
    pub fn sni(&self) -> &str {
        &self.sni
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &str, bind: Option<&str>) -> Result<BoxedIo, TransportError> {
        let tcp_stream = self.tcp.connect(addr, bind).await?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let server_name = ServerName::try_from(self.sni.clone())
            .map_err(|e| TransportError::Tls(format!("Invalid SNI: {}", e)))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Box::new(tls_stream))
    }
}

/// Certificate verifier that accepts anything, for self-signed test servers
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build a server acceptor from PEM certificate and key files
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        ring_provider::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TransportError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| TransportError::Tls(format!("Failed to build TLS server config: {}", e)))?;

    info!("TLS enabled with cert: {}", cert_path);
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Load TLS certificate chain from PEM file
fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let path = path.as_ref();
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, TransportError> {
    let path = path.as_ref();
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)?.ok_or_else(|| {
        TransportError::Tls(format!("No private key found in {}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dialers() {
        let secure = TlsDialer::new(TcpDialer::default(), "tunnel.example.com", false).unwrap();
        assert_eq!(secure.sni(), "tunnel.example.com");

        let insecure = TlsDialer::new(TcpDialer::default(), "127.0.0.1", true).unwrap();
        assert_eq!(insecure.sni(), "127.0.0.1");
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn test_empty_pem_rejected() {
        let dir = std::env::temp_dir().join(format!("dwnb-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, "").unwrap();

        let err = load_certs(&cert).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
        std::fs::remove_dir_all(&dir).ok();
    }
}
