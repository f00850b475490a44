//! TLS upgrade for server connections
//!
//! rustls with the ring provider. Trust roots come from, in order: an
//! optional custom CA file, the system store, and the Mozilla bundle when
//! nothing else loaded. The connector is built once per connection object and
//! reused across reconnects so session resumption can kick in.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, warn};

use crate::error::{NatsError, Result};

/// TLS trust settings
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Verify the server certificate chain and hostname
    pub verify_cert: bool,
    /// PEM file with additional CA certificates
    pub ca_cert_path: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify_cert: true,
            ca_cert_path: None,
        }
    }
}

/// Accepts any certificate; only for `verify_cert = false`
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Cached TLS connector
#[derive(Clone)]
pub struct TlsManager {
    connector: TlsConnector,
    sources: Arc<[String]>,
}

impl std::fmt::Debug for TlsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsManager")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl TlsManager {
    /// Load trust roots and build the connector
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let (root_store, sources) = load_roots(config)?;
        let client_config = build_client_config(root_store, config)?;
        debug!("TLS initialized with roots from: {}", sources.join(", "));

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            sources: sources.into(),
        })
    }

    /// Where the trust roots came from, for diagnostics
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Run the client handshake over an established TCP stream
    pub async fn handshake(&self, stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>> {
        let domain = ServerName::try_from(host.to_string()).map_err(|e| NatsError::Tls {
            host: host.to_string(),
            reason: format!("invalid server name: {e}"),
        })?;

        debug!("TLS handshake with {}", host);
        self.connector
            .connect(domain, stream)
            .await
            .map_err(|e| NatsError::Tls {
                host: host.to_string(),
                reason: e.to_string(),
            })
    }
}

fn load_roots(config: &TlsConfig) -> Result<(RootCertStore, Vec<String>)> {
    let mut root_store = RootCertStore::empty();
    let mut sources = Vec::new();

    if let Some(path) = &config.ca_cert_path {
        load_ca_file(&mut root_store, path)?;
        sources.push(format!("custom CA ({path})"));
    }

    let native = rustls_native_certs::load_native_certs();
    let mut system_count = 0;
    for cert in native.certs {
        if root_store.add(cert).is_ok() {
            system_count += 1;
        }
    }
    for error in native.errors {
        warn!("TLS system certificate error: {}", error);
    }
    if system_count > 0 {
        sources.push(format!("{system_count} system certificates"));
    }

    if root_store.is_empty() {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        sources.push("Mozilla CA bundle".to_string());
    }

    Ok((root_store, sources))
}

fn load_ca_file(root_store: &mut RootCertStore, path: &str) -> Result<()> {
    let tls_err = |reason: String| NatsError::Tls {
        host: String::new(),
        reason,
    };

    let data = std::fs::read(path).map_err(|e| tls_err(format!("cannot read {path}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_err(format!("cannot parse {path}: {e}")))?;
    if certs.is_empty() {
        return Err(tls_err(format!("no certificates in {path}")));
    }
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| tls_err(format!("bad certificate in {path}: {e}")))?;
    }
    Ok(())
}

fn build_client_config(root_store: RootCertStore, config: &TlsConfig) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| NatsError::Tls {
        host: String::new(),
        reason: e.to_string(),
    })?;

    let mut client_config = if config.verify_cert {
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        warn!("TLS certificate verification DISABLED, use only for testing");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };

    client_config.resumption = rustls::client::Resumption::default();
    Ok(client_config)
}
