//! rustls-backed encrypted sockets.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use simnet_core::{HandshakeRole, NetworkError, NetworkResult, TlsSettings};

use super::stream::{BoxedReader, BoxedWriter, SecurityLayer, StreamSocket};

/// Encrypted TCP socket.
pub type TlsSocket = StreamSocket<TlsLayer>;

/// Client and server configurations built from one set of TLS settings.
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

fn tls_error(context: &str, err: impl fmt::Display) -> NetworkError {
    NetworkError::Tls(format!("{context}: {err}"))
}

fn load_certificates(path: &str) -> NetworkResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_error(&format!("failed to open certificate file {path}"), e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(&format!("failed to parse certificate file {path}"), e))?;
    if certs.is_empty() {
        return Err(NetworkError::Tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> NetworkResult<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path)
        .map_err(|e| tls_error(&format!("failed to load private key {path}"), e))
}

fn load_trust_anchors(settings: &TlsSettings) -> NetworkResult<RootCertStore> {
    let mut roots = RootCertStore::empty();

    if settings.use_default_verify_paths {
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!("Failed to load a platform certificate: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!("Loaded {} platform trust anchors ({} ignored)", added, ignored);
    }

    if !settings.verify_file.is_empty() {
        for cert in load_certificates(&settings.verify_file)? {
            roots
                .add(cert)
                .map_err(|e| tls_error("invalid trust anchor", e))?;
        }
    }

    if !settings.verify_path.is_empty() {
        let dir = std::fs::read_dir(&settings.verify_path).map_err(|e| {
            tls_error(&format!("failed to read verify path {}", settings.verify_path), e)
        })?;
        for entry in dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match CertificateDer::pem_file_iter(&path) {
                Ok(certs) => {
                    let (added, _) = roots.add_parsable_certificates(certs.flatten());
                    debug!("Loaded {} trust anchors from {}", added, path.display());
                }
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
    }

    Ok(roots)
}

impl TlsContext {
    /// Builds the contexts the settings allow.
    ///
    /// A server context needs a certificate and key; a client context needs
    /// trust anchors. Settings with neither are rejected.
    pub fn from_settings(settings: &TlsSettings) -> NetworkResult<Self> {
        if !settings.password.is_empty() {
            warn!("Encrypted private keys are not supported; the key password is ignored");
        }
        if !settings.tmp_dh_file.is_empty() {
            warn!("Diffie-Hellman parameter files are not used; {} ignored", settings.tmp_dh_file);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = load_trust_anchors(settings)?;

        let identity = match (settings.certificate_path(), settings.private_key_path()) {
            (Some(cert), Some(key)) => Some((load_certificates(cert)?, load_private_key(key)?)),
            (Some(_), None) | (None, Some(_)) => {
                return Err(NetworkError::Configuration(
                    "a certificate and a private key must be configured together".to_string(),
                ));
            }
            (None, None) => None,
        };

        let server = match &identity {
            Some((chain, key)) => Some(Arc::new(build_server_config(
                &provider,
                &roots,
                chain.clone(),
                key.clone_key(),
            )?)),
            None => None,
        };

        let client = if roots.is_empty() {
            None
        } else {
            Some(Arc::new(build_client_config(&provider, roots, identity)?))
        };

        if server.is_none() && client.is_none() {
            return Err(NetworkError::Configuration(
                "encryption requires a certificate and key or trust anchors".to_string(),
            ));
        }
        Ok(Self { server, client })
    }

    /// Builds a context from a certificate, its key and an optional trust-anchor bundle.
    pub fn from_files(
        certificate: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
        trust_anchors: Option<&Path>,
    ) -> NetworkResult<Self> {
        let settings = TlsSettings {
            certificate_file: certificate.as_ref().display().to_string(),
            private_key_file: private_key.as_ref().display().to_string(),
            verify_file: trust_anchors
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            ..TlsSettings::default()
        };
        Self::from_settings(&settings)
    }

    /// True if this context can answer handshakes.
    pub fn supports_server(&self) -> bool {
        self.server.is_some()
    }

    /// True if this context can initiate handshakes.
    pub fn supports_client(&self) -> bool {
        self.client.is_some()
    }
}

fn build_server_config(
    provider: &Arc<CryptoProvider>,
    roots: &RootCertStore,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> NetworkResult<ServerConfig> {
    let builder = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("unsupported protocol versions", e))?;

    let builder = if roots.is_empty() {
        builder.with_no_client_auth()
    } else {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots.clone()), Arc::clone(provider))
                .allow_unauthenticated()
                .build()
                .map_err(|e| tls_error("failed to build client verifier", e))?;
        builder.with_client_cert_verifier(verifier)
    };

    builder
        .with_single_cert(chain, key)
        .map_err(|e| tls_error("invalid server certificate", e))
}

fn build_client_config(
    provider: &Arc<CryptoProvider>,
    roots: RootCertStore,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> NetworkResult<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("unsupported protocol versions", e))?
        .with_root_certificates(roots);

    match identity {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| tls_error("invalid client certificate", e)),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Security layer performing a TLS handshake over the TCP stream.
#[derive(Debug, Clone)]
pub struct TlsLayer {
    context: Arc<TlsContext>,
}

impl TlsLayer {
    /// Layer using `context` for both handshake roles.
    pub fn new(context: Arc<TlsContext>) -> Self {
        Self { context }
    }
}

fn config_missing(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("no {what} configured for this handshake role"),
    )
}

#[async_trait]
impl SecurityLayer for TlsLayer {
    fn requires_handshake(&self) -> bool {
        true
    }

    async fn secure(
        &self,
        stream: TcpStream,
        role: HandshakeRole,
        server_name: Option<String>,
    ) -> io::Result<(BoxedReader, BoxedWriter)> {
        match role {
            HandshakeRole::Server => {
                let config = self
                    .context
                    .server
                    .clone()
                    .ok_or_else(|| config_missing("certificate"))?;
                let tls = TlsAcceptor::from(config).accept(stream).await?;
                let (reader, writer) = tokio::io::split(tls);
                Ok((Box::new(reader), Box::new(writer)))
            }
            HandshakeRole::Client => {
                let config = self
                    .context
                    .client
                    .clone()
                    .ok_or_else(|| config_missing("trust anchors"))?;
                let name = server_name.unwrap_or_else(|| "localhost".to_string());
                let name = ServerName::try_from(name)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let tls = TlsConnector::from(config).connect(name, stream).await?;
                let (reader, writer) = tokio::io::split(tls);
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}
