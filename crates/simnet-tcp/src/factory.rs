//! Configuration-driven socket construction.

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;

use simnet_core::{NetworkResult, SocketConfig};

use crate::socket::{PlainSocket, Socket};

/// Builds plain or encrypted sockets from a [`SocketConfig`].
#[derive(Debug, Clone, Default)]
pub struct SocketFactory {
    config: SocketConfig,
    handshake_server: bool,
}

impl SocketFactory {
    /// Factory producing plain sockets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory using `config`.
    pub fn with_config(config: SocketConfig) -> Self {
        Self {
            config,
            handshake_server: false,
        }
    }

    /// Applies a JSON configuration document; absent keys keep their values.
    pub fn parse_json_config(&mut self, document: &str) -> NetworkResult<()> {
        self.config.merge_json_str(document)
    }

    /// Reads and applies a JSON configuration file.
    pub fn load_json_config_file(&mut self, path: impl AsRef<Path>) -> NetworkResult<()> {
        self.config.merge_json_file(path)
    }

    /// Current configuration.
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Turns encryption on or off.
    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.config.encrypted = encrypted;
    }

    /// True if created sockets carry transport security.
    pub fn is_encrypted(&self) -> bool {
        self.config.encrypted
    }

    /// Makes created sockets answer the handshake instead of initiating it.
    pub fn set_handshake_server(&mut self, server: bool) {
        self.handshake_server = server;
    }

    /// Creates an unconnected socket driven by `handle`.
    ///
    /// Encrypted sockets get a security context built from the configured
    /// material; building it fails if the material is unusable or the crate
    /// was compiled without the `encryption` feature.
    pub fn create_socket(&self, handle: &Handle) -> NetworkResult<Arc<dyn Socket>> {
        let socket: Arc<dyn Socket> = if self.config.encrypted {
            self.create_encrypted(handle)?
        } else {
            Arc::new(PlainSocket::plain(handle.clone()))
        };
        if self.handshake_server {
            socket.set_handshake_mode_server(true)?;
        }
        Ok(socket)
    }

    #[cfg(feature = "encryption")]
    fn create_encrypted(&self, handle: &Handle) -> NetworkResult<Arc<dyn Socket>> {
        use crate::socket::{TlsContext, TlsLayer, TlsSocket};

        let context = TlsContext::from_settings(&self.config.tls)?;
        debug!("Built TLS context {:?}", context);
        Ok(Arc::new(TlsSocket::new(
            handle.clone(),
            TlsLayer::new(Arc::new(context)),
        )))
    }

    #[cfg(not(feature = "encryption"))]
    fn create_encrypted(&self, _handle: &Handle) -> NetworkResult<Arc<dyn Socket>> {
        debug!("Encrypted socket requested without encryption support");
        Err(simnet_core::NetworkError::EncryptionUnavailable)
    }
}
