//! Socket configuration document.
//!
//! The document is a flat JSON object. Every key is optional; a key absent
//! from a document keeps the value the configuration already had, so several
//! documents can be layered on top of each other.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// Certificate and verification material for encrypted sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Passphrase for an encrypted private key.
    pub password: String,
    /// Load the platform trust store.
    pub use_default_verify_paths: bool,
    /// PEM bundle of trust anchors.
    pub verify_file: String,
    /// Directory of PEM trust anchors.
    pub verify_path: String,
    /// PEM certificate chain presented to the peer.
    pub certificate_chain_file: String,
    /// Single PEM certificate presented to the peer.
    pub certificate_file: String,
    /// PEM private key.
    pub private_key_file: String,
    /// PEM RSA private key.
    pub rsa_private_key_file: String,
    /// Temporary key-exchange parameter file.
    pub tmp_dh_file: String,
}

impl TlsSettings {
    /// True if either trust-anchor source is configured.
    pub fn has_trust_anchors(&self) -> bool {
        self.use_default_verify_paths || !self.verify_file.is_empty() || !self.verify_path.is_empty()
    }

    /// Certificate file to present, preferring the full chain.
    pub fn certificate_path(&self) -> Option<&str> {
        non_empty(&self.certificate_chain_file).or_else(|| non_empty(&self.certificate_file))
    }

    /// Private key file, preferring the generic key over the RSA-specific one.
    pub fn private_key_path(&self) -> Option<&str> {
        non_empty(&self.private_key_file).or_else(|| non_empty(&self.rsa_private_key_file))
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

/// Configuration consumed by the socket factory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Wrap sockets in transport security.
    pub encrypted: bool,
    /// Material used when `encrypted` is set.
    #[serde(flatten)]
    pub tls: TlsSettings,
}

/// One parsed document; `None` means "keep the previous value".
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigDocument {
    encrypted: Option<bool>,
    password: Option<String>,
    use_default_verify_paths: Option<bool>,
    verify_file: Option<String>,
    verify_path: Option<String>,
    certificate_chain_file: Option<String>,
    certificate_file: Option<String>,
    private_key_file: Option<String>,
    rsa_private_key_file: Option<String>,
    tmp_dh_file: Option<String>,
}

fn overlay<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl SocketConfig {
    /// Parses a document on top of the default configuration.
    pub fn from_json_str(document: &str) -> NetworkResult<Self> {
        let mut config = Self::default();
        config.merge_json_str(document)?;
        Ok(config)
    }

    /// Applies a JSON document; keys absent from it keep their current value.
    pub fn merge_json_str(&mut self, document: &str) -> NetworkResult<()> {
        let doc: ConfigDocument = serde_json::from_str(document)?;

        overlay(&mut self.encrypted, doc.encrypted);
        let tls = &mut self.tls;
        overlay(&mut tls.password, doc.password);
        overlay(&mut tls.use_default_verify_paths, doc.use_default_verify_paths);
        overlay(&mut tls.verify_file, doc.verify_file);
        overlay(&mut tls.verify_path, doc.verify_path);
        overlay(&mut tls.certificate_chain_file, doc.certificate_chain_file);
        overlay(&mut tls.certificate_file, doc.certificate_file);
        overlay(&mut tls.private_key_file, doc.private_key_file);
        overlay(&mut tls.rsa_private_key_file, doc.rsa_private_key_file);
        overlay(&mut tls.tmp_dh_file, doc.tmp_dh_file);
        Ok(())
    }

    /// Reads and applies a JSON document from `path`.
    pub fn merge_json_file(&mut self, path: impl AsRef<Path>) -> NetworkResult<()> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|e| {
            NetworkError::Io(format!("failed to read {}: {}", path.display(), e))
        })?;
        self.merge_json_str(&document)
    }
}
