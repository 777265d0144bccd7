//! Turning configured PEM files into a `rustls` server configuration.

use std::sync::Arc;

use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::{Result, SettingsError};
use crate::types::TlsFiles;

impl TlsFiles {
    /// Load the certificate chain and key into a server config with no
    /// client authentication.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.server_config_with_alpn(Vec::new())
    }

    /// Same as [`TlsFiles::server_config`], advertising the given ALPN
    /// protocols (e.g. `h2` for gRPC).
    pub fn server_config_with_alpn(&self, alpn: Vec<Vec<u8>>) -> Result<Arc<ServerConfig>> {
        let certs = CertificateDer::pem_file_iter(&self.cert_path)
            .map_err(|e| SettingsError::Tls(format!("{}: {e}", self.cert_path.display())))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SettingsError::Tls(format!("{}: {e}", self.cert_path.display())))?;
        if certs.is_empty() {
            return Err(SettingsError::Tls(format!(
                "{}: no certificates found",
                self.cert_path.display()
            )));
        }

        let key = PrivateKeyDer::from_pem_file(&self.key_path)
            .map_err(|e| SettingsError::Tls(format!("{}: {e}", self.key_path.display())))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| SettingsError::Tls(e.to_string()))?;
        config.alpn_protocols = alpn;
        Ok(Arc::new(config))
    }
}
