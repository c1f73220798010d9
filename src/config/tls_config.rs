//! TLS configuration for server connections

use std::path::PathBuf;

/// TLS settings applied to every connection the factory opens
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub skip_verify: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Server name for SNI; defaults to the endpoint host
    pub sni: Option<String>,
}

impl TlsConfig {
    pub fn has_client_cert(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }
}
