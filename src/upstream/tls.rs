use log::debug;
use pingora::tls::pkey::{PKey, Private};
use pingora::tls::x509::X509;

use crate::config::TlsConfig;
use crate::core::ClusterResult;
use crate::tls_error;

use super::cluster::ClusterInfo;

/// Client side TLS material of a cluster.
///
/// A manager built from a config with `status: false` is valid but
/// disabled; connections to the cluster are then plaintext.
pub struct TlsContextManager {
    enabled: bool,
    ca_certs: Vec<X509>,
    cert_chain: Vec<X509>,
    private_key: Option<PKey<Private>>,
    server_name: String,
    verify_server: bool,
}

impl TlsContextManager {
    pub fn new(config: &TlsConfig, info: &ClusterInfo) -> ClusterResult<Self> {
        let server_name = if config.server_name.is_empty() {
            info.name().to_string()
        } else {
            config.server_name.clone()
        };

        if !config.status {
            debug!("[mtls] cluster {} tls disabled", info.name());
            return Ok(Self {
                enabled: false,
                ca_certs: Vec::new(),
                cert_chain: Vec::new(),
                private_key: None,
                server_name,
                verify_server: false,
            });
        }

        let ca_certs = parse_certs(&config.ca_cert)
            .map_err(|e| tls_error!("cluster {} invalid ca_cert: {}", info.name(), e))?;

        let (cert_chain, private_key) = match (
            config.cert_chain.trim().is_empty(),
            config.private_key.trim().is_empty(),
        ) {
            (true, true) => (Vec::new(), None),
            (false, false) => {
                let chain = parse_certs(&config.cert_chain)
                    .map_err(|e| tls_error!("cluster {} invalid cert_chain: {}", info.name(), e))?;
                let leaf = chain
                    .first()
                    .ok_or_else(|| tls_error!("cluster {} empty cert_chain", info.name()))?;
                let key = PKey::private_key_from_pem(config.private_key.as_bytes())
                    .map_err(|e| tls_error!("cluster {} invalid private_key: {}", info.name(), e))?;
                check_key_matches(leaf, &key)
                    .map_err(|e| tls_error!("cluster {} {}", info.name(), e))?;
                (chain, Some(key))
            }
            _ => {
                return Err(tls_error!(
                    "cluster {} cert_chain and private_key must be configured together",
                    info.name()
                ))
            }
        };

        debug!(
            "[mtls] cluster {} tls enabled, {} ca certs, client cert {}",
            info.name(),
            ca_certs.len(),
            private_key.is_some()
        );

        Ok(Self {
            enabled: true,
            ca_certs,
            cert_chain,
            private_key,
            server_name,
            verify_server: !config.insecure_skip,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Trusted roots; empty means the system store.
    pub fn ca_certs(&self) -> &[X509] {
        &self.ca_certs
    }

    pub fn cert_chain(&self) -> &[X509] {
        &self.cert_chain
    }

    pub fn private_key(&self) -> Option<&PKey<Private>> {
        self.private_key.as_ref()
    }

    /// Whether a client certificate is presented during the handshake.
    pub fn has_client_cert(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn verify_server(&self) -> bool {
        self.verify_server
    }
}

/// Parses a PEM bundle. Empty input is an empty bundle, anything else must
/// hold at least one certificate.
fn parse_certs(pem: &str) -> Result<Vec<X509>, String> {
    if pem.trim().is_empty() {
        return Ok(Vec::new());
    }

    let certs = X509::stack_from_pem(pem.as_bytes()).map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no certificate found in pem".to_string());
    }
    Ok(certs)
}

fn check_key_matches(cert: &X509, key: &PKey<Private>) -> Result<(), String> {
    let public = cert.public_key().map_err(|e| e.to_string())?;
    if public.public_eq(key) {
        Ok(())
    } else {
        Err("private key does not match certificate".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::core::ClusterError;

    const CERT: &str = include_str!("testdata/client.crt");
    const KEY: &str = include_str!("testdata/client.key");
    const OTHER_KEY: &str = include_str!("testdata/other.key");

    fn info() -> ClusterInfo {
        ClusterInfo::new(&ClusterConfig {
            name: "svc-a".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_disabled() {
        let mgr = TlsContextManager::new(&TlsConfig::default(), &info()).unwrap();
        assert!(!mgr.enabled());
        assert!(!mgr.has_client_cert());
        assert_eq!("svc-a", mgr.server_name());
    }

    #[test]
    fn test_mutual_tls() {
        let config = TlsConfig {
            status: true,
            ca_cert: CERT.to_string(),
            cert_chain: CERT.to_string(),
            private_key: KEY.to_string(),
            server_name: "svc-a.mesh.local".to_string(),
            insecure_skip: false,
        };
        let mgr = TlsContextManager::new(&config, &info()).unwrap();
        assert!(mgr.enabled());
        assert!(mgr.has_client_cert());
        assert!(mgr.verify_server());
        assert_eq!(1, mgr.ca_certs().len());
        assert_eq!(1, mgr.cert_chain().len());
        assert_eq!("svc-a.mesh.local", mgr.server_name());
    }

    #[test]
    fn test_invalid_material() {
        let config = TlsConfig {
            status: true,
            cert_chain: "not a pem".to_string(),
            private_key: "not a key".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            TlsContextManager::new(&config, &info()),
            Err(ClusterError::Tls(_))
        ));

        let config = TlsConfig {
            status: true,
            ca_cert: "garbage".to_string(),
            ..Default::default()
        };
        assert!(TlsContextManager::new(&config, &info()).is_err());

        let config = TlsConfig {
            status: true,
            cert_chain: CERT.to_string(),
            ..Default::default()
        };
        assert!(TlsContextManager::new(&config, &info()).is_err());
    }

    #[test]
    fn test_blank_pem() {
        let config = TlsConfig {
            status: true,
            cert_chain: "\n".to_string(),
            private_key: KEY.to_string(),
            ..Default::default()
        };
        assert!(matches!(
            TlsContextManager::new(&config, &info()),
            Err(ClusterError::Tls(_))
        ));

        // blank on both sides means no client certificate
        let config = TlsConfig {
            status: true,
            cert_chain: " \n".to_string(),
            private_key: "\n".to_string(),
            ..Default::default()
        };
        let mgr = TlsContextManager::new(&config, &info()).unwrap();
        assert!(mgr.enabled());
        assert!(!mgr.has_client_cert());
    }

    #[test]
    fn test_key_mismatch() {
        let config = TlsConfig {
            status: true,
            cert_chain: CERT.to_string(),
            private_key: OTHER_KEY.to_string(),
            ..Default::default()
        };
        assert!(TlsContextManager::new(&config, &info()).is_err());
    }
}
