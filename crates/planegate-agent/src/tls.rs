//! TLS material for the outbound tunnel
//!
//! The agent presents a client certificate to the gateway when mTLS is
//! enabled and verifies the gateway against a configured CA bundle. Without
//! mTLS the dial is encrypted but unverified.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tracing::{info, warn};

/// Errors building the client TLS configuration
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be opened or decoded
    #[error("failed to read {what} from {path}: {message}")]
    Read {
        /// Which material was being read
        what: &'static str,
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },

    /// A PEM file contained no usable entries
    #[error("no {what} found in {path}")]
    Empty {
        /// Which material was being read
        what: &'static str,
        /// File path
        path: String,
    },

    /// mTLS was enabled without the required material
    #[error("mTLS enabled but {0} is not set")]
    Missing(&'static str),

    /// rustls rejected the assembled configuration
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Paths and switches controlling the agent's TLS dial
#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// Present a client certificate and verify the gateway
    pub enabled: bool,
    /// Client certificate chain (PEM)
    pub client_cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub client_key: Option<PathBuf>,
    /// Gateway CA bundle (PEM)
    pub server_ca: Option<PathBuf>,
    /// Dial without server verification when the CA cannot be used
    pub insecure_skip_ca_fallback: bool,
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read {
            what: "certificate",
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::Empty {
            what: "certificate",
            path: path.display().to_string(),
        });
    }
    Ok(certs)
}

/// Load the first private key in a PEM file (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path, "private key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Read {
            what: "private key",
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::Empty {
            what: "private key",
            path: path.display().to_string(),
        })
}

/// Load a CA bundle into a root store.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| TlsError::Read {
            what: "CA certificate",
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(roots)
}

fn open(path: &Path, what: &'static str) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::Read {
            what,
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

/// Build the rustls client configuration for the tunnel dial.
///
/// With mTLS the client cert and key must load. A CA that is absent or
/// unreadable refuses construction unless `insecure_skip_ca_fallback` is
/// set, in which case the gateway is not verified. TLS 1.2 is the minimum.
pub fn build_client_config(settings: &TlsSettings) -> Result<ClientConfig, TlsError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TlsError::Config(e.to_string()))?;

    if !settings.enabled {
        info!("TLS disabled, connecting without mTLS");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth());
    }

    let cert_path = settings
        .client_cert
        .as_deref()
        .ok_or(TlsError::Missing("client certificate path"))?;
    let key_path = settings
        .client_key
        .as_deref()
        .ok_or(TlsError::Missing("client key path"))?;
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let roots = match settings.server_ca.as_deref() {
        Some(ca_path) => match load_root_store(ca_path) {
            Ok(roots) => {
                info!(path = %ca_path.display(), "server CA certificate loaded");
                Some(roots)
            }
            Err(e) if settings.insecure_skip_ca_fallback => {
                warn!(error = %e, "server CA unusable, connecting without server verification");
                None
            }
            Err(e) => return Err(e),
        },
        None if settings.insecure_skip_ca_fallback => {
            warn!("no server CA configured, connecting without server verification");
            None
        }
        None => return Err(TlsError::Missing("server CA path")),
    };

    let builder = match roots {
        Some(roots) => builder.with_root_certificates(roots),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier)),
    };

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Accepts any server certificate. Only reachable with TLS verification
/// switched off by configuration.
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
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct Material {
        cert: NamedTempFile,
        key: NamedTempFile,
    }

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn self_signed() -> Material {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Material {
            cert: write_temp(&certified.cert.pem()),
            key: write_temp(&certified.key_pair.serialize_pem()),
        }
    }

    fn mtls(material: &Material, ca: Option<PathBuf>, skip: bool) -> TlsSettings {
        TlsSettings {
            enabled: true,
            client_cert: Some(material.cert.path().to_path_buf()),
            client_key: Some(material.key.path().to_path_buf()),
            server_ca: ca,
            insecure_skip_ca_fallback: skip,
        }
    }

    #[test]
    fn test_load_certs_and_key() {
        let material = self_signed();
        assert_eq!(load_certs(material.cert.path()).unwrap().len(), 1);
        assert!(load_private_key(material.key.path()).is_ok());
    }

    #[test]
    fn test_load_certs_rejects_empty_file() {
        let empty = write_temp("");
        let err = load_certs(empty.path()).unwrap_err();
        assert!(matches!(err, TlsError::Empty { .. }));
    }

    #[test]
    fn test_load_key_rejects_cert_only_file() {
        let material = self_signed();
        let err = load_private_key(material.cert.path()).unwrap_err();
        assert!(matches!(err, TlsError::Empty { .. }));
    }

    #[test]
    fn test_disabled_tls_builds_without_material() {
        assert!(build_client_config(&TlsSettings::default()).is_ok());
    }

    #[test]
    fn test_mtls_with_ca() {
        let material = self_signed();
        let ca = material.cert.path().to_path_buf();
        let config = build_client_config(&mtls(&material, Some(ca), false)).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_mtls_missing_client_cert_refused() {
        let settings = TlsSettings {
            enabled: true,
            ..Default::default()
        };
        let err = build_client_config(&settings).unwrap_err();
        assert!(matches!(err, TlsError::Missing(_)));
    }

    #[test]
    fn test_unreadable_ca_refused_by_default() {
        let material = self_signed();
        let settings = mtls(&material, Some(PathBuf::from("/nonexistent/ca.pem")), false);
        let err = build_client_config(&settings).unwrap_err();
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[test]
    fn test_unreadable_ca_allowed_with_explicit_fallback() {
        let material = self_signed();
        let settings = mtls(&material, Some(PathBuf::from("/nonexistent/ca.pem")), true);
        assert!(build_client_config(&settings).is_ok());
    }

    #[test]
    fn test_garbage_ca_refused() {
        let material = self_signed();
        let garbage = write_temp("not a certificate");
        let settings = mtls(&material, Some(garbage.path().to_path_buf()), false);
        assert!(build_client_config(&settings).is_err());
    }

    #[test]
    fn test_missing_ca_refused_without_fallback() {
        let material = self_signed();
        let err = build_client_config(&mtls(&material, None, false)).unwrap_err();
        assert!(matches!(err, TlsError::Missing("server CA path")));
    }
}
