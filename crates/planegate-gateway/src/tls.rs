//! Server TLS for the agent listener

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use axum::middleware::AddExtension;
use axum::Extension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::{debug, info};

use crate::config::ServerTls;
use crate::plane_ca::PeerCertificates;

/// Errors building the server TLS configuration
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read or held nothing usable
    #[error("failed to load {what} from {path}: {message}")]
    Load {
        /// Which material was being read
        what: &'static str,
        /// File path
        path: String,
        /// What went wrong
        message: String,
    },

    /// rustls rejected the assembled configuration
    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl TlsError {
    fn load(what: &'static str, path: &Path, message: impl ToString) -> Self {
        Self::Load {
            what,
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}

fn open(path: &Path, what: &'static str) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::load(what, path, e))
}

fn load_certs(path: &Path, what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path, what)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::load(what, path, e))?;
    if certs.is_empty() {
        return Err(TlsError::load(what, path, "no PEM certificates found"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path, "private key")?)
        .map_err(|e| TlsError::load("private key", path, e))?
        .ok_or_else(|| TlsError::load("private key", path, "no PEM private key found"))
}

fn load_client_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path, "client CA")? {
        roots
            .add(cert)
            .map_err(|e| TlsError::load("client CA", path, e))?;
    }
    Ok(roots)
}

/// Build the rustls server configuration.
///
/// With a client CA every agent must present a certificate chaining to it.
/// With only a plane CA file, certificates are requested but their chains are
/// checked per plane after the handshake. ALPN is pinned to HTTP/1.1 because
/// the WebSocket upgrade needs it.
pub fn build_server_config(tls: &ServerTls) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let certs = load_certs(&tls.cert, "server certificate")?;
    let key = load_private_key(&tls.key)?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let builder = match &tls.client_ca {
        Some(ca) => {
            let roots = load_client_roots(ca)?;
            let verifier = client_verifier(roots, provider)?;
            info!(path = %ca.display(), "requiring agent client certificates");
            builder.with_client_cert_verifier(verifier)
        }
        None if tls.plane_ca.is_some() => {
            info!("requesting agent client certificates for per-plane verification");
            builder.with_client_cert_verifier(Arc::new(DeferredClientCertVerifier::new(provider)))
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn client_verifier(
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, TlsError> {
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| TlsError::Config(e.to_string()))
}

/// Requests a client certificate and checks the handshake signature, leaving
/// the chain to the per-plane check on the upgrade request.
///
/// Clients without a certificate still connect; the plane API and proxy do
/// not require one.
#[derive(Debug)]
pub struct DeferredClientCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl DeferredClientCertVerifier {
    /// Verifier using `provider`'s signature algorithms
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ClientCertVerifier for DeferredClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        debug!("client certificate deferred to plane verification");
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }
}

/// TLS acceptor that hands the client's certificate chain to handlers as a
/// [`PeerCertificates`] request extension
#[derive(Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    /// Accept TLS with `config`
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let chain = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(<[CertificateDer<'static>]>::to_vec)
                .unwrap_or_default();
            let service = Extension(PeerCertificates::new(chain)).layer(service);
            Ok((stream, service))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn material() -> (NamedTempFile, NamedTempFile) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (
            write_temp(&certified.cert.pem()),
            write_temp(&certified.key_pair.serialize_pem()),
        )
    }

    fn server_tls(cert: &NamedTempFile, key: &NamedTempFile, ca: Option<PathBuf>) -> ServerTls {
        ServerTls {
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
            client_ca: ca,
            plane_ca: None,
        }
    }

    #[test]
    fn test_server_config_without_client_auth() {
        let (cert, key) = material();
        let config = build_server_config(&server_tls(&cert, &key, None)).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_server_config_with_client_ca() {
        let (cert, key) = material();
        let ca = cert.path().to_path_buf();
        assert!(build_server_config(&server_tls(&cert, &key, Some(ca))).is_ok());
    }

    #[test]
    fn test_missing_cert_file() {
        let (_, key) = material();
        let tls = ServerTls {
            cert: PathBuf::from("/nonexistent/tls.crt"),
            key: key.path().to_path_buf(),
            client_ca: None,
            plane_ca: None,
        };
        let err = build_server_config(&tls).unwrap_err();
        assert!(err.to_string().contains("server certificate"));
    }

    #[test]
    fn test_key_file_without_key() {
        let (cert, _) = material();
        let tls = ServerTls {
            cert: cert.path().to_path_buf(),
            key: cert.path().to_path_buf(),
            client_ca: None,
            plane_ca: None,
        };
        let err = build_server_config(&tls).unwrap_err();
        assert!(matches!(err, TlsError::Load { what: "private key", .. }));
    }

    #[test]
    fn test_empty_client_ca_refused() {
        let (cert, key) = material();
        let empty = write_temp("");
        let err = build_server_config(&server_tls(&cert, &key, Some(empty.path().to_path_buf())))
            .unwrap_err();
        assert!(matches!(err, TlsError::Load { what: "client CA", .. }));
    }

    #[test]
    fn test_plane_ca_requests_optional_client_certs() {
        let (cert, key) = material();
        let mut tls = server_tls(&cert, &key, None);
        tls.plane_ca = Some(PathBuf::from("/etc/planegate/planes.yaml"));
        assert!(build_server_config(&tls).is_ok());

        let verifier =
            DeferredClientCertVerifier::new(Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
        assert!(verifier.root_hint_subjects().is_empty());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
