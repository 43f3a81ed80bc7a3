//! Per-plane client certificate authorization
//!
//! Several plane resources (namespaced or cluster-scoped) may share one
//! `planeType/planeID`, each trusting its own client CA. An agent is
//! authorized for every resource whose CA its certificate chains to, and is
//! refused when it chains to none of them.
//!
//! CAs are listed in a YAML file re-read on every connection, so a rotated
//! CA takes effect for the next agent that dials in:
//!
//! ```yaml
//! planes:
//!   - planeType: dataplane
//!     planeID: prod
//!     namespace: org-a
//!     name: prod-dp
//!     clientCAFile: /etc/planegate/cas/org-a-prod.pem
//!   - planeType: dataplane
//!     planeID: prod
//!     name: shared-dp        # cluster-scoped, no namespace
//!     clientCA: |
//!       -----BEGIN CERTIFICATE-----
//!       ...
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use planegate_common::yaml::parse_yaml;
use planegate_common::PlaneIdentity;

/// Why an agent was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaneAuthError {
    /// The TLS session carried no client certificate
    #[error("no client certificate presented")]
    NoClientCertificate,

    /// No resource of the plane configures a client CA
    #[error("no client CA configured for plane {0}")]
    NoPlaneCa(String),

    /// The CA configuration could not be read
    #[error("failed to get client CA configuration: {0}")]
    Source(String),

    /// The certificate chains to none of the plane's CAs
    #[error("certificate verification failed: {0}")]
    Rejected(String),
}

/// Client certificate chain of a TLS session, leaf first
#[derive(Clone, Debug, Default)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

impl PeerCertificates {
    /// Wrap a chain taken from the handshake
    pub fn new(chain: Vec<CertificateDer<'static>>) -> Self {
        Self(Arc::new(chain))
    }

    /// True if the client sent no certificate
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `namespace/name` of a plane resource; cluster-scoped resources have an
/// empty namespace
pub fn resource_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Source of the client CAs trusted for a plane
#[cfg_attr(test, mockall::automock)]
pub trait PlaneCaSource: Send + Sync {
    /// CA bundles (PEM) of every resource serving `plane`, keyed by resource key
    fn client_cas(&self, plane: &PlaneIdentity) -> Result<BTreeMap<String, Vec<u8>>, PlaneAuthError>;
}

#[derive(Debug, Default, Deserialize)]
struct PlaneCaFile {
    #[serde(default)]
    planes: Vec<PlaneCaEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaneCaEntry {
    plane_type: String,
    #[serde(rename = "planeID")]
    plane_id: String,
    #[serde(default)]
    namespace: String,
    name: String,
    #[serde(rename = "clientCA", default)]
    client_ca: Option<String>,
    #[serde(rename = "clientCAFile", default)]
    client_ca_file: Option<PathBuf>,
}

/// Plane CAs listed in a YAML file
#[derive(Clone, Debug)]
pub struct FilePlaneCaSource {
    path: PathBuf,
}

impl FilePlaneCaSource {
    /// Read CAs from `path` on every lookup
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<PlaneCaFile, PlaneAuthError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| PlaneAuthError::Source(format!("{}: {}", self.path.display(), e)))?;
        if text.trim().is_empty() {
            return Ok(PlaneCaFile::default());
        }
        let value = parse_yaml(&text).map_err(|e| PlaneAuthError::Source(e.to_string()))?;
        serde_json::from_value(value)
            .map_err(|e| PlaneAuthError::Source(format!("{}: {}", self.path.display(), e)))
    }
}

fn entry_ca(entry: &PlaneCaEntry, base: &Path) -> Result<Vec<u8>, String> {
    match (&entry.client_ca, &entry.client_ca_file) {
        (Some(pem), _) if !pem.trim().is_empty() => Ok(pem.as_bytes().to_vec()),
        (_, Some(file)) => {
            let path = if file.is_relative() { base.join(file) } else { file.clone() };
            let data = std::fs::read(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
            if data.is_empty() {
                return Err(format!("CA data is empty in {}", path.display()));
            }
            Ok(data)
        }
        _ => Err("no valid CA data found: set clientCA or clientCAFile".to_string()),
    }
}

impl PlaneCaSource for FilePlaneCaSource {
    fn client_cas(&self, plane: &PlaneIdentity) -> Result<BTreeMap<String, Vec<u8>>, PlaneAuthError> {
        let base = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut cas = BTreeMap::new();
        for entry in self.load()?.planes {
            if entry.plane_type != plane.plane_type.as_str() || entry.plane_id != plane.plane_id {
                continue;
            }
            let key = resource_key(&entry.namespace, &entry.name);
            match entry_ca(&entry, base) {
                Ok(ca) => {
                    cas.insert(key, ca);
                }
                Err(e) => warn!(plane = %plane.identifier(), resource = %key, error = %e, "failed to read plane client CA"),
            }
        }
        debug!(plane = %plane.identifier(), resources = cas.len(), "loaded plane client CAs");
        Ok(cas)
    }
}

/// Checks agent certificates against the CAs of their plane's resources
#[derive(Clone)]
pub struct PlaneAuthorizer {
    source: Arc<dyn PlaneCaSource>,
    provider: Arc<CryptoProvider>,
}

impl PlaneAuthorizer {
    /// Authorizer backed by `source`
    pub fn new(source: Arc<dyn PlaneCaSource>) -> Self {
        Self {
            source,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    /// Resource keys the presented chain is authorized for, sorted.
    ///
    /// Fails unless at least one resource's CA accepts the chain.
    pub fn authorize(
        &self,
        plane: &PlaneIdentity,
        peer: &PeerCertificates,
    ) -> Result<Vec<String>, PlaneAuthError> {
        if peer.is_empty() {
            return Err(PlaneAuthError::NoClientCertificate);
        }
        let cas = self.source.client_cas(plane)?;
        if cas.is_empty() {
            return Err(PlaneAuthError::NoPlaneCa(plane.identifier()));
        }

        let mut authorized = Vec::new();
        let mut last_error = String::new();
        for (resource, ca) in &cas {
            match verify_chain(ca, &peer.0, &self.provider) {
                Ok(()) => {
                    debug!(plane = %plane.identifier(), resource = %resource, "client certificate accepted");
                    authorized.push(resource.clone());
                }
                Err(e) => {
                    debug!(plane = %plane.identifier(), resource = %resource, error = %e, "client certificate not valid for resource");
                    last_error = e;
                }
            }
        }

        if authorized.is_empty() {
            warn!(
                plane = %plane.identifier(),
                resources = cas.len(),
                error = %last_error,
                "client certificate rejected by every plane CA"
            );
            return Err(PlaneAuthError::Rejected(last_error));
        }
        info!(
            plane = %plane.identifier(),
            authorized = ?authorized,
            resources = cas.len(),
            "client certificate verified"
        );
        Ok(authorized)
    }
}

fn verify_chain(
    ca_pem: &[u8],
    chain: &[CertificateDer<'static>],
    provider: &Arc<CryptoProvider>,
) -> Result<(), String> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.map_err(|e| format!("invalid CA PEM: {}", e))?;
        roots
            .add(cert)
            .map_err(|e| format!("invalid CA certificate: {}", e))?;
    }
    if roots.is_empty() {
        return Err("no certificates found in CA PEM data".to_string());
    }

    let (leaf, intermediates) = chain
        .split_first()
        .ok_or_else(|| "no client certificate presented".to_string())?;
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| e.to_string())?;
    verifier
        .verify_client_cert(leaf, intermediates, UnixTime::now())
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
pub(crate) mod test_certs {
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use rustls::pki_types::CertificateDer;

    /// A CA able to sign agent certificates
    pub struct TestCa {
        pub cert: rcgen::Certificate,
        pub key: KeyPair,
    }

    impl TestCa {
        pub fn new(name: &str) -> Self {
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.distinguished_name.push(DnType::CommonName, name);
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::CrlSign,
            ];
            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            Self { cert, key }
        }

        pub fn pem(&self) -> String {
            self.cert.pem()
        }

        /// Client certificate for `common_name`, signed by this CA
        pub fn issue(&self, common_name: &str) -> CertificateDer<'static> {
            let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
            params.distinguished_name.push(DnType::CommonName, common_name);
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
            let key = KeyPair::generate().unwrap();
            params
                .signed_by(&key, &self.cert, &self.key)
                .unwrap()
                .der()
                .clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_certs::TestCa;
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn plane() -> PlaneIdentity {
        PlaneIdentity::new("dataplane", "prod").unwrap()
    }

    fn peer(cert: CertificateDer<'static>) -> PeerCertificates {
        PeerCertificates::new(vec![cert])
    }

    fn authorizer(cas: Vec<(&str, String)>) -> PlaneAuthorizer {
        let cas: BTreeMap<String, Vec<u8>> = cas
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.into_bytes()))
            .collect();
        let mut source = MockPlaneCaSource::new();
        source.expect_client_cas().returning(move |_| Ok(cas.clone()));
        PlaneAuthorizer::new(Arc::new(source))
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    #[test]
    fn test_certificate_from_plane_ca_is_authorized() {
        let ca = TestCa::new("org-a");
        let authorizer = authorizer(vec![("org-a/prod-dp", ca.pem())]);

        let crs = authorizer.authorize(&plane(), &peer(ca.issue("prod"))).unwrap();
        assert_eq!(crs, vec!["org-a/prod-dp".to_string()]);
    }

    #[test]
    fn test_certificate_from_other_ca_is_rejected() {
        let plane_ca = TestCa::new("org-a");
        let shared_ca = TestCa::new("shared");
        let authorizer = authorizer(vec![("org-a/prod-dp", plane_ca.pem())]);

        let err = authorizer
            .authorize(&plane(), &peer(shared_ca.issue("prod")))
            .unwrap_err();
        assert!(matches!(err, PlaneAuthError::Rejected(_)));
        assert!(err.to_string().starts_with("certificate verification failed: "));
    }

    #[test]
    fn test_authorized_only_for_matching_resources() {
        let org_a = TestCa::new("org-a");
        let org_b = TestCa::new("org-b");
        let authorizer = authorizer(vec![
            ("org-a/prod-dp", org_a.pem()),
            ("org-b/prod-dp", org_b.pem()),
            ("/shared-dp", org_a.pem()),
        ]);

        let crs = authorizer.authorize(&plane(), &peer(org_a.issue("prod"))).unwrap();
        assert_eq!(crs, vec!["/shared-dp".to_string(), "org-a/prod-dp".to_string()]);
    }

    #[test]
    fn test_missing_certificate_rejected() {
        let ca = TestCa::new("org-a");
        let authorizer = authorizer(vec![("org-a/prod-dp", ca.pem())]);
        assert_eq!(
            authorizer.authorize(&plane(), &PeerCertificates::default()),
            Err(PlaneAuthError::NoClientCertificate)
        );
    }

    #[test]
    fn test_plane_without_ca_rejected() {
        let ca = TestCa::new("org-a");
        let authorizer = authorizer(vec![]);
        assert_eq!(
            authorizer.authorize(&plane(), &peer(ca.issue("prod"))),
            Err(PlaneAuthError::NoPlaneCa("dataplane/prod".to_string()))
        );
    }

    #[test]
    fn test_garbage_ca_does_not_authorize() {
        let ca = TestCa::new("org-a");
        let authorizer = authorizer(vec![("org-a/prod-dp", "not a pem".to_string())]);
        let err = authorizer.authorize(&plane(), &peer(ca.issue("prod"))).unwrap_err();
        assert!(matches!(err, PlaneAuthError::Rejected(_)));
    }

    // =========================================================================
    // CA file
    // =========================================================================

    #[test]
    fn test_file_source_filters_by_plane() {
        let dir = TempDir::new().unwrap();
        let ca = TestCa::new("org-a");
        std::fs::write(dir.path().join("org-a.pem"), ca.pem()).unwrap();

        let config = dir.path().join("planes.yaml");
        let mut file = std::fs::File::create(&config).unwrap();
        write!(
            file,
            r#"planes:
  - planeType: dataplane
    planeID: prod
    namespace: org-a
    name: prod-dp
    clientCAFile: org-a.pem
  - planeType: dataplane
    planeID: prod
    name: shared-dp
    clientCA: |
{}
  - planeType: buildplane
    planeID: prod
    name: builds
    clientCAFile: org-a.pem
  - planeType: dataplane
    planeID: prod
    namespace: org-c
    name: broken
"#,
            ca.pem()
                .lines()
                .map(|l| format!("      {}", l))
                .collect::<Vec<_>>()
                .join("\n")
        )
        .unwrap();

        let cas = FilePlaneCaSource::new(&config).client_cas(&plane()).unwrap();
        let keys: Vec<&str> = cas.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/shared-dp", "org-a/prod-dp"]);
        assert_eq!(cas["org-a/prod-dp"], ca.pem().into_bytes());
    }

    #[test]
    fn test_file_source_missing_file() {
        let err = FilePlaneCaSource::new("/nonexistent/planes.yaml")
            .client_cas(&plane())
            .unwrap_err();
        assert!(matches!(err, PlaneAuthError::Source(_)));
    }

    #[test]
    fn test_resource_key() {
        assert_eq!(resource_key("org-a", "prod-dp"), "org-a/prod-dp");
        assert_eq!(resource_key("", "shared-dp"), "/shared-dp");
    }
}
