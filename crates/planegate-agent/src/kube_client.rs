//! Kubernetes client provider for dependency injection
//!
//! Provides trait-based access to kube::Client creation so the agent's
//! startup path can be exercised without a cluster.

use std::time::Duration;

use planegate_common::env::{api_server_endpoint, OsEnv};

/// Connection timeout for the local API server
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for API calls
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A kube client plus the credentials the router needs for the `k8s` route
#[derive(Clone)]
pub struct KubeConnection {
    /// Client used for typed and raw API calls
    pub client: kube::Client,
    /// API server URL, e.g. `https://10.96.0.1:443`
    pub endpoint: String,
    /// Service-account bearer token, when one is readable
    pub token: Option<String>,
}

impl std::fmt::Debug for KubeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeConnection")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Trait for creating Kubernetes clients
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait KubeClientProvider: Send + Sync {
    /// Create a new Kubernetes client
    async fn create(&self) -> Result<KubeConnection, kube::Error>;
}

/// Creates clients from in-cluster config, falling back to kubeconfig
#[derive(Clone, Default)]
pub struct InClusterClientProvider;

#[async_trait::async_trait]
impl KubeClientProvider for InClusterClientProvider {
    async fn create(&self) -> Result<KubeConnection, kube::Error> {
        let mut config = kube::Config::infer()
            .await
            .map_err(kube::Error::InferConfig)?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        let endpoint = resolve_endpoint(&config.cluster_url.to_string());
        let token = config
            .auth_info
            .token_file
            .as_deref()
            .and_then(read_token);

        let client = kube::Client::try_from(config)?;
        Ok(KubeConnection {
            client,
            endpoint,
            token,
        })
    }
}

/// Prefer the configured cluster URL; use the pod service env otherwise.
fn resolve_endpoint(cluster_url: &str) -> String {
    let trimmed = cluster_url.trim_end_matches('/');
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    api_server_endpoint(&OsEnv).unwrap_or_default()
}

fn read_token(path: &str) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(token) => Some(token.trim().to_string()).filter(|t| !t.is_empty()),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Failed to read service account token");
            None
        }
    }
}
