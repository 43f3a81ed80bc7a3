//! Environment variable helpers
//!
//! An unset variable and a variable set to the empty string are treated the
//! same. Lookups go through [`EnvSource`] so tests can supply values without
//! touching the process environment.

/// Source of environment values
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, or `None` if unset
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

fn non_empty(source: &dyn EnvSource, key: &str) -> Option<String> {
    source.var(key).filter(|v| !v.is_empty())
}

/// Kubernetes service environment injected into every pod
#[cfg_attr(test, mockall::automock)]
pub trait K8sEnvConfig: Send + Sync {
    /// `KUBERNETES_SERVICE_HOST`
    fn service_host(&self) -> Option<String>;
    /// `KUBERNETES_SERVICE_PORT`
    fn service_port(&self) -> Option<String>;
}

impl K8sEnvConfig for OsEnv {
    fn service_host(&self) -> Option<String> {
        non_empty(self, "KUBERNETES_SERVICE_HOST")
    }

    fn service_port(&self) -> Option<String> {
        non_empty(self, "KUBERNETES_SERVICE_PORT")
    }
}

/// In-cluster API server URL, or `None` outside a pod.
///
/// IPv6 hosts are bracketed; the port defaults to 443.
pub fn api_server_endpoint(env: &dyn K8sEnvConfig) -> Option<String> {
    let host = env.service_host()?;
    let port = env.service_port().unwrap_or_else(|| "443".to_string());
    if host.contains(':') && !host.starts_with('[') {
        Some(format!("https://[{}]:{}", host, port))
    } else {
        Some(format!("https://{}:{}", host, port))
    }
}
