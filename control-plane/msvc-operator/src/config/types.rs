use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    #[envconfig(from = "HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Namespace to watch; unset or empty watches the whole cluster.
    /// Env: MSVC_WATCH_NAMESPACE
    #[envconfig(from = "MSVC_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Number of MicroServices reconciled in parallel.
    #[envconfig(from = "MSVC_WORKERS", default = "4")]
    pub workers: u16,

    #[envconfig(from = "MSVC_RECONCILE_TIMEOUT_SECS", default = "30")]
    pub reconcile_timeout_secs: u64,

    /// Periodic resync after a successful reconcile; 0 disables it.
    #[envconfig(from = "MSVC_RESYNC_SECS", default = "300")]
    pub resync_secs: u64,

    /// finalizer | cascade
    #[envconfig(from = "MSVC_DELETION_STRATEGY", default = "finalizer")]
    pub deletion_strategy: DeletionStrategy,

    /// ingressClassName stamped on generated Ingresses when set.
    #[envconfig(from = "MSVC_INGRESS_CLASS")]
    pub ingress_class: Option<String>,

    #[envconfig(nested)]
    pub retry: RetryConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryConfig {
    /// Immediate re-fetch attempts after an optimistic-concurrency conflict.
    #[envconfig(from = "MSVC_CONFLICT_RETRIES", default = "3")]
    pub conflict_retries: u32,
    #[envconfig(from = "MSVC_CONFLICT_DELAY_MS", default = "200")]
    pub conflict_delay_ms: u64,
    #[envconfig(from = "MSVC_BACKOFF_BASE_MS", default = "500")]
    pub backoff_base_ms: u64,
    #[envconfig(from = "MSVC_BACKOFF_MAX_SECS", default = "300")]
    pub backoff_max_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 3,
            conflict_delay_ms: 200,
            backoff_base_ms: 500,
            backoff_max_secs: 300,
        }
    }
}

/// How dependents are torn down when a MicroService is deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletionStrategy {
    /// Hold a finalizer and delete Ingress, Service, Deployment in order.
    #[default]
    Finalizer,
    /// Leave teardown to owner-reference garbage collection.
    Cascade,
}

impl FromStr for DeletionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "finalizer" => Ok(DeletionStrategy::Finalizer),
            "cascade" | "ownerreference" | "gc" => Ok(DeletionStrategy::Cascade),
            other => Err(format!("unknown deletion strategy '{other}'")),
        }
    }
}

impl std::fmt::Display for DeletionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionStrategy::Finalizer => write!(f, "finalizer"),
            DeletionStrategy::Cascade => write!(f, "cascade"),
        }
    }
}

impl OperatorConfig {
    pub fn watch_namespace(&self) -> Option<&str> {
        non_empty(self.watch_namespace.as_deref())
    }

    pub fn ingress_class(&self) -> Option<&str> {
        non_empty(self.ingress_class.as_deref())
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs.max(1))
    }

    pub fn resync(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }
}

impl RetryConfig {
    pub fn conflict_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_delay_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs).max(self.backoff_base())
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}
