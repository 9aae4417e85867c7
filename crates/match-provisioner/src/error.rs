//! Error types for the match provisioner.

use thiserror::Error;

/// Errors raised while connecting to the broker or provisioning a match.
///
/// Only broker errors are fatal. Everything raised inside a provisioning flow
/// is logged and absorbed by [`crate::Provisioner::provision`].
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Broker connection retries were exhausted
    #[error("broker unavailable after {attempts} attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },

    /// Channel, queue or consumer operation failed after connecting
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// The delivery stream reported an error while dispatching
    #[error("delivery stream failed: {0}")]
    DeliveryFailed(String),

    /// The delivery stream ended without a shutdown request, e.g. the
    /// broker cancelled the consumer or closed the channel
    #[error("delivery stream ended without a shutdown request")]
    ConsumerCancelled,

    /// Listing services for port selection failed
    #[error("failed to list services for port selection: {0}")]
    PortLookupFailed(#[source] kube::Error),

    /// No free port was found within the attempt cap
    #[error("no free port found after {attempts} attempts")]
    PortSpaceExhausted { attempts: u32 },

    /// The orchestrator rejected the workload
    #[error("failed to create workload {name}: {source}")]
    WorkloadCreationFailed {
        name: String,
        #[source]
        source: kube::Error,
    },

    /// The orchestrator rejected the service; the workload is left behind
    #[error("failed to create service {name} on port {port} for workload {workload}: {source}")]
    ServiceCreationFailed {
        name: String,
        workload: String,
        port: u16,
        #[source]
        source: kube::Error,
    },

    /// Kubeconfig could not be read or resolved
    #[error("kubeconfig error: {0}")]
    ClusterConfig(#[from] kube::config::KubeconfigError),

    /// Kubernetes client error outside a provisioning flow
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid YAML for the expected schema
    #[error("failed to parse config YAML: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Configuration values are inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias used throughout the crate.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
