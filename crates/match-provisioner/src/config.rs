//! Provisioner Configuration
//!
//! Loaded from an optional YAML file, then overridden from the environment.
//! Every section falls back to defaults, so an empty file is a valid config.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kubeconfig location used when none is configured and the file exists.
pub const DEFAULT_KUBECONFIG_PATH: &str = "/root/.kube/config";

/// Default Kubernetes NodePort range, `[start, end)`
pub const NODE_PORT_RANGE: std::ops::Range<u16> = 30000..32767;

const MAX_DNS_LABEL_LENGTH: usize = 63;

/// `-` + hyphenated UUID + `-svc` appended to the prefix in service names
const GENERATED_SUFFIX_LENGTH: usize = 1 + 36 + 4;

/// Longest name prefix whose derived service name is still a DNS label
pub const MAX_NAME_PREFIX_LENGTH: usize = MAX_DNS_LABEL_LENGTH - GENERATED_SUFFIX_LENGTH;

/// Main provisioner configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvisionerConfig {
    /// Broker connection parameters
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Broker connection retry policy
    #[serde(default)]
    pub connect: ConnectSettings,

    /// Target cluster and workload template
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// External port range
    #[serde(default)]
    pub ports: PortSettings,
}

/// Broker connection parameters
#[derive(Clone, Deserialize, Serialize)]
pub struct BrokerSettings {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_guest")]
    pub username: String,

    #[serde(default = "default_guest")]
    pub password: String,

    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Queue the match requests are published to
    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default = "default_consumer_tag", rename = "consumerTag")]
    pub consumer_tag: String,
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: default_guest(),
            password: default_guest(),
            vhost: default_vhost(),
            queue: default_queue(),
            consumer_tag: default_consumer_tag(),
        }
    }
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_queue() -> String {
    "match-requests".to_string()
}

fn default_consumer_tag() -> String {
    "match-provisioner".to_string()
}

/// Fixed-count, fixed-delay retry policy for the broker connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectSettings {
    #[serde(default = "default_connect_attempts")]
    pub attempts: u32,

    #[serde(default = "default_connect_delay_ms", rename = "delayMs")]
    pub delay_ms: u64,
}

impl ConnectSettings {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            attempts: default_connect_attempts(),
            delay_ms: default_connect_delay_ms(),
        }
    }
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_delay_ms() -> u64 {
    2000
}

/// Target namespace and game-server workload template
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterSettings {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Explicit kubeconfig path; falls back to [`DEFAULT_KUBECONFIG_PATH`] or inference
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Game-server container image
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_container_port", rename = "containerPort")]
    pub container_port: u16,

    /// Prefix of generated workload names
    #[serde(default = "default_name_prefix", rename = "namePrefix")]
    pub name_prefix: String,

    /// Delete the workload when its service cannot be created
    #[serde(default, rename = "deleteOrphanedWorkloads")]
    pub delete_orphaned_workloads: bool,
}

impl ClusterSettings {
    /// Kubeconfig to load, if any. `None` means default inference.
    #[must_use]
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig.clone().or_else(|| {
            let fallback = Path::new(DEFAULT_KUBECONFIG_PATH);
            fallback.exists().then(|| fallback.to_path_buf())
        })
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubeconfig: None,
            image: default_image(),
            container_port: default_container_port(),
            name_prefix: default_name_prefix(),
            delete_orphaned_workloads: false,
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_image() -> String {
    "alissonfabiano/game-server:latest".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_name_prefix() -> String {
    "game-server".to_string()
}

/// Half-open external port range `[min, max)` and the allocation attempt cap
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortSettings {
    #[serde(default = "default_port_min")]
    pub min: u16,

    #[serde(default = "default_port_max")]
    pub max: u16,

    #[serde(default = "default_max_attempts", rename = "maxAttempts")]
    pub max_attempts: u32,
}

impl PortSettings {
    #[must_use]
    pub fn range(&self) -> std::ops::Range<u16> {
        self.min..self.max
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_port_min() -> u16 {
    NODE_PORT_RANGE.start
}

fn default_port_max() -> u16 {
    NODE_PORT_RANGE.end
}

fn default_max_attempts() -> u32 {
    256
}

impl ProvisionerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ProvisionError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RABBITMQ_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            self.broker.port = port.trim().parse().map_err(|_| {
                ProvisionError::InvalidConfig(format!("RABBITMQ_PORT is not a valid port: {port}"))
            })?;
        }
        if let Some(username) = lookup("RABBITMQ_USERNAME") {
            self.broker.username = username;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            self.broker.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            self.broker.vhost = vhost;
        }
        if let Some(queue) = lookup("RABBITMQ_QUEUE") {
            self.broker.queue = queue;
        }
        if let Some(namespace) = lookup("K8S_NAMESPACE") {
            self.cluster.namespace = namespace;
        }
        if let Some(kubeconfig) = lookup("KUBECONFIG") {
            self.cluster.kubeconfig = Some(PathBuf::from(kubeconfig));
        }
        if let Some(image) = lookup("GAME_SERVER_IMAGE") {
            self.cluster.image = image;
        }
        Ok(self)
    }

    /// Reject configurations the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.broker.queue.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig("broker.queue must not be empty".into()));
        }
        if self.cluster.namespace.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig(
                "cluster.namespace must not be empty".into(),
            ));
        }
        if self.cluster.image.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig("cluster.image must not be empty".into()));
        }
        if self.cluster.container_port == 0 {
            return Err(ProvisionError::InvalidConfig(
                "cluster.containerPort must be between 1 and 65535".into(),
            ));
        }
        if self.ports.min >= self.ports.max {
            return Err(ProvisionError::InvalidConfig(format!(
                "ports range [{}, {}) is empty",
                self.ports.min, self.ports.max
            )));
        }
        if self.ports.min < NODE_PORT_RANGE.start || self.ports.max > NODE_PORT_RANGE.end {
            return Err(ProvisionError::InvalidConfig(format!(
                "ports range [{}, {}) must lie within the NodePort range [{}, {})",
                self.ports.min, self.ports.max, NODE_PORT_RANGE.start, NODE_PORT_RANGE.end
            )));
        }
        validate_name_prefix(&self.cluster.name_prefix)?;
        if self.ports.max_attempts == 0 {
            return Err(ProvisionError::InvalidConfig(
                "ports.maxAttempts must be at least 1".into(),
            ));
        }
        if self.connect.attempts == 0 {
            return Err(ProvisionError::InvalidConfig(
                "connect.attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Generated names must stay valid DNS-1035 labels, services included.
fn validate_name_prefix(prefix: &str) -> Result<()> {
    let starts_with_letter = prefix.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let allowed = prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if !starts_with_letter || !allowed {
        return Err(ProvisionError::InvalidConfig(format!(
            "cluster.namePrefix {prefix:?} must start with a lowercase letter and contain only \
             lowercase letters, digits and '-'"
        )));
    }
    if prefix.len() > MAX_NAME_PREFIX_LENGTH {
        return Err(ProvisionError::InvalidConfig(format!(
            "cluster.namePrefix is {} characters, at most {MAX_NAME_PREFIX_LENGTH} allowed",
            prefix.len()
        )));
    }
    Ok(())
}
