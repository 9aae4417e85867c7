//! Orchestrator access.
//!
//! [`ClusterApi`] is the only surface the provisioning flow touches. [`KubeCluster`]
//! implements it over a shared `kube::Client`; the client is used concurrently by
//! every in-flight flow without additional locking.

use crate::config::ClusterSettings;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tracing::{debug, info};

/// Cluster operations needed to provision a match.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Ports a new service in `namespace` must avoid: every `nodePort` in the
    /// cluster (they share one cluster-wide range) plus every `port` exposed
    /// by services in the namespace.
    async fn service_ports(&self, namespace: &str) -> Result<Vec<u16>, kube::Error>;

    /// Create the pod, returning the name the orchestrator accepted.
    async fn create_workload(&self, namespace: &str, pod: &Pod) -> Result<String, kube::Error>;

    /// Create the service, returning the name the orchestrator accepted.
    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<String, kube::Error>;

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// [`ClusterApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the configured kubeconfig, or infer one
    /// (in-cluster service account, `$KUBECONFIG`, `~/.kube/config`).
    pub async fn connect(settings: &ClusterSettings) -> Result<Self> {
        let client = match settings.kubeconfig_path() {
            Some(path) => {
                info!(path = %path.display(), "Loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(&path)?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await?;
                Client::try_from(config)?
            }
            None => {
                info!("No kubeconfig file found, inferring cluster configuration");
                Client::try_default().await?
            }
        };
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn service_ports(&self, namespace: &str) -> Result<Vec<u16>, kube::Error> {
        // Needs cluster-wide list permission on services.
        let services: Api<Service> = Api::all(self.client.clone());
        let list = services.list(&ListParams::default()).await?;
        let ports = occupied_ports(&list.items, namespace);
        debug!(
            namespace,
            services = list.items.len(),
            ports = ports.len(),
            "Listed service ports"
        );
        Ok(ports)
    }

    async fn create_workload(&self, namespace: &str, pod: &Pod) -> Result<String, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let created = pods.create(&PostParams::default(), pod).await?;
        Ok(created.name_any())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<String, kube::Error> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let created = services.create(&PostParams::default(), service).await?;
        Ok(created.name_any())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Flatten the `port` and `nodePort` of every service port entry.
#[must_use]
pub fn exposed_ports(services: &[Service]) -> Vec<u16> {
    services
        .iter()
        .filter_map(|svc| svc.spec.as_ref())
        .filter_map(|spec| spec.ports.as_ref())
        .flatten()
        .flat_map(|p| [Some(p.port), p.node_port])
        .flatten()
        .filter_map(|port| u16::try_from(port).ok())
        .collect()
}

/// Ports unavailable to a new NodePort service in `namespace`, given services
/// from every namespace: all `nodePort`s, plus `port`s of same-namespace services.
#[must_use]
pub fn occupied_ports(services: &[Service], namespace: &str) -> Vec<u16> {
    services
        .iter()
        .filter_map(|svc| {
            let local = svc.metadata.namespace.as_deref() == Some(namespace);
            svc.spec.as_ref()?.ports.as_ref().map(|ports| (local, ports))
        })
        .flat_map(|(local, ports)| {
            ports
                .iter()
                .flat_map(move |p| [local.then_some(p.port), p.node_port])
        })
        .flatten()
        .filter_map(|port| u16::try_from(port).ok())
        .collect()
}
