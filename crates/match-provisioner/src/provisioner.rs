//! Game-server provisioning.
//!
//! One match request produces one pod and one `NodePort` service. The pod is
//! created first; the service is only attempted once the pod was accepted.
//! Failures are logged and reported through [`ProvisionOutcome`], never
//! returned as errors, because the request has already been acknowledged.

use crate::cluster::ClusterApi;
use crate::config::ClusterSettings;
use crate::dispatcher::{MatchHandler, MatchRequest};
use crate::error::{ProvisionError, Result};
use crate::ports::{PortAllocator, PortAssignment};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Label used to bind the service to its pod
pub const APP_LABEL: &str = "app";

/// Name of the single container in every game-server pod
pub const CONTAINER_NAME: &str = "game-server";

const SERVICE_SUFFIX: &str = "-svc";
const MANAGED_BY_ANNOTATION: &str = "app.kubernetes.io/managed-by";
const REQUESTED_AT_ANNOTATION: &str = "match-provisioner/requested-at";
const MANAGER: &str = "match-provisioner";

/// Names and port of a fully provisioned match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedMatch {
    pub workload: String,
    pub service: String,
    pub port: u16,
}

/// Result of handling one match request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Pod and service were both created
    Provisioned(ProvisionedMatch),

    /// No free port could be selected; nothing was created
    PortUnavailable,

    /// The pod was rejected; no service was attempted
    WorkloadFailed { workload: String },

    /// The service was rejected after the pod was created
    ServiceFailed {
        workload: String,
        port: u16,
        /// Whether the pod was deleted afterwards
        workload_deleted: bool,
    },
}

impl ProvisionOutcome {
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        matches!(self, Self::Provisioned(_))
    }
}

/// Generate a unique workload name, `<prefix>-<uuid>`.
#[must_use]
pub fn workload_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Service name derived from the workload name
#[must_use]
pub fn service_name(workload: &str) -> String {
    format!("{workload}{SERVICE_SUFFIX}")
}

fn selector_labels(workload: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), workload.to_string())])
}

fn annotations(request: &MatchRequest) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_ANNOTATION.to_string(), MANAGER.to_string()),
        (
            REQUESTED_AT_ANNOTATION.to_string(),
            request.received_at.to_rfc3339(),
        ),
    ])
}

/// Build the game-server pod
#[must_use]
pub fn build_workload(name: &str, settings: &ClusterSettings, request: &MatchRequest) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(settings.namespace.clone()),
            labels: Some(selector_labels(name)),
            annotations: Some(annotations(request)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(settings.image.clone()),
                ports: Some(vec![ContainerPort {
                    container_port: i32::from(settings.container_port),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the `NodePort` service exposing `workload` on `port`
#[must_use]
pub fn build_service(
    workload: &str,
    port: u16,
    settings: &ClusterSettings,
    request: &MatchRequest,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(workload)),
            namespace: Some(settings.namespace.clone()),
            annotations: Some(annotations(request)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector_labels(workload)),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port: i32::from(port),
                node_port: Some(i32::from(port)),
                target_port: Some(IntOrString::Int(i32::from(settings.container_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Creates the pod and service for each match request
pub struct Provisioner {
    cluster: Arc<dyn ClusterApi>,
    allocator: PortAllocator,
    settings: ClusterSettings,
}

impl Provisioner {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        allocator: PortAllocator,
        settings: ClusterSettings,
    ) -> Self {
        Self {
            cluster,
            allocator,
            settings,
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Provision one match. Never fails; the outcome is logged and returned.
    pub async fn provision(&self, request: &MatchRequest) -> ProvisionOutcome {
        let name = workload_name(&self.settings.name_prefix);
        let span = info_span!("provision", workload = %name, namespace = %self.settings.namespace);

        async {
            info!("🎮 Creating a match and starting a game server");
            match self.try_provision(&name, request).await {
                Ok(provisioned) => {
                    info!(
                        service = %provisioned.service,
                        port = provisioned.port,
                        "✅ Match provisioned"
                    );
                    ProvisionOutcome::Provisioned(provisioned)
                }
                Err(e) => self.absorb(&name, e).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn try_provision(&self, name: &str, request: &MatchRequest) -> Result<ProvisionedMatch> {
        let namespace = &self.settings.namespace;
        let PortAssignment { port, .. } = self.allocator.allocate(namespace).await?;

        let pod = build_workload(name, &self.settings, request);
        let created = match self.cluster.create_workload(namespace, &pod).await {
            Ok(created) => created,
            Err(source) => {
                self.allocator.release(port).await;
                return Err(ProvisionError::WorkloadCreationFailed {
                    name: name.to_string(),
                    source,
                });
            }
        };
        info!(pod = %created, "Created game-server pod");

        let service = build_service(&created, port, &self.settings, request);
        let result = self.cluster.create_service(namespace, &service).await;
        self.allocator.release(port).await;

        match result {
            Ok(service) => Ok(ProvisionedMatch {
                workload: created,
                service,
                port,
            }),
            Err(source) => Err(ProvisionError::ServiceCreationFailed {
                name: service_name(&created),
                workload: created,
                port,
                source,
            }),
        }
    }

    async fn absorb(&self, name: &str, err: ProvisionError) -> ProvisionOutcome {
        let orphan = match &err {
            ProvisionError::WorkloadCreationFailed { .. } => {
                error!(error = %err, "❌ Pod creation failed, skipping service");
                return ProvisionOutcome::WorkloadFailed {
                    workload: name.to_string(),
                };
            }
            ProvisionError::ServiceCreationFailed { workload, port, .. } => {
                error!(error = %err, "❌ Service creation failed");
                (workload.clone(), *port)
            }
            _ => {
                error!(error = %err, "❌ Could not select an external port");
                return ProvisionOutcome::PortUnavailable;
            }
        };

        let (workload, port) = orphan;
        let workload_deleted = self.cleanup_orphan(&workload).await;
        ProvisionOutcome::ServiceFailed {
            workload,
            port,
            workload_deleted,
        }
    }

    async fn cleanup_orphan(&self, workload: &str) -> bool {
        if !self.settings.delete_orphaned_workloads {
            warn!(pod = %workload, "Leaving pod without a service");
            return false;
        }

        match self
            .cluster
            .delete_workload(&self.settings.namespace, workload)
            .await
        {
            Ok(()) => {
                info!(pod = %workload, "🧹 Deleted pod whose service failed");
                true
            }
            Err(e) => {
                error!(pod = %workload, error = %e, "Failed to delete orphaned pod");
                false
            }
        }
    }
}

#[async_trait]
impl MatchHandler for Provisioner {
    async fn handle(&self, request: MatchRequest) {
        self.provision(&request).await;
    }
}
