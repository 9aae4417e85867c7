//! End-to-end provisioning against an in-memory cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use match_provisioner::cluster::{exposed_ports, occupied_ports};
use match_provisioner::config::{ClusterSettings, PortSettings};
use match_provisioner::{
    CandidateSource, ClusterApi, Dispatcher, MatchRequest, PortAllocator, ProvisionError,
    ProvisionOutcome, Provisioner,
};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeCluster {
    pods: Mutex<Vec<Pod>>,
    services: Mutex<Vec<Service>>,
    service_calls: Mutex<u32>,
    reject_pods: bool,
    /// Delay inside create_service to widen the check-then-create window
    service_latency: Option<Duration>,
}

fn rejected(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn service_ports(&self, namespace: &str) -> Result<Vec<u16>, kube::Error> {
        Ok(occupied_ports(&self.services.lock().unwrap(), namespace))
    }

    async fn create_workload(&self, _namespace: &str, pod: &Pod) -> Result<String, kube::Error> {
        if self.reject_pods {
            return Err(rejected(403, "Forbidden"));
        }
        self.pods.lock().unwrap().push(pod.clone());
        Ok(pod.metadata.name.clone().unwrap_or_default())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<String, kube::Error> {
        *self.service_calls.lock().unwrap() += 1;
        if let Some(latency) = self.service_latency {
            tokio::time::sleep(latency).await;
        }

        let requested = exposed_ports(std::slice::from_ref(service));
        let mut services = self.services.lock().unwrap();
        let taken = occupied_ports(&services, namespace);
        if requested.iter().any(|port| taken.contains(port)) {
            return Err(rejected(422, "provided port is already allocated"));
        }
        let mut stored = service.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        services.push(stored);
        Ok(service.metadata.name.clone().unwrap_or_default())
    }

    async fn delete_workload(&self, _namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.pods
            .lock()
            .unwrap()
            .retain(|pod| pod.metadata.name.as_deref() != Some(name));
        Ok(())
    }
}

/// Replays candidates, then cycles upward through the range
struct Scripted {
    queue: VecDeque<u16>,
    next: u16,
}

impl Scripted {
    fn new(ports: &[u16]) -> Self {
        Self {
            queue: ports.iter().copied().collect(),
            next: 30000,
        }
    }
}

impl CandidateSource for Scripted {
    fn next_candidate(&mut self, range: &Range<u16>) -> u16 {
        self.queue.pop_front().unwrap_or_else(|| {
            let port = self.next;
            self.next = if port + 1 >= range.end { range.start } else { port + 1 };
            port
        })
    }
}

fn provisioner(cluster: Arc<FakeCluster>, ports: &[u16]) -> Provisioner {
    let api: Arc<dyn ClusterApi> = cluster;
    let allocator = PortAllocator::new(
        Arc::clone(&api),
        &PortSettings::default(),
        Box::new(Scripted::new(ports)),
    );
    Provisioner::new(api, allocator, ClusterSettings::default())
}

fn service_with_port(namespace: &str, port: u16) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("existing".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            ports: Some(vec![ServicePort {
                port: i32::from(port),
                node_port: Some(i32::from(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn provisions_one_pod_and_matching_service() {
    let cluster = Arc::new(FakeCluster::default());
    let provisioner = provisioner(Arc::clone(&cluster), &[31000]);

    let outcome = provisioner
        .provision(&MatchRequest::from_bytes(b"{\"players\":[\"a\",\"b\"]}"))
        .await;
    assert!(outcome.is_provisioned());

    let pods = cluster.pods.lock().unwrap();
    let services = cluster.services.lock().unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(services.len(), 1);

    let spec = services[0].spec.as_ref().unwrap();
    assert_eq!(spec.selector, pods[0].metadata.labels);
    let port = &spec.ports.as_ref().unwrap()[0];
    assert_eq!(port.port, 31000);
    assert!((30000..32767).contains(&port.port));
}

#[tokio::test]
async fn same_payload_twice_creates_two_servers() {
    let cluster = Arc::new(FakeCluster::default());
    let provisioner = provisioner(Arc::clone(&cluster), &[]);
    let payload = b"match-42";

    let first = provisioner.provision(&MatchRequest::from_bytes(payload)).await;
    let second = provisioner.provision(&MatchRequest::from_bytes(payload)).await;

    let (ProvisionOutcome::Provisioned(first), ProvisionOutcome::Provisioned(second)) =
        (first, second)
    else {
        panic!("both requests should be provisioned");
    };
    assert_ne!(first.workload, second.workload);
    assert_ne!(first.service, second.service);
    assert_ne!(first.port, second.port);
    assert_eq!(cluster.pods.lock().unwrap().len(), 2);
    assert_eq!(cluster.services.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_payload_is_still_provisioned() {
    let cluster = Arc::new(FakeCluster::default());
    let outcome = provisioner(Arc::clone(&cluster), &[])
        .provision(&MatchRequest::from_bytes(b""))
        .await;

    assert!(outcome.is_provisioned());
    assert_eq!(cluster.pods.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn redraws_when_port_is_taken() {
    let cluster = Arc::new(FakeCluster::default());
    cluster
        .services
        .lock()
        .unwrap()
        .push(service_with_port("default", 30500));

    let outcome = provisioner(Arc::clone(&cluster), &[30500, 30777])
        .provision(&MatchRequest::from_bytes(b"x"))
        .await;

    match outcome {
        ProvisionOutcome::Provisioned(provisioned) => assert_eq!(provisioned.port, 30777),
        other => panic!("expected provisioned, got {other:?}"),
    }
}

#[tokio::test]
async fn redraws_when_node_port_is_taken_in_another_namespace() {
    let cluster = Arc::new(FakeCluster::default());
    cluster
        .services
        .lock()
        .unwrap()
        .push(service_with_port("tournaments", 31400));

    let outcome = provisioner(Arc::clone(&cluster), &[31400, 31401])
        .provision(&MatchRequest::from_bytes(b"x"))
        .await;

    match outcome {
        ProvisionOutcome::Provisioned(provisioned) => assert_eq!(provisioned.port, 31401),
        other => panic!("expected provisioned, got {other:?}"),
    }
    assert_eq!(*cluster.service_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn failed_pod_means_no_service_call() {
    let cluster = Arc::new(FakeCluster {
        reject_pods: true,
        ..FakeCluster::default()
    });

    let outcome = provisioner(Arc::clone(&cluster), &[])
        .provision(&MatchRequest::from_bytes(b"x"))
        .await;

    assert!(matches!(outcome, ProvisionOutcome::WorkloadFailed { .. }));
    assert_eq!(*cluster.service_calls.lock().unwrap(), 0);
    assert!(cluster.services.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_matches_get_distinct_ports() {
    let cluster = Arc::new(FakeCluster {
        service_latency: Some(Duration::from_millis(20)),
        ..FakeCluster::default()
    });
    // Every flow would draw 31500 first if allocation were not serialised.
    let provisioner = Arc::new(provisioner(
        Arc::clone(&cluster),
        &[31500, 31500, 31500, 31500, 31500, 31500, 31500, 31500],
    ));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let provisioner = Arc::clone(&provisioner);
            tokio::spawn(async move {
                provisioner
                    .provision(&MatchRequest::from_bytes(format!("match-{i}").as_bytes()))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_provisioned());
    }

    let mut ports = exposed_ports(&cluster.services.lock().unwrap());
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 8);
    assert!(provisioner.allocator().claimed().await.is_empty());
}

#[tokio::test]
async fn dispatcher_provisions_every_message() {
    let cluster = Arc::new(FakeCluster::default());
    let provisioner = Arc::new(provisioner(Arc::clone(&cluster), &[]));

    let deliveries = futures::stream::iter(vec![
        Ok::<_, String>(b"one".to_vec()),
        Ok(b"two".to_vec()),
        Ok(Vec::new()),
    ]);
    let err = Dispatcher::new(provisioner).run(deliveries).await.unwrap_err();

    // A consumer that just stops is a failure, but only after every flow ran.
    assert!(matches!(err, ProvisionError::ConsumerCancelled));
    assert_eq!(cluster.pods.lock().unwrap().len(), 3);
    assert_eq!(cluster.services.lock().unwrap().len(), 3);
}
