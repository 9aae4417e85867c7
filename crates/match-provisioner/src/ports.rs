//! External port selection.
//!
//! Candidates are drawn at random from the configured range and checked against
//! the ports of every live service in the namespace. Allocation is serialised
//! through one mutex which also tracks ports handed out but not yet backed by a
//! submitted service, so two flows in this worker never receive the same port.

use crate::cluster::ClusterApi;
use crate::config::PortSettings;
use crate::error::{ProvisionError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Source of candidate ports.
pub trait CandidateSource: Send {
    /// Draw a candidate from the half-open `range`.
    fn next_candidate(&mut self, range: &Range<u16>) -> u16;
}

/// Uniform draws from any `rand` generator
pub struct RandomPorts<R> {
    rng: R,
}

impl<R: Rng + Send> RandomPorts<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RandomPorts<StdRng> {
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng + Send> CandidateSource for RandomPorts<R> {
    fn next_candidate(&mut self, range: &Range<u16>) -> u16 {
        self.rng.gen_range(range.clone())
    }
}

/// A port selected for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    pub port: u16,

    /// Number of candidates drawn, including the accepted one
    pub attempts: u32,
}

struct AllocatorState {
    source: Box<dyn CandidateSource>,
    claimed: BTreeSet<u16>,
}

/// Picks free external ports against live cluster state
pub struct PortAllocator {
    cluster: Arc<dyn ClusterApi>,
    range: Range<u16>,
    max_attempts: u32,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        settings: &PortSettings,
        source: Box<dyn CandidateSource>,
    ) -> Self {
        Self {
            cluster,
            range: settings.range(),
            max_attempts: settings.max_attempts,
            state: Mutex::new(AllocatorState {
                source,
                claimed: BTreeSet::new(),
            }),
        }
    }

    /// Select a port no live service in `namespace` exposes.
    ///
    /// The returned port stays claimed until [`PortAllocator::release`] is
    /// called. The uniqueness check against the cluster is point-in-time.
    pub async fn allocate(&self, namespace: &str) -> Result<PortAssignment> {
        let mut state = self.state.lock().await;

        for attempt in 1..=self.max_attempts {
            let candidate = state.source.next_candidate(&self.range);
            let in_use = self
                .cluster
                .service_ports(namespace)
                .await
                .map_err(ProvisionError::PortLookupFailed)?;

            if in_use.contains(&candidate) {
                warn!(
                    port = candidate,
                    attempt,
                    "Port already exposed by a service, drawing again"
                );
                continue;
            }
            if state.claimed.contains(&candidate) {
                warn!(
                    port = candidate,
                    attempt,
                    "Port claimed by an in-flight match, drawing again"
                );
                continue;
            }

            state.claimed.insert(candidate);
            info!(port = candidate, attempt, "Allocated external port");
            return Ok(PortAssignment {
                port: candidate,
                attempts: attempt,
            });
        }

        Err(ProvisionError::PortSpaceExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Drop the claim on `port` once its service submission has finished.
    pub async fn release(&self, port: u16) {
        let mut state = self.state.lock().await;
        if state.claimed.remove(&port) {
            debug!(port, "Released port claim");
        }
    }

    /// Ports currently claimed by in-flight flows
    pub async fn claimed(&self) -> Vec<u16> {
        self.state.lock().await.claimed.iter().copied().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of candidates
    pub(crate) struct ScriptedPorts(pub VecDeque<u16>);

    impl ScriptedPorts {
        pub(crate) fn new(ports: &[u16]) -> Self {
            Self(ports.iter().copied().collect())
        }
    }

    impl CandidateSource for ScriptedPorts {
        fn next_candidate(&mut self, range: &Range<u16>) -> u16 {
            self.0.pop_front().unwrap_or(range.start)
        }
    }

    fn settings(max_attempts: u32) -> PortSettings {
        PortSettings {
            max_attempts,
            ..PortSettings::default()
        }
    }

    fn cluster_with_ports(ports: Vec<u16>) -> Arc<dyn ClusterApi> {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_service_ports()
            .returning(move |_| Ok(ports.clone()));
        Arc::new(cluster)
    }

    #[tokio::test]
    async fn test_rejects_port_taken_by_live_service() {
        let allocator = PortAllocator::new(
            cluster_with_ports(vec![30500]),
            &settings(10),
            Box::new(ScriptedPorts::new(&[30500, 30501])),
        );

        let assignment = allocator.allocate("default").await.unwrap();
        assert_eq!(assignment.port, 30501);
        assert_eq!(assignment.attempts, 2);
    }

    #[tokio::test]
    async fn test_claimed_port_not_handed_out_twice() {
        let allocator = PortAllocator::new(
            cluster_with_ports(vec![]),
            &settings(10),
            Box::new(ScriptedPorts::new(&[31000, 31000, 31001])),
        );

        let first = allocator.allocate("default").await.unwrap();
        let second = allocator.allocate("default").await.unwrap();
        assert_eq!(first.port, 31000);
        assert_eq!(second.port, 31001);
        assert_eq!(allocator.claimed().await, vec![31000, 31001]);

        allocator.release(31000).await;
        assert_eq!(allocator.claimed().await, vec![31001]);
    }

    #[tokio::test]
    async fn test_exhaustion_after_attempt_cap() {
        let allocator = PortAllocator::new(
            cluster_with_ports(vec![30000]),
            &settings(3),
            Box::new(ScriptedPorts::new(&[30000, 30000, 30000, 30001])),
        );

        let err = allocator.allocate("default").await.unwrap_err();
        assert!(matches!(err, ProvisionError::PortSpaceExhausted { attempts: 3 }));
        assert!(allocator.claimed().await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_service_ports().times(1).returning(|_| {
            Err(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }))
        });

        let allocator = PortAllocator::new(
            Arc::new(cluster),
            &settings(5),
            Box::new(ScriptedPorts::new(&[30100])),
        );

        let err = allocator.allocate("default").await.unwrap_err();
        assert!(matches!(err, ProvisionError::PortLookupFailed(_)));
    }

    #[tokio::test]
    async fn test_random_ports_stay_in_range() {
        let allocator = PortAllocator::new(
            cluster_with_ports(vec![]),
            &settings(10),
            Box::new(RandomPorts::new(StdRng::seed_from_u64(7))),
        );

        for _ in 0..200 {
            let assignment = allocator.allocate("default").await.unwrap();
            assert!((30000..32767).contains(&assignment.port));
            allocator.release(assignment.port).await;
        }
    }
}
