#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Match provisioner
//!
//! Long-running worker that turns match requests read from a RabbitMQ queue
//! into game-server workloads on Kubernetes. Each message produces one pod
//! and one `NodePort` service on a port that no live service exposes.
//!
//! # Architecture
//!
//! - [`broker`] connects with fixed retry and declares the match queue
//! - [`dispatcher`] decodes deliveries and runs one handler task per message
//! - [`provisioner`] builds and submits the pod, then the service
//! - [`ports`] selects collision-free external ports from live cluster state
//! - [`cluster`] is the Kubernetes seam used by the two above
//!
//! Delivery is at-most-once: messages are acknowledged on receipt and a
//! failed provisioning flow is only visible in the logs.

pub mod broker;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ports;
pub mod provisioner;

pub use broker::BrokerConnection;
pub use cluster::{ClusterApi, KubeCluster};
pub use config::ProvisionerConfig;
pub use dispatcher::{DispatchSummary, Dispatcher, MatchHandler, MatchRequest};
pub use error::{ProvisionError, Result};
pub use ports::{CandidateSource, PortAllocator, PortAssignment, RandomPorts};
pub use provisioner::{ProvisionOutcome, ProvisionedMatch, Provisioner};
