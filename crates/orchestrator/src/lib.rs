//! # benchrig orchestrator
//!
//! Provisions, launches, monitors and tears down the cluster a benchmark runs
//! against, and drives the benchmark itself through an actor tree.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub use benchrig_core::{Config, Error, Result, Scope};

/// Actor tree of a benchmark run
pub mod actors;

/// Interfaces of supplier, provisioner, launcher, metrics store and friends
pub mod collaborators;

pub mod context;

/// Host membership feed
pub mod discovery;

pub mod engine;

/// Target host parsing and node assignment
pub mod hosts;

/// Delivery policy for actor messages
pub mod messaging;

pub mod pipeline;

pub mod results;

pub use actors::{
    ActorError, BenchmarkOutcome, BenchmarkRun, FailureSignal, PendingResponses, RunState,
    run_benchmark,
};
pub use collaborators::{
    Collaborators, EngineToolkit, InMemoryMetricsStore, InMemoryMetricsStoreFactory, Launcher,
    LoggingResultsSink, MetricsStore, MetricsStoreFactory, Provisioner, ResultsSink, Supplier,
    WorkerCoordinator,
};
pub use context::{BuildFlavor, EngineSettings, HostConfig, MetricsContext, RunContext};
pub use discovery::{DiscoveryFeed, HostAvailability, MembershipFeed};
pub use hosts::{HostEndpoint, HostSpec, NodeAssignment, nodes_by_host, to_ip_port};
pub use pipeline::{Pipeline, PipelineRegistry};
pub use results::{FinalResults, MetricRecord, TestExecution};
