//! Actor tree that runs a benchmark.
//!
//! # Architecture
//!
//! One run is a small supervision tree of ractor actors:
//! - **Benchmark orchestrator**: top-level state machine the caller waits on
//! - **Cluster builder**: owns the node builders, aggregates their replies
//! - **Dispatcher**: fans hosts out, waits for remote hosts to be reachable
//! - **Node builder**: installs, launches and stops the nodes of one host
//!
//! Actors share nothing; they talk through the messages in [`messages`].
//! Failures travel upward one hop at a time as [`FailureSignal`] data, and
//! the caller receives exactly one [`BenchmarkOutcome`].
//!
//! # Example
//!
//! ```ignore
//! use benchrig_orchestrator::actors::run_benchmark;
//! use benchrig_orchestrator::{Collaborators, EngineSettings, RunContext};
//!
//! let outcome = run_benchmark(ctx, collaborators, EngineSettings::default()).await?;
//! outcome.into_result()?;
//! ```

pub mod benchmark;
pub mod cluster_builder;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod messages;
pub mod node_builder;
pub mod pending;
pub mod supervision;

pub use benchmark::{
    BenchmarkActorDef, BenchmarkArguments, BenchmarkPhase, BenchmarkRun, run_benchmark,
};
pub use cluster_builder::{
    ClusterBuilderActorDef, ClusterBuilderArguments, RunState, cluster_status,
    spawn_cluster_builder,
};
pub use dispatcher::{DispatcherActorDef, DispatcherArguments, spawn_dispatcher};
pub use errors::{ActorError, FailureSignal};
pub use events::CoordinatorEvents;
pub use messages::{
    BenchmarkMessage, BenchmarkOutcome, ChildExit, ChildRole, ClusterBuilderMessage,
    ClusterStatus, DispatcherMessage, NodeBuilderMessage, StartNodes,
};
pub use node_builder::{
    FlushHandle, FlushTimer, NodeBuilderActorDef, NodeBuilderArguments, NodePhase,
    spawn_node_builder,
};
pub use pending::{PendingResponses, Recorded};
pub use supervision::{Supervised, stop_all_and_wait, supervise};
