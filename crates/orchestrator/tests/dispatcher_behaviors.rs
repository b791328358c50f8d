//! BDD-style behavioral tests for the host dispatcher.
//!
//! Remote hosts are simulated through the in-process membership feed; their
//! node builders run locally against the recording toolkit.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use ractor::ActorRef;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use benchrig_orchestrator::actors::{
    ClusterBuilderMessage, DispatcherArguments, DispatcherMessage, spawn_dispatcher,
};
use benchrig_orchestrator::{
    BuildFlavor, EngineSettings, FailureSignal, HostAvailability, HostEndpoint, nodes_by_host,
};

use common::{
    Harness, QUIET, RecordingToolkit, WAIT, endpoint, init_tracing, ip, next, probe, run_context,
};

const LOCAL: &str = "127.0.0.1";
const REMOTE: &str = "10.0.0.5";

struct Fixture {
    harness: Harness,
    dispatcher: ActorRef<DispatcherMessage>,
    handle: JoinHandle<()>,
    replies: mpsc::UnboundedReceiver<ClusterBuilderMessage>,
    supervisor: ActorRef<ClusterBuilderMessage>,
}

impl Fixture {
    async fn new(settings: EngineSettings) -> Self {
        init_tracing();
        let harness = Harness::with_toolkit(RecordingToolkit::new());
        let args = DispatcherArguments {
            collaborators: harness.collaborators(),
            settings,
        };
        let (dispatcher, handle) = spawn_dispatcher(args).await.unwrap();
        let (supervisor, replies) = probe::<ClusterBuilderMessage>().await;
        Self {
            harness,
            dispatcher,
            handle,
            replies,
            supervisor,
        }
    }

    fn start(&self, hosts: &[HostEndpoint]) {
        let specs: Vec<String> = hosts.iter().map(ToString::to_string).collect();
        let specs: Vec<&str> = specs.iter().map(String::as_str).collect();
        self.dispatcher
            .send_message(DispatcherMessage::StartEngine {
                ctx: Box::new(run_context(&specs, BuildFlavor::Distribution)),
                assignment: nodes_by_host(hosts),
                reply_to: self.supervisor.clone(),
            })
            .unwrap();
    }

    /// Collect the hosts of `count` NodesStarted replies.
    async fn expect_started(&mut self, count: usize) -> Vec<HostEndpoint> {
        let mut hosts = Vec::new();
        while hosts.len() < count {
            match next(&mut self.replies, WAIT).await {
                Some(ClusterBuilderMessage::NodesStarted { host, .. }) => hosts.push(host),
                other => panic!("expected NodesStarted, got {other:?}"),
            }
        }
        hosts.sort();
        hosts
    }

    async fn expect_failure(&mut self) -> FailureSignal {
        match next(&mut self.replies, WAIT).await {
            Some(ClusterBuilderMessage::BenchmarkFailure { failure, worker }) => {
                assert_eq!(worker, None);
                failure
            }
            other => panic!("expected BenchmarkFailure, got {other:?}"),
        }
    }

    async fn shutdown(self) {
        self.dispatcher.stop(None);
        let _ = tokio::time::timeout(WAIT, self.handle).await;
    }
}

/// One remote and one local host, in sorted order.
fn mixed_hosts() -> Vec<HostEndpoint> {
    vec![endpoint(REMOTE, 39200), endpoint(LOCAL, 39200)]
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAN-OUT BEHAVIORS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn given_local_hosts_only_when_start_engine_then_nodes_start_without_membership_wait() {
    // Given: A dispatcher and two loopback hosts
    let mut fixture = Fixture::new(EngineSettings::for_testing()).await;

    // When: The engine is started
    fixture.start(&[endpoint("127.0.0.1", 39200), endpoint("127.0.0.2", 39200)]);

    // Then: Both hosts report started and no subscription was taken
    let started = fixture.expect_started(2).await;
    assert_eq!(
        started,
        vec![endpoint("127.0.0.1", 39200), endpoint("127.0.0.2", 39200)]
    );
    assert_eq!(fixture.harness.feed.subscriptions_created(), 0);

    fixture.shutdown().await;
}

#[tokio::test]
async fn given_remote_host_when_it_becomes_reachable_then_all_hosts_start_together() {
    // Given: One local and one remote host
    let mut fixture = Fixture::new(EngineSettings::for_testing()).await;
    fixture.start(&mixed_hosts());
    fixture.harness.wait_for_subscription().await;

    // Then: Even the local host waits for the remote one
    assert!(next(&mut fixture.replies, QUIET).await.is_none());
    assert_eq!(fixture.harness.toolkit.launches(), 0);

    // When: The remote host joins
    fixture.harness.feed.publish(HostAvailability::reachable(ip(REMOTE)));

    // Then: Both hosts start, each exactly once
    let started = fixture.expect_started(2).await;
    assert_eq!(started, mixed_hosts());
    assert_eq!(fixture.harness.toolkit.launches(), 2);

    // And: A repeated announcement changes nothing
    fixture.harness.feed.publish(HostAvailability::reachable(ip(REMOTE)));
    assert!(next(&mut fixture.replies, QUIET).await.is_none());
    assert_eq!(fixture.harness.toolkit.launches(), 2);

    fixture.shutdown().await;
}

#[tokio::test]
async fn given_remote_host_already_reachable_when_start_engine_then_no_event_is_needed() {
    // Given: The remote host joined before the run
    let mut fixture = Fixture::new(EngineSettings::for_testing()).await;
    fixture.harness.feed.publish(HostAvailability::reachable(ip(REMOTE)));

    // When: The engine is started
    fixture.start(&mixed_hosts());

    // Then: Both hosts start from the membership snapshot
    let started = fixture.expect_started(2).await;
    assert_eq!(started, mixed_hosts());
    assert_eq!(fixture.harness.feed.subscriptions_created(), 1);

    fixture.shutdown().await;
}

#[tokio::test]
async fn given_unrelated_host_leaves_when_waiting_then_dispatch_continues() {
    // Given: A dispatcher waiting for the remote host
    let mut fixture = Fixture::new(EngineSettings::for_testing()).await;
    fixture.start(&mixed_hosts());
    fixture.harness.wait_for_subscription().await;

    // When: A host nobody waits for leaves, then the remote host joins
    fixture
        .harness
        .feed
        .publish(HostAvailability::unreachable(ip("10.0.0.77")));
    fixture.harness.feed.publish(HostAvailability::reachable(ip(REMOTE)));

    // Then: Startup proceeds normally
    let started = fixture.expect_started(2).await;
    assert_eq!(started.len(), 2);

    fixture.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAILURE BEHAVIORS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn given_awaited_host_when_it_becomes_unreachable_then_premature_shutdown_failure() {
    // Given: A dispatcher waiting for the remote host
    let mut fixture = Fixture::new(EngineSettings::for_testing()).await;
    fixture.start(&mixed_hosts());
    fixture.harness.wait_for_subscription().await;

    // When: The awaited host leaves
    fixture
        .harness
        .feed
        .publish(HostAvailability::unreachable(ip(REMOTE)));

    // Then: The supervisor is told the remote node shut down prematurely
    let failure = fixture.expect_failure().await;
    assert_eq!(
        failure.message,
        "Remote benchrig node [10.0.0.5] has been shutdown prematurely."
    );

    // And: Nothing starts, even if the host comes back
    fixture.harness.feed.publish(HostAvailability::reachable(ip(REMOTE)));
    assert!(next(&mut fixture.replies, QUIET).await.is_none());
    assert_eq!(fixture.harness.toolkit.launches(), 0);

    fixture.shutdown().await;
}

#[tokio::test]
async fn given_wait_timeout_when_remote_host_never_joins_then_run_fails() {
    // Given: A bounded wait for remote hosts
    let settings = EngineSettings::for_testing().with_remote_wait_timeout(Duration::from_millis(100));
    let mut fixture = Fixture::new(settings).await;

    // When: The remote host never joins
    fixture.start(&mixed_hosts());

    // Then: The run fails naming the missing host
    let failure = fixture.expect_failure().await;
    assert!(failure.message.contains("10.0.0.5"), "{failure}");
    assert!(failure.message.contains("did not become reachable"), "{failure}");
    assert_eq!(fixture.harness.toolkit.launches(), 0);

    fixture.shutdown().await;
}

#[tokio::test]
async fn given_started_dispatch_when_failure_arrives_then_it_is_forwarded_upward() {
    // Given: A dispatcher that has been started
    let mut fixture = Fixture::new(EngineSettings::for_testing()).await;
    fixture.start(&[endpoint(LOCAL, 39200)]);
    fixture.expect_started(1).await;

    // When: A failure is reported to it
    fixture
        .dispatcher
        .send_message(DispatcherMessage::BenchmarkFailure(FailureSignal::new(
            "Load driver crashed",
        )))
        .unwrap();

    // Then: The supervisor receives it unchanged
    let failure = fixture.expect_failure().await;
    assert_eq!(failure, FailureSignal::new("Load driver crashed"));

    fixture.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEARDOWN BEHAVIORS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn given_started_hosts_when_dispatcher_stops_then_it_waits_for_node_builders() {
    // Given: Two started local hosts
    let mut fixture = Fixture::new(EngineSettings::for_testing()).await;
    fixture.start(&[endpoint("127.0.0.1", 39200), endpoint("127.0.0.2", 39200)]);
    fixture.expect_started(2).await;
    let toolkit = fixture.harness.toolkit.clone();

    // When: The dispatcher stops
    fixture.dispatcher.stop(None);
    tokio::time::timeout(WAIT, fixture.handle)
        .await
        .unwrap()
        .unwrap();

    // Then: Every node builder stopped its nodes first
    assert_eq!(toolkit.stops(), 2);
    assert_eq!(toolkit.cleanups().len(), 2);

    // And: The supervisor learned about each exit
    let mut exits = 0;
    while let Some(message) = next(&mut fixture.replies, QUIET).await {
        if matches!(message, ClusterBuilderMessage::ChildExited(_)) {
            exits += 1;
        }
    }
    assert_eq!(exits, 2);
}
