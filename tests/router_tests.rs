//! End-to-end shard router scenarios against mock regions, transport and
//! partition tracker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use logshard::coordination::{
    AssignmentFeed, DeadLetter, DeadLetterReason, HealthStatus, PartitionAssignments, RegionKind,
    RegionMessage, RegionSink, RemoteSelector, RemoteTransport, RouterDeps, RouterSettings,
    ShardRouter, TransportError,
};
use logshard::log::mock::MockPartitioner;
use logshard::types::{HostPort, TopicPartition};

const TOPIC: &str = "state";

fn node_a() -> HostPort {
    HostPort::new("localhost", 7000)
}

fn node_b() -> HostPort {
    HostPort::new("peer", 7000)
}

fn assignments(entries: &[(HostPort, &[u32])]) -> PartitionAssignments {
    let map: BTreeMap<HostPort, BTreeSet<TopicPartition>> = entries
        .iter()
        .map(|(host, partitions)| {
            (
                host.clone(),
                partitions
                    .iter()
                    .map(|p| TopicPartition::new(TOPIC, *p))
                    .collect(),
            )
        })
        .collect();
    PartitionAssignments::new(TOPIC, map)
}

/// Transport that answers remote forwards itself and records them.
#[derive(Default)]
struct RecordingTransport {
    forwards: Mutex<Vec<(HostPort, u32, String)>>,
}

#[async_trait]
impl RemoteTransport<String, String> for RecordingTransport {
    async fn forward(
        &self,
        selector: &RemoteSelector,
        partition: u32,
        message: String,
    ) -> Result<String, TransportError> {
        self.forwards
            .lock()
            .unwrap()
            .push((selector.peer.clone(), partition, message.clone()));
        Ok(format!("remote({partition}, {message})"))
    }
}

struct TestRouter {
    router: ShardRouter<String, String>,
    feed: Arc<AssignmentFeed>,
    partitioner: Arc<MockPartitioner>,
    transport: Arc<RecordingTransport>,
    created: Arc<Mutex<Vec<u32>>>,
    dead_rx: mpsc::Receiver<DeadLetter<String, String>>,
}

impl TestRouter {
    fn spawn(dr_standby: bool) -> Self {
        let feed = Arc::new(AssignmentFeed::new());
        let partitioner = MockPartitioner::new();
        let transport = Arc::new(RecordingTransport::default());
        let created = Arc::new(Mutex::new(Vec::new()));
        let (dead_tx, dead_rx) = mpsc::channel(16);

        // Regions reply with their command wrapped as `(partition, body)`.
        // A command of "die" makes the region terminate right after
        // replying.
        let factory_created = Arc::clone(&created);
        let factory = move |partition: u32| -> RegionSink<String, String> {
            factory_created.lock().unwrap().push(partition);
            let (tx, mut rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    match msg {
                        RegionMessage::Command {
                            partition,
                            message,
                            reply,
                        } => {
                            let dying = message == "die";
                            let _ = reply.send(format!("({partition}, {message})"));
                            if dying {
                                break;
                            }
                        }
                        RegionMessage::HealthProbe { reply } => {
                            let _ = reply.send(true);
                        }
                        RegionMessage::Stop => break,
                    }
                }
            });
            tx
        };

        let extractor = |command: &String| {
            if command.starts_with("unroutable") {
                None
            } else {
                Some(command.clone())
            }
        };

        let router = ShardRouter::spawn(
            RouterSettings::new(node_a(), TOPIC).with_dr_standby(dr_standby),
            RouterDeps {
                partitioner: partitioner.clone(),
                extractor: Arc::new(extractor),
                region_factory: Arc::new(factory),
                transport: Arc::clone(&transport) as Arc<dyn RemoteTransport<String, String>>,
                tracker: feed.clone(),
                dead_letters: Some(dead_tx),
            },
        );

        Self {
            router,
            feed,
            partitioner,
            transport,
            created,
            dead_rx,
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn rebalance_creates_region_for_newly_owned_partition() {
    let mut t = TestRouter::spawn(false);
    t.partitioner.assign("partition2", 2);

    t.feed
        .publish(assignments(&[(node_a(), &[0, 1]), (node_b(), &[2])]));
    t.settle().await;
    // Initialization pre-warms the partitions owned right now.
    assert_eq!(t.created.lock().unwrap().clone(), vec![0, 1]);

    t.feed
        .publish(assignments(&[(node_a(), &[0, 1, 2]), (node_b(), &[])]));
    t.settle().await;

    let reply = t
        .router
        .ask("partition2".to_string(), Duration::from_secs(5))
        .await
        .expect("routed reply");
    assert_eq!(reply, "(2, partition2)");

    assert!(t.created.lock().unwrap().contains(&2));
    let map = t.router.region_map().await.unwrap();
    assert_eq!(map.get(&2), Some(&RegionKind::Local));
}

#[tokio::test(start_paused = true)]
async fn commands_before_first_assignments_are_stashed_and_replayed() {
    let mut t = TestRouter::spawn(false);
    t.partitioner.assign("partition0", 0);

    let router = t.router.clone();
    let pending =
        tokio::spawn(
            async move { router.ask("partition0".to_string(), Duration::from_secs(30)).await },
        );
    t.settle().await;
    assert!(!pending.is_finished());

    t.feed
        .publish(assignments(&[(node_a(), &[0, 1]), (node_b(), &[2])]));

    let reply = pending.await.unwrap().expect("stashed command replayed");
    assert_eq!(reply, "(0, partition0)");
}

#[tokio::test(start_paused = true)]
async fn unroutable_message_is_dead_lettered_with_original_preserved() {
    let mut t = TestRouter::spawn(false);
    t.feed
        .publish(assignments(&[(node_a(), &[0]), (node_b(), &[1])]));
    t.settle().await;

    let _receipt = t
        .router
        .route("unroutable-thing".to_string())
        .await
        .expect("enqueued");

    let dead = t.dead_rx.recv().await.expect("dead letter");
    assert_eq!(dead.message, "unroutable-thing");
    assert_eq!(dead.reason, DeadLetterReason::ExtractionFailed);
}

#[tokio::test(start_paused = true)]
async fn unknown_partition_is_dead_lettered() {
    let mut t = TestRouter::spawn(false);
    // "orphan" extracts fine but the partitioner knows nothing about it.
    t.feed.publish(assignments(&[(node_a(), &[0])]));
    t.settle().await;

    let _receipt = t.router.route("orphan".to_string()).await.unwrap();
    let dead = t.dead_rx.recv().await.expect("dead letter");
    assert_eq!(dead.reason, DeadLetterReason::NoPartition);
}

#[tokio::test(start_paused = true)]
async fn unassigned_partition_is_dead_lettered() {
    let mut t = TestRouter::spawn(false);
    t.partitioner.assign("partition9", 9);
    t.feed.publish(assignments(&[(node_a(), &[0])]));
    t.settle().await;

    let _receipt = t.router.route("partition9".to_string()).await.unwrap();
    let dead = t.dead_rx.recv().await.expect("dead letter");
    assert_eq!(dead.reason, DeadLetterReason::NoAssignment);
}

#[tokio::test(start_paused = true)]
async fn commands_for_peer_partitions_are_forwarded() {
    let mut t = TestRouter::spawn(false);
    t.partitioner.assign("partition2", 2);
    t.feed
        .publish(assignments(&[(node_a(), &[0, 1]), (node_b(), &[2])]));
    t.settle().await;

    let reply = t
        .router
        .ask("partition2".to_string(), Duration::from_secs(5))
        .await
        .expect("forwarded reply");
    assert_eq!(reply, "remote(2, partition2)");

    let forwards = t.transport.forwards.lock().unwrap().clone();
    assert_eq!(forwards, vec![(node_b(), 2, "partition2".to_string())]);

    let map = t.router.region_map().await.unwrap();
    assert_eq!(map.get(&2), Some(&RegionKind::Remote(node_b())));
}

#[tokio::test(start_paused = true)]
async fn revoked_partition_moves_to_remote_routing() {
    let mut t = TestRouter::spawn(false);
    t.partitioner.assign("partition0", 0);
    t.feed.publish(assignments(&[(node_a(), &[0])]));
    t.settle().await;

    let reply = t
        .router
        .ask("partition0".to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, "(0, partition0)");

    // Partition 0 moves to the peer.
    t.feed.publish(assignments(&[(node_b(), &[0])]));
    t.settle().await;

    let map = t.router.region_map().await.unwrap();
    assert!(!map.contains_key(&0), "revoked region must be dropped");

    let reply = t
        .router
        .ask("partition0".to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, "remote(0, partition0)");
}

#[tokio::test(start_paused = true)]
async fn regions_stay_subset_of_assignments() {
    let mut t = TestRouter::spawn(false);
    for p in 0..4 {
        t.partitioner.assign(format!("partition{p}"), p);
    }
    t.feed
        .publish(assignments(&[(node_a(), &[0, 1, 2]), (node_b(), &[3])]));
    t.settle().await;
    let _ = t
        .router
        .ask("partition3".to_string(), Duration::from_secs(5))
        .await;

    t.feed
        .publish(assignments(&[(node_a(), &[1]), (node_b(), &[2])]));
    t.settle().await;

    let map = t.router.region_map().await.unwrap();
    for partition in map.keys() {
        assert!(
            [1u32, 2].contains(partition),
            "region {partition} outlived its assignment"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn standby_defers_regions_until_first_command() {
    let mut t = TestRouter::spawn(true);
    t.partitioner.assign("partition0", 0);
    t.feed.publish(assignments(&[(node_a(), &[0, 1])]));
    t.settle().await;

    assert!(
        t.created.lock().unwrap().is_empty(),
        "standby must not pre-create regions"
    );

    let reply = t
        .router
        .ask("partition0".to_string(), Duration::from_secs(5))
        .await
        .expect("standby flip delivers the command");
    assert_eq!(reply, "(0, partition0)");

    // The flip pre-warms every owned partition.
    let mut created = t.created.lock().unwrap().clone();
    created.sort_unstable();
    assert_eq!(created, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn terminated_region_is_recreated_on_next_command() {
    let mut t = TestRouter::spawn(false);
    t.partitioner.assign("die", 0);
    t.partitioner.assign("partition0", 0);
    t.feed.publish(assignments(&[(node_a(), &[0])]));
    t.settle().await;

    let reply = t
        .router
        .ask("die".to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, "(0, die)");
    t.settle().await;

    let reply = t
        .router
        .ask("partition0".to_string(), Duration::from_secs(5))
        .await
        .expect("region recreated after termination");
    assert_eq!(reply, "(0, partition0)");

    let creations = t
        .created
        .lock()
        .unwrap()
        .iter()
        .filter(|p| **p == 0)
        .count();
    assert!(creations >= 2, "expected recreation, saw {creations}");
}

#[tokio::test(start_paused = true)]
async fn health_reflects_tracker_and_regions() {
    let mut t = TestRouter::spawn(false);

    let health = t.router.health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Down);
    assert!(!health.tracker_up);

    t.partitioner.assign("partition0", 0);
    t.feed.publish(assignments(&[(node_a(), &[0])]));
    t.settle().await;

    let health = t.router.health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Up);
    assert!(health.tracker_up);
    assert_eq!(health.local_regions, 1);
}

#[tokio::test(start_paused = true)]
async fn stop_signals_local_regions() {
    let mut t = TestRouter::spawn(false);
    t.partitioner.assign("partition0", 0);
    t.feed.publish(assignments(&[(node_a(), &[0])]));
    t.settle().await;

    t.router.stop().await;
    t.settle().await;

    assert!(matches!(
        t.router.ask("partition0".to_string(), Duration::from_secs(1)).await,
        Err(_)
    ));
}
