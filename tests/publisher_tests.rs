//! End-to-end transactional publisher scenarios against the mock log.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use logshard::config::CoreConfig;
use logshard::coordination::{
    HealthStatus, PublishError, PublisherDeps, TransactionalPublisher,
};
use logshard::log::ProducerError;
use logshard::log::mock::{MockImmediateProducer, MockLog, MockProducer, MockProducerFactory};
use logshard::metrics;
use logshard::state_store::InMemoryStateIndex;
use logshard::types::TopicPartition;

const PARTITION: u32 = 0;

struct TestPublisher {
    publisher: TransactionalPublisher,
    log: Arc<MockLog>,
    producer: Arc<MockProducer>,
    factory: Arc<MockProducerFactory>,
    flush_producer: Arc<MockImmediateProducer>,
    index: Arc<InMemoryStateIndex>,
    tp: TopicPartition,
}

impl TestPublisher {
    fn spawn() -> Self {
        let config = CoreConfig::default();
        let log = MockLog::new();
        let transactional_id = config.transactional_id(PARTITION);
        let producer = MockProducer::new(Arc::clone(&log), transactional_id.clone());
        let factory = MockProducerFactory::new(Arc::clone(&log), transactional_id);
        factory.prepare(Arc::clone(&producer));
        let flush_producer = MockImmediateProducer::new(Arc::clone(&log));
        let index = InMemoryStateIndex::new();

        let publisher = TransactionalPublisher::spawn(
            &config,
            PARTITION,
            PublisherDeps {
                producer_factory: factory.clone(),
                flush_producer: flush_producer.clone(),
                state_index: index.clone(),
            },
        );

        Self {
            publisher,
            log,
            producer,
            factory,
            flush_producer,
            index,
            tp: TopicPartition::new(config.state_topic.as_str(), PARTITION),
        }
    }

    /// Let the flush record land and feed its offset back through the
    /// projection cursor, bringing the publisher into processing.
    async fn recover_backlog(&self) {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let marker = self.flush_producer.last_sent().expect("flush record written");
        self.index.advance(&self.tp, marker.offset);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    async fn publish_value(&self, key: &str, value: &'static [u8]) -> Result<(), PublishError> {
        self.publisher
            .publish(
                key.to_string(),
                (key.to_string(), Some(Bytes::from_static(value))),
                vec![(key.to_string(), Bytes::from_static(value))],
            )
            .await
    }
}

#[tokio::test(start_paused = true)]
async fn startup_writes_flush_record_at_exact_partition() {
    let t = TestPublisher::spawn();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let marker = t.flush_producer.last_sent().expect("flush record");
    assert_eq!(marker.topic.as_ref(), "state");
    assert_eq!(marker.partition, PARTITION);
    assert!(marker.key.is_none());
}

#[tokio::test(start_paused = true)]
async fn publishes_buffer_until_backlog_recovered() {
    let t = TestPublisher::spawn();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let publisher = t.publisher.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish(
                "k".to_string(),
                ("k".to_string(), Some(Bytes::from_static(b"v"))),
                vec![],
            )
            .await
    });

    // Plenty of flush intervals pass, but nothing may enter a transaction
    // while the backlog is unrecovered.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!pending.is_finished());
    assert_eq!(t.producer.begin_calls.load(Ordering::SeqCst), 0);

    let marker = t.flush_producer.last_sent().unwrap();
    t.index.advance(&t.tp, marker.offset);

    let result = pending.await.unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(t.producer.commit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn flush_publishes_events_and_state_in_one_transaction() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;
    let committed_before = t.log.committed_records().len();

    t.publish_value("order-1", b"v1").await.unwrap();

    let committed = t.log.committed_records();
    assert_eq!(committed.len() - committed_before, 2);
    let topics: Vec<&str> = committed[committed_before..]
        .iter()
        .map(|r| r.topic.as_ref())
        .collect();
    assert_eq!(topics, vec!["events", "state"]);
    assert_eq!(t.producer.begin_calls.load(Ordering::SeqCst), 1);
    assert_eq!(t.producer.commit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn pending_writes_flush_fifo_in_one_batch() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    let (a, b, c) = tokio::join!(
        t.publish_value("a", b"va"),
        t.publish_value("b", b"vb"),
        t.publish_value("c", b"vc"),
    );
    assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));

    // One transaction carried all three writes, in arrival order.
    assert_eq!(t.producer.commit_calls.load(Ordering::SeqCst), 1);
    let state_keys: Vec<String> = t
        .log
        .committed_records()
        .iter()
        .filter(|r| r.topic.as_ref() == "state" && r.key.is_some())
        .map(|r| r.key.clone().unwrap())
        .collect();
    assert_eq!(state_keys, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn aborted_flush_is_invisible_and_surfaced_to_senders() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;
    let committed_before = t.log.committed_records().len();

    t.producer
        .fail_next_commit(ProducerError::Generic("broker hiccup".into()));
    let result = t.publish_value("k", b"v").await;
    assert!(matches!(result, Err(PublishError::Rejected(_))));

    // A consumer reading committed data sees none of the aborted flush.
    assert_eq!(t.log.committed_records().len(), committed_before);
    assert_eq!(t.producer.abort_calls.load(Ordering::SeqCst), 1);

    // The publisher stays alive; the retry commits whole.
    let result = t.publish_value("k", b"v").await;
    assert_eq!(result, Ok(()));
    assert_eq!(t.log.committed_records().len() - committed_before, 2);
}

#[tokio::test(start_paused = true)]
async fn fenced_commit_terminates_the_instance() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    t.producer.fail_next_commit(ProducerError::Fenced);
    let result = t.publish_value("k", b"v").await;
    assert_eq!(result, Err(PublishError::Fenced));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let health = t.publisher.health().await;
    assert_eq!(health.status, HealthStatus::Down);
    assert!(health.fenced);

    // The instance is gone; later publishes cannot succeed.
    let result = t.publish_value("k2", b"v").await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn fenced_init_terminates_without_retry() {
    let config = CoreConfig::default();
    let log = MockLog::new();
    let producer = MockProducer::new(Arc::clone(&log), config.transactional_id(PARTITION));
    producer.fail_next_init(ProducerError::Fenced);
    let factory = MockProducerFactory::new(Arc::clone(&log), config.transactional_id(PARTITION));
    factory.prepare(Arc::clone(&producer));
    let flush_producer = MockImmediateProducer::new(Arc::clone(&log));

    let publisher = TransactionalPublisher::spawn(
        &config,
        PARTITION,
        PublisherDeps {
            producer_factory: factory.clone(),
            flush_producer: flush_producer.clone(),
            state_index: InMemoryStateIndex::new(),
        },
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(producer.init_calls.load(Ordering::SeqCst), 1);
    assert!(flush_producer.last_sent().is_none());
    let health = publisher.health().await;
    assert!(health.fenced);
}

#[tokio::test(start_paused = true)]
async fn transient_init_error_retries_with_same_producer() {
    let config = CoreConfig::default();
    let log = MockLog::new();
    let producer = MockProducer::new(Arc::clone(&log), config.transactional_id(PARTITION));
    producer.fail_next_init(ProducerError::Generic("not ready".into()));
    let factory = MockProducerFactory::new(Arc::clone(&log), config.transactional_id(PARTITION));
    factory.prepare(Arc::clone(&producer));
    let flush_producer = MockImmediateProducer::new(Arc::clone(&log));

    let _publisher = TransactionalPublisher::spawn(
        &config,
        PARTITION,
        PublisherDeps {
            producer_factory: factory.clone(),
            flush_producer: flush_producer.clone(),
            state_index: InMemoryStateIndex::new(),
        },
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(producer.init_calls.load(Ordering::SeqCst), 2);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert!(flush_producer.last_sent().is_some());
}

#[tokio::test(start_paused = true)]
async fn fatal_init_error_rebuilds_the_producer() {
    let config = CoreConfig::default();
    let log = MockLog::new();
    let producer = MockProducer::new(Arc::clone(&log), config.transactional_id(PARTITION));
    producer.fail_next_init(ProducerError::Authorization("denied".into()));
    let factory = MockProducerFactory::new(Arc::clone(&log), config.transactional_id(PARTITION));
    factory.prepare(Arc::clone(&producer));
    let flush_producer = MockImmediateProducer::new(Arc::clone(&log));

    let _publisher = TransactionalPublisher::spawn(
        &config,
        PARTITION,
        PublisherDeps {
            producer_factory: factory.clone(),
            flush_producer: flush_producer.clone(),
            state_index: InMemoryStateIndex::new(),
        },
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    // The poisoned producer was abandoned and a fresh one finished init.
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert!(flush_producer.last_sent().is_some());
}

#[tokio::test(start_paused = true)]
async fn is_state_current_resolves_on_retirement() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    t.log.set_next_offset("state", PARTITION, 42);
    t.publisher
        .publish(
            "k".to_string(),
            ("k".to_string(), Some(Bytes::from_static(b"v"))),
            vec![],
        )
        .await
        .unwrap();

    let publisher = t.publisher.clone();
    let query = tokio::spawn(async move {
        publisher
            .is_state_current("k".to_string(), Instant::now() + Duration::from_secs(5))
            .await
    });

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!query.is_finished(), "must wait for the cursor to pass 42");

    t.index.advance(&t.tp, 50);
    assert!(query.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn is_state_current_times_out_as_false() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;
    let not_current_before = metrics::STATE_CURRENT_RESULTS
        .with_label_values(&["not_current"])
        .get();

    t.log.set_next_offset("state", PARTITION, 42);
    t.publisher
        .publish(
            "k".to_string(),
            ("k".to_string(), Some(Bytes::from_static(b"v"))),
            vec![],
        )
        .await
        .unwrap();

    // The cursor never reaches 42.
    let resolved = t
        .publisher
        .is_state_current("k".to_string(), Instant::now() + Duration::from_millis(100))
        .await;
    assert!(!resolved);

    let not_current_after = metrics::STATE_CURRENT_RESULTS
        .with_label_values(&["not_current"])
        .get();
    assert!(not_current_after >= not_current_before + 1);
}

#[tokio::test(start_paused = true)]
async fn is_state_current_with_no_outstanding_write_is_immediate() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    let resolved = t
        .publisher
        .is_state_current(
            "untouched".to_string(),
            Instant::now() + Duration::from_secs(1),
        )
        .await;
    assert!(resolved);
}

#[tokio::test(start_paused = true)]
async fn superseded_write_retires_with_the_newer_offset() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    t.log.set_next_offset("state", PARTITION, 10);
    t.publish_value("k", b"v1").await.unwrap();
    t.log.set_next_offset("state", PARTITION, 20);
    t.publish_value("k", b"v2").await.unwrap();

    // Cursor past the first write but not the second: still in flight.
    t.index.advance(&t.tp, 15);
    let resolved = t
        .publisher
        .is_state_current("k".to_string(), Instant::now() + Duration::from_millis(300))
        .await;
    assert!(!resolved);

    // Cursor past the superseding write: current.
    t.index.advance(&t.tp, 25);
    let resolved = t
        .publisher
        .is_state_current("k".to_string(), Instant::now() + Duration::from_secs(5))
        .await;
    assert!(resolved);
}

#[tokio::test(start_paused = true)]
async fn health_reports_counters() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    t.log.set_next_offset("state", PARTITION, 42);
    t.publish_value("k", b"v").await.unwrap();
    let publisher = t.publisher.clone();
    let _query = tokio::spawn(async move {
        publisher
            .is_state_current("k".to_string(), Instant::now() + Duration::from_secs(60))
            .await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let health = t.publisher.health().await;
    assert_eq!(health.status, HealthStatus::Up);
    assert!(!health.fenced);
    assert_eq!(health.in_flight, 1);
    assert_eq!(health.pending_inits, 1);
    assert_eq!(health.pending_writes, 0);
    assert_eq!(health.phase, "processing");
    assert!(health.current_txn_ms.is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_fails_outstanding_work() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    t.publisher.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = t.publish_value("k", b"v").await;
    assert_eq!(result, Err(PublishError::Stopped));
    assert_eq!(t.factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn tombstone_state_is_published_with_null_value() {
    let t = TestPublisher::spawn();
    t.recover_backlog().await;

    t.publisher
        .publish("k".to_string(), ("k".to_string(), None), vec![])
        .await
        .unwrap();

    let state_records: Vec<_> = t
        .log
        .committed_records()
        .iter()
        .filter(|r| r.topic.as_ref() == "state" && r.key.as_deref() == Some("k"))
        .cloned()
        .collect();
    assert_eq!(state_records.len(), 1);
}
