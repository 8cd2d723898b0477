use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use manta_edge::delivery::{DirectorySink, FileUpload};
use manta_edge::status::{Mode, StatusObserver};
use manta_edge::{
    BatchSink, DeliveryQueue, EdgeError, FlushOutcome, NullObserver, OutboundRecord, QueueConfig,
    UnavailableSink,
};

/// Fails the first `failures` deliveries, then accepts everything.
struct FlakySink {
    failures: usize,
    attempts: AtomicUsize,
    accepted: Mutex<Vec<String>>,
}

impl FlakySink {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
        }
    }

    fn accepted(&self) -> Vec<String> {
        self.accepted.lock().unwrap().clone()
    }
}

impl BatchSink<OutboundRecord> for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    fn deliver(&self, batch: &[OutboundRecord]) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(EdgeError::transient("connection refused"));
        }
        let mut accepted = self.accepted.lock().unwrap();
        accepted.extend(batch.iter().map(|r| r.key.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct ModeRecorder {
    modes: Mutex<Vec<Mode>>,
}

impl StatusObserver for ModeRecorder {
    fn mode_changed(&self, _component: &str, mode: Mode) {
        self.modes.lock().unwrap().push(mode);
    }
}

fn fast_config(batch_size: usize) -> QueueConfig {
    QueueConfig {
        batch_size,
        retry_interval: Duration::from_millis(20),
        pop_timeout: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(2),
        flush_timeout: Duration::from_secs(2),
        ..QueueConfig::named("test-records")
    }
}

fn records(n: usize) -> Vec<OutboundRecord> {
    (0..n)
        .map(|i| OutboundRecord::with_key(format!("rec-{:03}", i), serde_json::json!({ "i": i })))
        .collect()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn flush_while_workers_run_drains_without_waiting_out_the_timeout() {
    let sink = Arc::new(FlakySink::new(0));
    let config = QueueConfig {
        flush_timeout: Duration::from_secs(3),
        ..fast_config(2)
    };
    let queue: DeliveryQueue<OutboundRecord> =
        DeliveryQueue::start(config, sink.clone(), Arc::new(NullObserver)).unwrap();
    assert_eq!(queue.mode(), Mode::Online);

    let started = Instant::now();
    assert_eq!(queue.flush(), FlushOutcome::Drained);
    assert!(started.elapsed() < Duration::from_secs(1), "idle flush took {:?}", started.elapsed());

    let input = records(5);
    for record in input.clone() {
        queue.enqueue(record);
    }
    let started = Instant::now();
    assert_eq!(queue.flush(), FlushOutcome::Drained);
    assert!(started.elapsed() < Duration::from_secs(1), "flush took {:?}", started.elapsed());

    let expected: Vec<String> = input.iter().map(|r| r.key.clone()).collect();
    assert_eq!(sink.accepted(), expected);
    assert_eq!(queue.pending_len(), 0);
    assert_eq!(queue.stats().in_flight, 0);
    assert!(!queue.is_stopped());
    queue.stop();
}

#[test]
fn retries_until_delivered_exactly_once_in_order() {
    let sink = Arc::new(FlakySink::new(2));
    let observer = Arc::new(ModeRecorder::default());
    let queue: DeliveryQueue<OutboundRecord> =
        DeliveryQueue::start(fast_config(4), sink.clone(), observer.clone()).unwrap();

    let input = records(10);
    for record in input.clone() {
        queue.enqueue(record);
    }

    assert!(wait_until(Duration::from_secs(5), || sink.accepted().len() == 10));
    queue.stop();

    let expected: Vec<String> = input.iter().map(|r| r.key.clone()).collect();
    assert_eq!(sink.accepted(), expected);
    assert_eq!(queue.pending_len(), 0);
    assert_eq!(queue.mode(), Mode::Online);

    let stats = queue.stats();
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.failed_attempts, 2);

    // Each failure turns the queue offline; each successful probe brings it back.
    let modes = observer.modes.lock().unwrap().clone();
    assert_eq!(
        modes,
        vec![Mode::Offline, Mode::Online, Mode::Offline, Mode::Online]
    );
}

#[test]
fn flush_with_dead_sink_returns_and_keeps_records() {
    let queue: DeliveryQueue<OutboundRecord> = DeliveryQueue::start(
        fast_config(3),
        Arc::new(UnavailableSink::new("no database configured")),
        Arc::new(NullObserver),
    )
    .unwrap();

    let input = records(5);
    for record in input.clone() {
        queue.enqueue(record);
    }

    let started = Instant::now();
    let outcome = queue.flush();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome, FlushOutcome::Offline { pending: 5 });
    assert_eq!(queue.snapshot(), input);

    // Still re-flushable.
    assert_eq!(queue.flush(), FlushOutcome::Offline { pending: 5 });
    queue.stop();
    assert_eq!(queue.pending_len(), 5);
}

#[test]
fn flush_drains_after_recovery() {
    let sink = Arc::new(FlakySink::new(1));
    let queue: DeliveryQueue<OutboundRecord> =
        DeliveryQueue::start(fast_config(10), sink.clone(), Arc::new(NullObserver)).unwrap();
    queue.stop();

    for record in records(3) {
        queue.enqueue(record);
    }
    assert_eq!(queue.flush(), FlushOutcome::Offline { pending: 3 });
    assert_eq!(queue.mode(), Mode::Offline);
    assert_eq!(queue.flush(), FlushOutcome::Drained);
    assert_eq!(sink.accepted().len(), 3);
    assert_eq!(queue.mode(), Mode::Online);
}

#[test]
fn enqueue_does_not_block_while_offline() {
    let queue: DeliveryQueue<OutboundRecord> = DeliveryQueue::start(
        fast_config(10),
        Arc::new(UnavailableSink::new("offline")),
        Arc::new(NullObserver),
    )
    .unwrap();
    let started = Instant::now();
    for record in records(1000) {
        queue.enqueue(record);
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(queue.pending_len(), 1000);
    queue.stop();
}

#[test]
fn stop_interrupts_retry_sleep() {
    let config = QueueConfig {
        retry_interval: Duration::from_secs(60),
        ..fast_config(10)
    };
    let queue: DeliveryQueue<OutboundRecord> = DeliveryQueue::start(
        config,
        Arc::new(UnavailableSink::new("offline")),
        Arc::new(NullObserver),
    )
    .unwrap();
    let started = Instant::now();
    queue.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(queue.is_stopped());
}

#[test]
fn missing_upload_file_is_dropped_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.jpg");
    std::fs::write(&present, b"jpeg").unwrap();
    let store = dir.path().join("store");

    let config = QueueConfig {
        batch_size: 1,
        workers: 2,
        ..fast_config(1)
    };
    let queue: DeliveryQueue<FileUpload> = DeliveryQueue::start(
        config,
        Arc::new(DirectorySink::new(&store)),
        Arc::new(NullObserver),
    )
    .unwrap();

    queue.enqueue(FileUpload::new(dir.path().join("missing.jpg"), "faces/a/missing.jpg"));
    queue.enqueue(FileUpload::new(&present, "faces/b/present.jpg"));

    assert!(wait_until(Duration::from_secs(5), || {
        let stats = queue.stats();
        stats.delivered + stats.dropped == 2
    }));
    queue.stop();

    let stats = queue.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.mode, Mode::Online);
    assert!(store.join("faces/b/present.jpg").exists());
}
