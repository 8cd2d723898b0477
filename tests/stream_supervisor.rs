use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use manta_edge::status::StatusObserver;
use manta_edge::{
    ConnectionSupervisor, Frame, FrameRead, LinkJoiner, NoLink, NullObserver, SupervisorConfig,
    VideoSource,
};

/// Knobs shared between a test and its `ScriptedSource`.
#[derive(Default)]
struct Script {
    open_failures_left: AtomicUsize,
    stalled: AtomicBool,
    fail_next_read: AtomicBool,
    opens: AtomicUsize,
}

struct ScriptedSource {
    script: Arc<Script>,
    opened: bool,
    counter: u8,
}

impl ScriptedSource {
    fn boxed(script: Arc<Script>) -> Box<dyn VideoSource> {
        Box::new(Self {
            script,
            opened: false,
            counter: 0,
        })
    }
}

impl VideoSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted://camera".to_string()
    }

    fn open(&mut self) -> Result<()> {
        let left = self.script.open_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.script.open_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("camera unreachable"));
        }
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        self.opened = true;
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.opened {
            return Err(anyhow!("not opened"));
        }
        if self.script.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("socket reset"));
        }
        if self.script.stalled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.counter = self.counter.wrapping_add(1);
        Ok(Some(Frame::from_rgb(vec![self.counter; 2 * 2 * 3], 2, 2)?))
    }

    fn release(&mut self) {
        self.opened = false;
    }
}

#[derive(Default)]
struct EventRecorder {
    connected: Mutex<Vec<u64>>,
    lost: AtomicUsize,
    stale: AtomicUsize,
}

impl StatusObserver for EventRecorder {
    fn stream_connected(&self, _source: &str, attempt: u64) {
        self.connected.lock().unwrap().push(attempt);
    }

    fn stream_lost(&self, _source: &str, _reason: &str) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_stale(&self, _source: &str, _age: Duration) {
        self.stale.fetch_add(1, Ordering::SeqCst);
    }
}

/// A network step that never succeeds.
#[derive(Default)]
struct BrokenLink {
    joins: AtomicUsize,
}

impl LinkJoiner for BrokenLink {
    fn name(&self) -> &str {
        "broken"
    }

    fn join(&self) -> Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("radio off"))
    }
}

fn quick_config() -> SupervisorConfig {
    SupervisorConfig {
        connection_timeout: Duration::from_millis(60),
        retry_interval: Duration::from_millis(10),
        staleness_timeout: Duration::from_millis(150),
        first_frame_poll: Duration::from_millis(10),
        check_interval: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(2),
    }
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
fn reconnects_after_failed_opens() {
    let script = Arc::new(Script::default());
    script.open_failures_left.store(3, Ordering::SeqCst);
    let observer = Arc::new(EventRecorder::default());

    let supervisor = ConnectionSupervisor::new(
        quick_config(),
        ScriptedSource::boxed(script.clone()),
        Arc::new(NoLink),
        observer.clone(),
    )
    .unwrap();
    supervisor.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || supervisor.is_connected()));
    assert!(matches!(supervisor.read(), FrameRead::Live(_)));

    let stats = supervisor.stats();
    assert_eq!(stats.connect_attempts, 4);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(*observer.connected.lock().unwrap(), vec![4]);

    supervisor.stop();
    assert!(!supervisor.is_connected());
}

#[test]
fn stale_stream_is_torn_down_and_reopened() {
    let script = Arc::new(Script::default());
    let observer = Arc::new(EventRecorder::default());
    let supervisor = ConnectionSupervisor::new(
        quick_config(),
        ScriptedSource::boxed(script.clone()),
        Arc::new(NoLink),
        observer.clone(),
    )
    .unwrap();
    supervisor.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || supervisor.is_connected()));

    // The camera keeps the connection open but stops sending frames.
    script.stalled.store(true, Ordering::SeqCst);
    let _ = supervisor.read();
    assert!(wait_until(Duration::from_secs(5), || supervisor.stats().stale_drops >= 1));
    assert!(observer.stale.load(Ordering::SeqCst) >= 1);

    // Reconnect attempts fail while no first frame arrives.
    std::thread::sleep(Duration::from_millis(100));
    assert!(!supervisor.is_connected());

    script.stalled.store(false, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || supervisor.is_connected()));

    let stats = supervisor.stats();
    assert!(stats.reconnects >= 1);
    assert!(stats.drops >= 1);
    assert!(script.opens.load(Ordering::SeqCst) >= 2);
    assert!(supervisor.read().is_ok());

    supervisor.stop();
}

#[test]
fn cached_frame_bridges_short_gaps_only() {
    let script = Arc::new(Script::default());
    let supervisor = ConnectionSupervisor::new(
        quick_config(),
        ScriptedSource::boxed(script.clone()),
        Arc::new(NoLink),
        Arc::new(NullObserver),
    )
    .unwrap();
    supervisor.connect().unwrap();

    let live = match supervisor.read() {
        FrameRead::Live(frame) => frame,
        other => panic!("expected a live frame, got {:?}", other),
    };

    script.stalled.store(true, Ordering::SeqCst);
    match supervisor.read() {
        FrameRead::Cached(frame) => assert_eq!(frame.pixels(), live.pixels()),
        other => panic!("expected the cached frame, got {:?}", other),
    }

    std::thread::sleep(Duration::from_millis(200));
    assert!(matches!(supervisor.read(), FrameRead::Unavailable));
    supervisor.stop();
}

#[test]
fn read_error_marks_stream_lost_and_recovers_inline() {
    let script = Arc::new(Script::default());
    let observer = Arc::new(EventRecorder::default());
    let supervisor = ConnectionSupervisor::new(
        quick_config(),
        ScriptedSource::boxed(script.clone()),
        Arc::new(NoLink),
        observer.clone(),
    )
    .unwrap();
    assert!(matches!(supervisor.read(), FrameRead::Live(_)));

    script.fail_next_read.store(true, Ordering::SeqCst);
    // The error is absorbed; the last frame is still fresh.
    assert!(matches!(supervisor.read(), FrameRead::Cached(_)));
    assert!(!supervisor.is_connected());
    assert_eq!(observer.lost.load(Ordering::SeqCst), 1);

    // No background loop, so the next read reconnects on the caller's thread.
    assert!(supervisor.read().is_ok());
    assert!(supervisor.is_connected());
    let stats = supervisor.stats();
    assert_eq!(stats.drops, 1);
    assert_eq!(stats.stale_drops, 0);
    assert_eq!(stats.reconnects, 1);
    supervisor.stop();
}

#[test]
fn failing_link_step_does_not_block_connecting() {
    let script = Arc::new(Script::default());
    let link = Arc::new(BrokenLink::default());
    let supervisor = ConnectionSupervisor::new(
        quick_config(),
        ScriptedSource::boxed(script.clone()),
        link.clone(),
        Arc::new(NullObserver),
    )
    .unwrap();
    supervisor.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || supervisor.is_connected()));
    assert!(matches!(supervisor.read(), FrameRead::Live(_)));
    assert!(link.joins.load(Ordering::SeqCst) >= 1);
    assert_eq!(supervisor.stats().connect_attempts, 1);

    supervisor.stop();
}
