//! Resilient batched delivery.
//!
//! `DeliveryQueue<T>` accepts items from the capture path without blocking on
//! network I/O and drains them to a [`BatchSink`] from background workers.
//!
//! Worker protocol:
//! 1. Wait up to `pop_timeout` for items, then pop up to `batch_size`.
//! 2. Hand the whole batch to the sink in one call.
//! 3. On success the queue is ONLINE and the items are released.
//! 4. On a transient failure the batch goes back to the front of the queue in
//!    its original order and the queue turns OFFLINE.
//! 5. On a permanent failure the batch is dropped with a warning.
//! 6. While OFFLINE a worker sleeps `retry_interval`, probes the sink, and
//!    resumes delivering once the probe succeeds.
//!
//! Steps 1-5 run under a shared gate that is only taken once items are known
//! to be waiting. `flush` takes it exclusively and workers stand aside while
//! a flush is in progress, so the flushing thread sees items in strict order.
//!
//! Items stay in memory only. A crash after the sink accepted a batch but
//! before the worker released it replays that batch; a crash with items
//! pending loses them. Sinks must tolerate duplicate keys.

pub mod files;
#[cfg(feature = "remote-http")]
pub mod http;
pub mod record;
pub mod sink;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::error::{EdgeError, ErrorKind};
use crate::status::{Mode, StatusObserver};
use crate::worker::{join_with_timeout, StopSignal};

pub use files::{face_remote_path, DirectorySink, FileUpload};
pub use record::{record_path, DetectionEvent, OutboundRecord};
pub use sink::{BatchSink, UnavailableSink};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_POP_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Component name used in logs and status callbacks.
    pub name: String,
    pub batch_size: usize,
    pub retry_interval: Duration,
    pub workers: usize,
    pub pop_timeout: Duration,
    pub stop_timeout: Duration,
    pub flush_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "DeliveryQueue".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            workers: 1,
            pop_timeout: Duration::from_millis(DEFAULT_POP_TIMEOUT_MS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            flush_timeout: Duration::from_secs(DEFAULT_FLUSH_TIMEOUT_SECS),
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EdgeError::configuration(format!(
                "{}: batch_size must be greater than zero",
                self.name
            )));
        }
        if self.workers == 0 {
            return Err(EdgeError::configuration(format!(
                "{}: at least one worker is required",
                self.name
            )));
        }
        if self.pop_timeout.is_zero() {
            return Err(EdgeError::configuration(format!(
                "{}: pop_timeout must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Result of a [`DeliveryQueue::flush`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every pending item was delivered or dropped.
    Drained,
    /// The sink rejected a batch; the items are still queued.
    Offline { pending: usize },
    /// The flush deadline passed first.
    TimedOut { pending: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub mode: Mode,
    pub pending: usize,
    pub in_flight: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub failed_attempts: u64,
}

enum BatchOutcome {
    Delivered,
    Dropped,
    Requeued,
}

struct Shared<T> {
    config: QueueConfig,
    sink: Arc<dyn BatchSink<T>>,
    observer: Arc<dyn StatusObserver>,
    pending: Mutex<VecDeque<T>>,
    available: Condvar,
    /// Workers hold it shared for each pop/deliver cycle, never while
    /// waiting for items. Flush holds it exclusively.
    gate: RwLock<()>,
    /// Number of callers currently inside `flush`.
    flushing: AtomicUsize,
    online: AtomicBool,
    in_flight: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_attempts: AtomicU64,
    stop: StopSignal,
}

pub struct DeliveryQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> DeliveryQueue<T> {
    /// Probe the sink once to pick the initial mode, then spawn the workers.
    pub fn start(
        config: QueueConfig,
        sink: Arc<dyn BatchSink<T>>,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let online = match sink.probe() {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "{}: sink {} unavailable at startup, starting offline: {:#}",
                    config.name,
                    sink.name(),
                    err
                );
                false
            }
        };
        log::info!(
            "{}: starting {} worker(s) against {} (batch_size={}, retry_interval={}s, mode={})",
            config.name,
            config.workers,
            sink.name(),
            config.batch_size,
            config.retry_interval.as_secs_f32(),
            if online { "online" } else { "offline" }
        );

        let shared = Arc::new(Shared {
            config,
            sink,
            observer,
            pending: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            gate: RwLock::new(()),
            flushing: AtomicUsize::new(0),
            online: AtomicBool::new(online),
            in_flight: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            stop: StopSignal::new(),
        });

        let mut handles = Vec::with_capacity(shared.config.workers);
        for idx in 0..shared.config.workers {
            let worker_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", shared.config.name, idx))
                .spawn(move || worker_loop(worker_shared))
                .map_err(|e| anyhow!("{}: failed to spawn worker: {}", shared.config.name, e))?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Queue an item for delivery. Never waits on the network.
    pub fn enqueue(&self, item: T) {
        self.shared.lock_pending().push_back(item);
        self.shared.available.notify_one();
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock_pending().len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            mode: self.mode(),
            pending: self.pending_len(),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            delivered: self.shared.delivered.load(Ordering::SeqCst),
            dropped: self.shared.dropped.load(Ordering::SeqCst),
            failed_attempts: self.shared.failed_attempts.load(Ordering::SeqCst),
        }
    }

    /// Drain the queue on the calling thread.
    ///
    /// Waits for the batch a worker may be delivering, then delivers batch by
    /// batch until the queue is empty, the sink rejects a batch, or
    /// `flush_timeout` passes. Items that could not be delivered stay queued.
    pub fn flush(&self) -> FlushOutcome {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.flush_timeout;

        shared.flushing.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let _gate = shared.gate.write().unwrap_or_else(|e| e.into_inner());
            self.drain_locked(deadline)
        };
        shared.flushing.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn drain_locked(&self, deadline: Instant) -> FlushOutcome {
        let shared = &self.shared;
        loop {
            let batch = shared.take_batch();
            if batch.is_empty() {
                log::info!("{}: flush complete", shared.config.name);
                return FlushOutcome::Drained;
            }
            if Instant::now() >= deadline {
                shared.requeue_front(batch);
                let pending = self.pending_len();
                log::warn!(
                    "{}: flush timed out with {} item(s) pending",
                    shared.config.name,
                    pending
                );
                return FlushOutcome::TimedOut { pending };
            }
            if let BatchOutcome::Requeued = shared.deliver(batch) {
                let pending = self.pending_len();
                log::warn!(
                    "{}: flush stopped, sink offline with {} item(s) pending",
                    shared.config.name,
                    pending
                );
                return FlushOutcome::Offline { pending };
            }
        }
    }

    /// Stop the workers and wait up to `stop_timeout` for them to exit.
    /// Pending items are kept and remain visible through `pending_len`.
    pub fn stop(&self) {
        self.shared.stop.stop();
        self.shared.available.notify_all();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.shared.config.stop_timeout;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            join_with_timeout(&self.shared.config.name, handle, remaining);
        }
        let pending = self.pending_len();
        if pending > 0 {
            log::warn!(
                "{}: stopped with {} undelivered item(s)",
                self.shared.config.name,
                pending
            );
        } else {
            log::info!("{}: stopped", self.shared.config.name);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_stopped()
    }
}

impl<T: Clone + Send + 'static> DeliveryQueue<T> {
    /// Copy of the pending items, front first.
    pub fn snapshot(&self) -> Vec<T> {
        self.shared.lock_pending().iter().cloned().collect()
    }
}

impl<T: Send + 'static> Drop for DeliveryQueue<T> {
    fn drop(&mut self) {
        self.shared.stop.stop();
        self.shared.available.notify_all();
    }
}

impl<T> Shared<T> {
    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mode(&self) -> Mode {
        if self.online.load(Ordering::SeqCst) {
            Mode::Online
        } else {
            Mode::Offline
        }
    }

    fn set_mode(&self, mode: Mode) {
        let online = mode == Mode::Online;
        if self.online.swap(online, Ordering::SeqCst) != online {
            self.observer.mode_changed(&self.config.name, mode);
        }
    }

    fn take_batch(&self) -> Vec<T> {
        let mut pending = self.lock_pending();
        let n = pending.len().min(self.config.batch_size);
        pending.drain(..n).collect()
    }

    /// Wait up to `pop_timeout` for items without taking any.
    fn wait_for_items(&self) -> bool {
        let mut pending = self.lock_pending();
        if pending.is_empty() && !self.stop.is_stopped() {
            let (guard, _) = self
                .available
                .wait_timeout(pending, self.config.pop_timeout)
                .unwrap_or_else(|e| e.into_inner());
            pending = guard;
        }
        !pending.is_empty()
    }

    fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst) > 0
    }

    fn requeue_front(&self, batch: Vec<T>) {
        let mut pending = self.lock_pending();
        for item in batch.into_iter().rev() {
            pending.push_front(item);
        }
    }

    fn deliver(&self, batch: Vec<T>) -> BatchOutcome {
        let count = batch.len();
        self.in_flight.fetch_add(count, Ordering::SeqCst);
        let result = self.sink.deliver(&batch);
        let outcome = match result {
            Ok(()) => {
                self.delivered.fetch_add(count as u64, Ordering::SeqCst);
                self.set_mode(Mode::Online);
                self.observer.batch_delivered(&self.config.name, count);
                BatchOutcome::Delivered
            }
            Err(err) => match EdgeError::classify(&err) {
                ErrorKind::PermanentResource | ErrorKind::InvalidInput => {
                    self.dropped.fetch_add(count as u64, Ordering::SeqCst);
                    self.observer
                        .item_dropped(&self.config.name, &format!("{:#}", err));
                    BatchOutcome::Dropped
                }
                ErrorKind::TransientIo | ErrorKind::Configuration => {
                    self.failed_attempts.fetch_add(1, Ordering::SeqCst);
                    self.requeue_front(batch);
                    self.set_mode(Mode::Offline);
                    self.observer
                        .batch_failed(&self.config.name, count, &format!("{:#}", err));
                    BatchOutcome::Requeued
                }
            },
        };
        self.in_flight.fetch_sub(count, Ordering::SeqCst);
        outcome
    }
}

fn worker_loop<T>(shared: Arc<Shared<T>>) {
    while !shared.stop.is_stopped() {
        if shared.mode() == Mode::Offline {
            if !shared.stop.sleep(shared.config.retry_interval) {
                break;
            }
            match shared.sink.probe() {
                Ok(()) => {
                    log::info!("{}: sink {} reachable again", shared.config.name, shared.sink.name());
                    shared.set_mode(Mode::Online);
                }
                Err(err) => {
                    log::debug!("{}: probe failed: {:#}", shared.config.name, err);
                    continue;
                }
            }
        }

        if !shared.wait_for_items() {
            continue;
        }
        if shared.is_flushing() {
            shared.stop.sleep(shared.config.pop_timeout);
            continue;
        }
        let _gate = shared.gate.read().unwrap_or_else(|e| e.into_inner());
        let batch = shared.take_batch();
        if batch.is_empty() {
            continue;
        }
        shared.deliver(batch);
    }
    log::debug!("{}: worker exiting", shared.config.name);
}
