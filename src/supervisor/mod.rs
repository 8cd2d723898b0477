//! Camera stream supervision.
//!
//! `ConnectionSupervisor` owns one [`VideoSource`] and keeps it alive:
//!
//! ```text
//! DISCONNECTED --connect ok--> CONNECTED
//! CONNECTED --read error | source closed | no frame for staleness_timeout--> DISCONNECTED
//! ```
//!
//! `connect` opens the transport and then polls for a first frame for up to
//! `connection_timeout`; an open transport that never produces a frame counts
//! as a failed attempt. A background loop reconnects whenever the session is
//! down and forces a reconnect when the stream goes stale.
//!
//! `read` never surfaces transport errors. When no live frame is available it
//! falls back to the last good frame while that frame is younger than
//! `staleness_timeout`, and reports `Unavailable` otherwise.

pub mod link;
#[cfg(feature = "ingest-mjpeg")]
pub mod mjpeg;
pub mod source;
#[cfg(feature = "rtsp-gstreamer")]
pub mod gstreamer;

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::EdgeError;
use crate::frame::Frame;
use crate::status::StatusObserver;
use crate::worker::{join_with_timeout, StopSignal};

pub use link::{LinkJoiner, NmcliJoiner, NoLink};
pub use source::{open_source, SourceSettings, SyntheticSource, VideoSource};

pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_STALENESS_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// How long `connect` waits for the first frame.
    pub connection_timeout: Duration,
    /// Pause after a failed connection attempt.
    pub retry_interval: Duration,
    /// Maximum age of the last frame before the stream is considered dead.
    pub staleness_timeout: Duration,
    /// Poll interval while waiting for the first frame.
    pub first_frame_poll: Duration,
    /// How often the background loop checks the session.
    pub check_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            staleness_timeout: Duration::from_secs(DEFAULT_STALENESS_TIMEOUT_SECS),
            first_frame_poll: Duration::from_millis(500),
            check_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of [`ConnectionSupervisor::read`].
#[derive(Clone, Debug)]
pub enum FrameRead {
    /// Fresh frame from the stream.
    Live(Frame),
    /// Last good frame, returned because no live frame was available.
    Cached(Frame),
    Unavailable,
}

impl FrameRead {
    pub fn is_ok(&self) -> bool {
        !matches!(self, FrameRead::Unavailable)
    }

    pub fn frame(&self) -> Option<&Frame> {
        match self {
            FrameRead::Live(frame) | FrameRead::Cached(frame) => Some(frame),
            FrameRead::Unavailable => None,
        }
    }

    pub fn into_frame(self) -> Option<Frame> {
        match self {
            FrameRead::Live(frame) | FrameRead::Cached(frame) => Some(frame),
            FrameRead::Unavailable => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub connected: bool,
    pub connect_attempts: u64,
    /// Successful connections after the first one.
    pub reconnects: u64,
    /// Connected sessions declared lost, for any reason.
    pub drops: u64,
    /// Drops caused by staleness.
    pub stale_drops: u64,
    pub frames_read: u64,
}

struct Session {
    source: Box<dyn VideoSource>,
    connected: bool,
}

struct CachedFrame {
    frame: Frame,
    at: Instant,
}

struct Inner {
    config: SupervisorConfig,
    describe: String,
    session: Mutex<Session>,
    cache: Mutex<Option<CachedFrame>>,
    link: Arc<dyn LinkJoiner>,
    observer: Arc<dyn StatusObserver>,
    connected: AtomicBool,
    loop_running: AtomicBool,
    stop: StopSignal,
    connect_attempts: AtomicU64,
    successful_connects: AtomicU64,
    drops: AtomicU64,
    stale_drops: AtomicU64,
    frames_read: AtomicU64,
}

pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        source: Box<dyn VideoSource>,
        link: Arc<dyn LinkJoiner>,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<Self> {
        if config.staleness_timeout.is_zero() || config.check_interval.is_zero() {
            return Err(EdgeError::configuration(
                "staleness_timeout and check_interval must be greater than zero",
            ));
        }
        let describe = source.describe();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                describe,
                session: Mutex::new(Session {
                    source,
                    connected: false,
                }),
                cache: Mutex::new(None),
                link,
                observer,
                connected: AtomicBool::new(false),
                loop_running: AtomicBool::new(false),
                stop: StopSignal::new(),
                connect_attempts: AtomicU64::new(0),
                successful_connects: AtomicU64::new(0),
                drops: AtomicU64::new(0),
                stale_drops: AtomicU64::new(0),
                frames_read: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the background reconnect loop.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Ok(());
        }
        self.inner.loop_running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("connection-supervisor".to_string())
            .spawn(move || supervise(inner));
        match spawned {
            Ok(join) => {
                *handle = Some(join);
                Ok(())
            }
            Err(e) => {
                self.inner.loop_running.store(false, Ordering::SeqCst);
                Err(anyhow!("failed to spawn connection supervisor: {}", e))
            }
        }
    }

    /// Connect now on the calling thread.
    pub fn connect(&self) -> Result<()> {
        let mut session = self.inner.lock_session();
        self.inner.connect_locked(&mut session)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Next frame, or the cached fallback.
    ///
    /// Without a running background loop, a disconnected session is
    /// reconnected inline.
    pub fn read(&self) -> FrameRead {
        let inner = &self.inner;
        let mut session = match inner.session.try_lock() {
            Ok(session) => session,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // A connect is in progress on another thread.
            Err(TryLockError::WouldBlock) => return inner.cached(),
        };

        if !session.connected || !session.source.is_opened() {
            if inner.loop_running.load(Ordering::SeqCst) {
                return inner.cached();
            }
            if session.connected {
                inner.mark_lost(&mut session, "source closed", false);
            }
            return match inner.connect_locked(&mut session) {
                Ok(()) => match inner.cached() {
                    FrameRead::Cached(frame) => FrameRead::Live(frame),
                    other => other,
                },
                Err(_) => inner.cached(),
            };
        }

        match session.source.read() {
            Ok(Some(frame)) => {
                inner.store_frame(&frame);
                FrameRead::Live(frame)
            }
            Ok(None) => inner.cached(),
            Err(err) => {
                inner.mark_lost(&mut session, &format!("read failed: {:#}", err), false);
                inner.cached()
            }
        }
    }

    pub fn stats(&self) -> SupervisorStats {
        let inner = &self.inner;
        let successful = inner.successful_connects.load(Ordering::SeqCst);
        SupervisorStats {
            connected: inner.connected.load(Ordering::SeqCst),
            connect_attempts: inner.connect_attempts.load(Ordering::SeqCst),
            reconnects: successful.saturating_sub(1),
            drops: inner.drops.load(Ordering::SeqCst),
            stale_drops: inner.stale_drops.load(Ordering::SeqCst),
            frames_read: inner.frames_read.load(Ordering::SeqCst),
        }
    }

    /// Stop the background loop and release the source.
    pub fn stop(&self) {
        self.inner.stop.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            join_with_timeout("ConnectionSupervisor", handle, self.inner.config.stop_timeout);
        }
        self.inner.loop_running.store(false, Ordering::SeqCst);
        let mut session = self.inner.lock_session();
        session.source.release();
        session.connected = false;
        self.inner.connected.store(false, Ordering::SeqCst);
        log::info!("ConnectionSupervisor: released {}", self.inner.describe);
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.inner.stop.stop();
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store_frame(&self, frame: &Frame) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedFrame {
            frame: frame.clone(),
            at: Instant::now(),
        });
    }

    fn last_frame_age(&self) -> Option<Duration> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.as_ref().map(|c| c.at.elapsed())
    }

    fn cached(&self) -> FrameRead {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.as_ref() {
            Some(c) if c.at.elapsed() <= self.config.staleness_timeout => {
                FrameRead::Cached(c.frame.clone())
            }
            _ => FrameRead::Unavailable,
        }
    }

    fn mark_lost(&self, session: &mut Session, reason: &str, stale: bool) {
        if session.connected {
            self.drops.fetch_add(1, Ordering::SeqCst);
            if stale {
                self.stale_drops.fetch_add(1, Ordering::SeqCst);
            }
            self.observer.stream_lost(&self.describe, reason);
        }
        session.connected = false;
        self.connected.store(false, Ordering::SeqCst);
        session.source.release();
    }

    fn connect_locked(&self, session: &mut Session) -> Result<()> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(err) = self.link.join() {
            log::warn!(
                "ConnectionSupervisor: link {} not joined, trying anyway: {:#}",
                self.link.name(),
                err
            );
        }

        if session.source.is_opened() {
            session.source.release();
        }
        session.connected = false;
        self.connected.store(false, Ordering::SeqCst);

        if let Err(err) = session.source.open() {
            return Err(EdgeError::transient(format!(
                "open {} (attempt {}): {:#}",
                self.describe, attempt, err
            )));
        }

        let deadline = Instant::now() + self.config.connection_timeout;
        loop {
            match session.source.read() {
                Ok(Some(frame)) => {
                    self.store_frame(&frame);
                    session.connected = true;
                    self.connected.store(true, Ordering::SeqCst);
                    self.successful_connects.fetch_add(1, Ordering::SeqCst);
                    self.observer.stream_connected(&self.describe, attempt);
                    return Ok(());
                }
                Ok(None) => {}
                Err(err) => log::debug!(
                    "ConnectionSupervisor: waiting for first frame from {}: {:#}",
                    self.describe,
                    err
                ),
            }
            if Instant::now() >= deadline || !self.stop.sleep(self.config.first_frame_poll) {
                break;
            }
        }

        session.source.release();
        Err(EdgeError::transient(format!(
            "no frame from {} within {:?} (attempt {})",
            self.describe, self.config.connection_timeout, attempt
        )))
    }
}

fn supervise(inner: Arc<Inner>) {
    log::info!("ConnectionSupervisor: supervising {}", inner.describe);
    loop {
        let healthy = {
            let mut session = inner.lock_session();
            let age = inner.last_frame_age();
            let stale = age.is_some_and(|age| age > inner.config.staleness_timeout);

            if session.connected && !session.source.is_opened() {
                inner.mark_lost(&mut session, "source closed", false);
            } else if session.connected && stale {
                let age = age.unwrap_or_default();
                inner.observer.stream_stale(&inner.describe, age);
                inner.mark_lost(&mut session, "stream stale", true);
            }

            if session.connected {
                true
            } else {
                match inner.connect_locked(&mut session) {
                    Ok(()) => true,
                    Err(err) => {
                        log::warn!("ConnectionSupervisor: {:#}", err);
                        false
                    }
                }
            }
        };

        let pause = if healthy {
            inner.config.check_interval
        } else {
            inner.config.retry_interval
        };
        if !inner.stop.sleep(pause) {
            break;
        }
    }
    log::debug!("ConnectionSupervisor: loop exiting");
}
