//! Status reporting.
//!
//! Components receive an `Arc<dyn StatusObserver>` at construction and report
//! mode changes and recoveries through it. The default observer writes to the
//! `log` facade; tests plug in a recorder.

use std::time::Duration;

/// Delivery mode of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Online,
    Offline,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Online => "online",
            Mode::Offline => "offline",
        }
    }
}

pub trait StatusObserver: Send + Sync {
    fn mode_changed(&self, component: &str, mode: Mode) {
        let _ = (component, mode);
    }

    fn batch_delivered(&self, component: &str, count: usize) {
        let _ = (component, count);
    }

    fn batch_failed(&self, component: &str, count: usize, error: &str) {
        let _ = (component, count, error);
    }

    fn item_dropped(&self, component: &str, reason: &str) {
        let _ = (component, reason);
    }

    fn stream_connected(&self, source: &str, attempt: u64) {
        let _ = (source, attempt);
    }

    fn stream_lost(&self, source: &str, reason: &str) {
        let _ = (source, reason);
    }

    fn stream_stale(&self, source: &str, since_last_frame: Duration) {
        let _ = (source, since_last_frame);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl StatusObserver for NullObserver {}

/// Forwards status to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn mode_changed(&self, component: &str, mode: Mode) {
        match mode {
            Mode::Online => log::info!("{}: remote reachable, switched to online mode", component),
            Mode::Offline => log::warn!(
                "{}: remote unreachable, switched to offline mode; records are kept locally",
                component
            ),
        }
    }

    fn batch_delivered(&self, component: &str, count: usize) {
        log::debug!("{}: delivered batch of {}", component, count);
    }

    fn batch_failed(&self, component: &str, count: usize, error: &str) {
        log::warn!("{}: batch of {} requeued: {}", component, count, error);
    }

    fn item_dropped(&self, component: &str, reason: &str) {
        log::warn!("{}: dropped item: {}", component, reason);
    }

    fn stream_connected(&self, source: &str, attempt: u64) {
        log::info!("ConnectionSupervisor: connected to {} (attempt {})", source, attempt);
    }

    fn stream_lost(&self, source: &str, reason: &str) {
        log::warn!("ConnectionSupervisor: lost {}: {}", source, reason);
    }

    fn stream_stale(&self, source: &str, since_last_frame: Duration) {
        log::warn!(
            "ConnectionSupervisor: no frame from {} for {:.1}s; forcing reconnect",
            source,
            since_last_frame.as_secs_f32()
        );
    }
}
