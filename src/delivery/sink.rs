use anyhow::Result;

use crate::error::EdgeError;

/// Destination for batches drained from a [`super::DeliveryQueue`].
///
/// `deliver` is all-or-nothing from the queue's point of view: an `Err`
/// means the whole batch is retried (transient) or dropped (permanent, see
/// [`EdgeError::classify`]).
pub trait BatchSink<T>: Send + Sync {
    /// Sink identifier for logs.
    fn name(&self) -> &str;

    fn deliver(&self, batch: &[T]) -> Result<()>;

    /// Cheap reachability check used while offline.
    fn probe(&self) -> Result<()> {
        Ok(())
    }
}

/// Stand-in used when no remote is configured or its client failed to build.
///
/// Every call fails as transient, so items accumulate and the queue stays in
/// offline mode instead of discarding them.
#[derive(Clone, Debug)]
pub struct UnavailableSink {
    reason: String,
}

impl UnavailableSink {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl<T> BatchSink<T> for UnavailableSink {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn deliver(&self, _batch: &[T]) -> Result<()> {
        Err(EdgeError::transient(format!("remote unavailable: {}", self.reason)))
    }

    fn probe(&self) -> Result<()> {
        Err(EdgeError::transient(format!("remote unavailable: {}", self.reason)))
    }
}
