//! Bounded concurrency for tool invocations.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

/// Permit pool guarding the tool-invocation path.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// A held slot. Dropping it returns the slot to the gate.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Create a gate with `max_concurrent` slots (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Wait up to `wait` for a free slot.
    pub async fn try_acquire(&self, wait: Duration) -> Option<Permit> {
        match timeout(wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(Permit { _permit: permit }),
            // Closed semaphore or timeout.
            _ => None,
        }
    }

    /// Give a permit back. Equivalent to dropping it.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max
    }

    /// Number of permits currently held.
    pub fn in_flight(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }
}
