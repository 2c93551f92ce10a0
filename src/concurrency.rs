//! Global cap on simultaneous in-flight generation jobs.
//!
//! Wraps a Tokio semaphore. A [`GatePermit`] is RAII: it is returned to the
//! pool when dropped, so every exit path of a job (success, failure, error
//! propagation with `?`, task cancellation) releases it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;

/// Counting permit pool of size `max_concurrent`.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    /// Current number of held permits (for progress display)
    in_flight: Arc<AtomicUsize>,
    /// Peak concurrent permits observed
    peak_in_flight: AtomicUsize,
}

impl ConcurrencyGate {
    /// Creates a gate with `max_concurrent` permits.
    ///
    /// `max_concurrent` is validated to be non-zero by
    /// [`DispatchConfig::validate`](crate::DispatchConfig::validate); a zero
    /// here is raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        let max_permits = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Wait for a free permit.
    ///
    /// Returns [`DispatchError::Cancelled`] if `cancel` fires first; no
    /// permit is held in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, DispatchError> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| DispatchError::Cancelled)?
            }
        };
        Ok(self.track(permit))
    }

    /// Take a permit without waiting. Returns `None` when all are held.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.track(permit))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        GatePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_permits
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held slot in the [`ConcurrencyGate`]. Released on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
