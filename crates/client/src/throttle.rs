//! Bounds the number of concurrent outbound HTTP requests.

use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The capacity of the process-wide throttle.
///
/// Chosen to stay well below typical OS handle limits no matter how many
/// logical sources are active at once.
pub const DEFAULT_CAPACITY: usize = 128;

static SHARED: Lazy<Arc<Throttle>> = Lazy::new(|| Arc::new(Throttle::new(DEFAULT_CAPACITY)));

/// A counting permit gating concurrent HTTP requests.
///
/// One throttle is shared process-wide by default; it is not tied to any
/// particular source. A permit is held only for the duration of a network
/// call, never across a file lock wait.
#[derive(Debug)]
pub struct Throttle {
    permits: Arc<Semaphore>,
}

impl Throttle {
    /// Creates a throttle with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Returns the process-wide shared throttle.
    pub fn shared() -> Arc<Throttle> {
        SHARED.clone()
    }

    /// Waits until a slot is free and takes it.
    ///
    /// The slot is returned when the permit is dropped.
    pub async fn acquire(&self) -> ThrottlePermit {
        // The semaphore is never closed, so acquisition can only fail if the
        // throttle itself has been dropped, which the Arc prevents.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("throttle semaphore closed");
        ThrottlePermit(permit)
    }

    /// The number of slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A held throttle slot, released on drop.
#[derive(Debug)]
pub struct ThrottlePermit(OwnedSemaphorePermit);
