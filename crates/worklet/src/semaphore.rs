//! Counting semaphore gating a consumer against a producer.
//!
//! The producer/consumer law for bounded work queues built on this primitive:
//! one `signal` per enqueued item, one consumed permit per successful dequeue,
//! and `reset` flushes stale wakeups when cancelling pending work.

/// A counting semaphore starting at zero permits.
///
/// `signal` may be called from a different task or thread than the one that
/// waits. Waiting consumes exactly one permit and pends while none are
/// available.
#[derive(Debug)]
pub struct Semaphore {
    permits: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            permits: tokio::sync::Semaphore::new(0),
        }
    }

    /// Release one permit, waking one pending waiter if any.
    pub fn signal(&self) {
        self.permits.add_permits(1);
    }

    /// Consume one permit, pending until one is available.
    pub async fn wait(&self) {
        match self.permits.acquire().await {
            Ok(permit) => permit.forget(),
            // The semaphore is never closed.
            Err(_) => unreachable!("semaphore closed"),
        }
    }

    /// Consume one permit if one is available right now.
    pub fn try_wait(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Discard all pending permits, so the next `wait` pends until a fresh
    /// `signal`. Used to flush a producer/consumer relationship when
    /// cancelling pending work.
    pub fn reset(&self) {
        while let Ok(permit) = self.permits.try_acquire() {
            permit.forget();
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
