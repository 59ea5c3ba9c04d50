//! Adaptive export concurrency
//!
//! A semaphore of `concurrency` permits. A busy signal from the cluster
//! retires one permit (never the last one); after `recovery_successes`
//! consecutive successful requests one retired permit comes back.

use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct LimiterState {
    /// Permits taken out of circulation
    retired: usize,
    /// Retirements requested while every permit was in use
    debt: usize,
    consecutive_successes: u32,
}

#[derive(Debug, Clone)]
pub struct AdaptiveConcurrency {
    semaphore: Arc<Semaphore>,
    max: usize,
    recovery_successes: u32,
    state: Arc<Mutex<LimiterState>>,
}

/// Held while one batch is in flight
#[derive(Debug)]
pub struct ExportPermit {
    permit: Option<OwnedSemaphorePermit>,
    limiter: AdaptiveConcurrency,
}

impl Drop for ExportPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.limiter.release(permit);
        }
    }
}

impl AdaptiveConcurrency {
    pub fn new(concurrency: usize, recovery_successes: u32) -> Self {
        let max = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            recovery_successes: recovery_successes.max(1),
            state: Arc::new(Mutex::new(LimiterState::default())),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LimiterState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> ExportPermit {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        ExportPermit {
            permit,
            limiter: self.clone(),
        }
    }

    /// Permits currently in circulation
    pub fn effective(&self) -> usize {
        self.max - self.with_state(|state| state.retired)
    }

    /// The cluster said it is overloaded: shrink by one
    pub fn on_busy(&self) {
        let retired = self.with_state(|state| {
            state.consecutive_successes = 0;
            if state.retired + 1 >= self.max {
                return None;
            }
            state.retired += 1;
            match self.semaphore.try_acquire() {
                Ok(permit) => permit.forget(),
                // every permit is out; take one back when it is released
                Err(_) => state.debt += 1,
            }
            Some(state.retired)
        });
        if let Some(retired) = retired {
            info!(
                effective = self.max - retired,
                max = self.max,
                "Cluster busy, reducing export concurrency"
            );
        }
    }

    /// A request went through
    pub fn on_success(&self) {
        let restored = self.with_state(|state| {
            if state.retired == 0 {
                return None;
            }
            state.consecutive_successes += 1;
            if state.consecutive_successes < self.recovery_successes {
                return None;
            }
            state.consecutive_successes = 0;
            state.retired -= 1;
            if state.debt > 0 {
                state.debt -= 1;
            } else {
                self.semaphore.add_permits(1);
            }
            Some(state.retired)
        });
        if let Some(retired) = restored {
            debug!(effective = self.max - retired, "Restored export concurrency");
        }
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let absorbed = self.with_state(|state| {
            if state.debt > 0 {
                state.debt -= 1;
                true
            } else {
                false
            }
        });
        if absorbed {
            permit.forget();
        } else {
            drop(permit);
        }
    }
}
