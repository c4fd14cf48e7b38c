//! How listeners schedule inbound work.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Scheduling policy for inbound exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Every exchange runs as soon as it arrives.
    #[default]
    Concurrent,
    /// At most `n` exchanges run at once; further exchanges wait for a slot.
    Bounded(usize),
    /// One exchange at a time.
    Sequential,
}

impl Dispatch {
    /// Build the gate enforcing this policy.
    #[must_use]
    pub fn gate(self) -> Gate {
        let limit = match self {
            Self::Concurrent => None,
            Self::Bounded(n) => Some(n.max(1)),
            Self::Sequential => Some(1),
        };
        Gate {
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n))),
        }
    }
}

/// Admission control shared by a listener's workers.
#[derive(Debug, Clone)]
pub struct Gate {
    semaphore: Option<Arc<Semaphore>>,
}

/// Slot held while one exchange runs.
#[derive(Debug)]
pub struct Slot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl Gate {
    /// Wait for a slot. Always immediate for [`Dispatch::Concurrent`].
    pub async fn enter(&self) -> Slot {
        let permit = match &self.semaphore {
            // The semaphore is never closed, so acquiring cannot fail.
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };
        Slot { _permit: permit }
    }
}
