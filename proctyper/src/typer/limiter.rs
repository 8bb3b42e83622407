use std::{num::NonZeroUsize, sync::Arc};

use anyhow::{Result, anyhow};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide admission gate for executable inspections.
///
/// At most `capacity` permits exist; an inspection may only run while its
/// caller holds one. Waiting in [`InspectionLimiter::acquire`] is cancel-safe:
/// dropping the future gives nothing back because nothing was taken.
#[derive(Clone)]
pub struct InspectionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A reserved inspection slot. The slot is released when the permit is dropped.
pub struct InspectionPermit {
    _permit: OwnedSemaphorePermit,
}

impl InspectionLimiter {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.get())),
            capacity: capacity.get(),
        }
    }

    /// Waits for a free slot. Fails only after [`InspectionLimiter::close`].
    pub async fn acquire(&self) -> Result<InspectionPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("inspection limiter closed"))?;
        Ok(InspectionPermit { _permit: permit })
    }

    /// Rejects every pending and future `acquire`. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}
