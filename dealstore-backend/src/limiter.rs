use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::BackendError;

/// Counting limiter on in-flight remote calls. A slot is held for as long
/// as the returned permit lives.
#[derive(Clone)]
pub struct Limiter {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl Limiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BackendError> {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Closed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}
