//! Admission gate bounding how many hosts are inside a session operation at once.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fixed-capacity counting gate.
///
/// Waiters are admitted in FIFO order, so nobody starves as long as every holder eventually
/// drops its permit.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit(#[allow(dead_code)] OwnedSemaphorePermit);

impl AdmissionGate {
    /// Creates a gate with `capacity` slots. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits until a slot is free and takes it.
    pub async fn acquire(&self) -> GatePermit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("The admission gate is never closed.");
        GatePermit(permit)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    #[test]
    fn test_zero_capacity_is_raised() {
        assert_eq!(AdmissionGate::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let gate = AdmissionGate::new(2);
        let first = gate.acquire().await;
        let second = gate.acquire().await;
        assert_eq!(gate.in_use(), 2);
        drop(first);
        assert_eq!(gate.in_use(), 1);
        drop(second);
        assert_eq!(gate.in_use(), 0);
    }

    #[tokio::test]
    async fn test_holders_never_exceed_capacity() {
        let gate = AdmissionGate::new(2);
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers = (0..5).map(|_| {
            let gate = gate.clone();
            let holders = Arc::clone(&holders);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
            })
        });
        for result in join_all(workers).await {
            result.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(gate.in_use(), 0);
    }
}
