//! Admission control for calls to external services.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::pool::PoolError;

/// Counting semaphore bounding concurrent calls to one external stage.
///
/// Two chokers built with [`Choker::shared`] draw from the same permits.
#[derive(Debug, Clone)]
pub struct Choker {
    label: String,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    shared: bool,
}

/// Slot held for the duration of one call. Dropping it frees the slot.
#[derive(Debug)]
pub struct ChokerPermit {
    _permit: OwnedSemaphorePermit,
}

impl Choker {
    /// A choker admitting `capacity` concurrent holders (at least one).
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            label: label.into(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            shared: false,
        }
    }

    /// A choker aliasing `other`'s permits.
    pub fn shared(label: impl Into<String>, other: &Choker) -> Self {
        Self {
            label: label.into(),
            semaphore: other.semaphore.clone(),
            capacity: other.capacity,
            shared: true,
        }
    }

    /// Wait for a free slot. Fails once the choker is closed.
    pub async fn enter(&self) -> Result<ChokerPermit, PoolError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(|permit| ChokerPermit { _permit: permit })
            .map_err(|_| PoolError::Cancelled)
    }

    /// Wake every waiter with a cancellation and refuse new entries.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// True when built with [`Choker::shared`].
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn bounds_concurrent_holders() {
        let choker = Choker::new("extractor", 2);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let choker = choker.clone();
            let live = live.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = choker.enter().await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(choker.available(), 2);
    }

    #[tokio::test]
    async fn shared_chokers_draw_from_one_budget() {
        let extractor = Choker::new("extractor", 1);
        let summarizer = Choker::shared("summarizer", &extractor);
        assert!(summarizer.is_shared());
        assert_eq!(summarizer.capacity(), 1);

        let held = extractor.enter().await.unwrap();
        assert_eq!(summarizer.available(), 0);
        drop(held);
        assert_eq!(summarizer.available(), 1);
    }

    #[tokio::test]
    async fn close_cancels_waiters() {
        let choker = Choker::new("summarizer", 1);
        let _held = choker.enter().await.unwrap();

        let waiter = {
            let choker = choker.clone();
            tokio::spawn(async move { choker.enter().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        choker.close();
        assert_eq!(waiter.await.unwrap(), Err(PoolError::Cancelled));
    }

    #[test]
    fn zero_capacity_admits_one() {
        assert_eq!(Choker::new("x", 0).capacity(), 1);
    }
}
