//! Bounded free-list of Releasers, reused across keys to avoid allocating a
//! semaphore per acquisition under key churn.
//!
//! The free-list lock is never held while a Releaser's own lock is taken:
//! `take` pops first and the caller assigns afterwards; `put` expects an
//! already-reset instance.

use crate::releaser::Releaser;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct ReleaserPool<K> {
    free: Mutex<Vec<Arc<Releaser<K>>>>,
    capacity: usize,
    max_count: usize,
}

impl<K> ReleaserPool<K> {
    pub(crate) fn new(capacity: usize, initial_fill: usize, max_count: usize) -> Self {
        debug_assert!(initial_fill <= capacity);
        let free = (0..initial_fill)
            .map(|_| Arc::new(Releaser::new(max_count)))
            .collect::<Vec<_>>();
        Self {
            free: Mutex::new(free),
            capacity,
            max_count,
        }
    }

    /// A free Releaser: pooled if available, otherwise newly allocated.
    pub(crate) fn take(&self) -> Arc<Releaser<K>> {
        let pooled = self.free.lock().pop();
        pooled.unwrap_or_else(|| Arc::new(Releaser::new(self.max_count)))
    }

    /// Return a free Releaser. Dropped if the pool is full.
    pub(crate) fn put(&self, releaser: Arc<Releaser<K>>) {
        debug_assert_eq!(releaser.semaphore.available_permits(), self.max_count);
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(releaser);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.free.lock().len()
    }

    /// Whether every pooled instance has all of its permits back.
    #[cfg(test)]
    pub(crate) fn all_permits_returned(&self) -> bool {
        self.free
            .lock()
            .iter()
            .all(|r| r.semaphore.available_permits() == self.max_count)
    }

    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.free.lock());
        drop(drained);
    }
}
