//! Cooperative cancellation signal shared between threads and tasks.
//!
//! Waiters register a `Waker` while they are parked on a semaphore. `cancel`
//! flips the flag first and then wakes everything registered, so a waiter
//! that registers after the drain always observes the flag (see `register`).

use parking_lot::Mutex;
use slotmap::{DefaultKey, SlotMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;

/// Cloneable cancellation token. All clones observe the same signal.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    wakers: Mutex<SlotMap<DefaultKey, Waker>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every waiter parked with this token.
    /// Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let woken: Vec<Waker> = {
            let mut wakers = self.inner.wakers.lock();
            wakers.drain().map(|(_, w)| w).collect()
        };
        for w in woken {
            w.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register (or refresh) `waker` under `slot`. Returns `true` if the token
    /// is already cancelled, in which case the caller must not park.
    ///
    /// The flag is re-read under the registration lock: `cancel` sets it
    /// before draining, so either the drain sees this waker or we see the flag.
    pub(crate) fn register(&self, slot: &mut Option<DefaultKey>, waker: &Waker) -> bool {
        let mut wakers = self.inner.wakers.lock();
        match slot.and_then(|k| wakers.get_mut(k)) {
            Some(existing) => {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
            }
            None => *slot = Some(wakers.insert(waker.clone())),
        }
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn unregister(&self, slot: &mut Option<DefaultKey>) {
        if let Some(k) = slot.take() {
            self.inner.wakers.lock().remove(k);
        }
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner.wakers.lock().len()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
