//! Counting semaphore with one permit pool and two ways to wait on it.
//!
//! `acquire` returns a future that parks the task through its `Waker`;
//! `acquire_blocking` drives that same future on the calling thread with a
//! waker that unparks the thread. There is no separate state for blocking
//! waiters.
//!
//! Waiters live in a `SlotMap` and are notified in slot order, and a newly
//! arriving caller may take a free permit ahead of a notified waiter. Entry
//! order is therefore not FIFO; only the permit count is exact.
//!
//! Notification protocol: `release` marks one un-notified waiter as notified
//! and wakes it. A notified waiter that leaves without a permit (cancelled,
//! timed out, dropped) hands the notification on if permits are still free,
//! so a wakeup is never lost.

use crate::cancel::CancellationToken;
use crate::error::LockError;
use parking_lot::Mutex;
use slotmap::{DefaultKey, SlotMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::Instant;

pub(crate) struct Semaphore {
    state: Mutex<State>,
    max_permits: usize,
}

struct State {
    permits: usize,
    waiters: SlotMap<DefaultKey, Waiter>,
}

struct Waiter {
    waker: Waker,
    notified: bool,
}

impl State {
    /// Pick one waiter that has not been told about a free permit yet.
    fn notify_one(&mut self) -> Option<Waker> {
        self.waiters
            .values_mut()
            .find(|w| !w.notified)
            .map(|w| {
                w.notified = true;
                w.waker.clone()
            })
    }
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                waiters: SlotMap::with_key(),
            }),
            max_permits: permits,
        }
    }

    pub(crate) fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Like `try_acquire`, but an already-cancelled token wins over a free
    /// permit.
    pub(crate) fn try_acquire_cancellable(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, LockError> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Cancelled);
        }
        Ok(self.try_acquire())
    }

    pub(crate) fn acquire<'a>(&'a self, cancel: Option<&'a CancellationToken>) -> Acquire<'a> {
        Acquire {
            semaphore: self,
            cancel,
            waiter: None,
            cancel_slot: None,
        }
    }

    /// Block the calling thread until a permit is taken (`Ok(true)`), the
    /// deadline passes (`Ok(false)`), or `cancel` fires (`Err`). `None`
    /// waits forever. A negative outcome never holds a permit.
    pub(crate) fn acquire_blocking(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, LockError> {
        if self.try_acquire_cancellable(cancel)? {
            return Ok(true);
        }
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return Ok(false);
        }

        let mut acquire = self.acquire(cancel);
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(res) = Pin::new(&mut acquire).poll(&mut cx) {
                return res.map(|()| true);
            }
            match deadline {
                None => thread::park(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        // `acquire` drops here and withdraws the waiter.
                        return Ok(false);
                    }
                    thread::park_timeout(d - now);
                }
            }
        }
    }

    pub(crate) fn release(&self) {
        let waker = {
            let mut state = self.state.lock();
            debug_assert!(state.permits < self.max_permits, "semaphore over-released");
            state.permits += 1;
            state.notify_one()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Future returned by `Semaphore::acquire`. Resolves to `Ok(())` holding one
/// permit, or `Err(Cancelled)` holding none. Dropping it unresolved holds none.
pub(crate) struct Acquire<'a> {
    semaphore: &'a Semaphore,
    cancel: Option<&'a CancellationToken>,
    waiter: Option<DefaultKey>,
    cancel_slot: Option<DefaultKey>,
}

impl Acquire<'_> {
    /// Withdraw from both wait lists without taking a permit.
    fn withdraw(&mut self) {
        if let Some(k) = self.waiter.take() {
            let handoff = {
                let mut state = self.semaphore.state.lock();
                match state.waiters.remove(k) {
                    Some(w) if w.notified && state.permits > 0 => state.notify_one(),
                    _ => None,
                }
            };
            if let Some(w) = handoff {
                w.wake();
            }
        }
        if let Some(token) = self.cancel {
            token.unregister(&mut self.cancel_slot);
        }
    }
}

impl Future for Acquire<'_> {
    type Output = Result<(), LockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.cancel.is_some_and(CancellationToken::is_cancelled) {
            this.withdraw();
            return Poll::Ready(Err(LockError::Cancelled));
        }

        {
            let mut state = this.semaphore.state.lock();
            if state.permits > 0 {
                state.permits -= 1;
                if let Some(k) = this.waiter.take() {
                    state.waiters.remove(k);
                }
                drop(state);
                if let Some(token) = this.cancel {
                    token.unregister(&mut this.cancel_slot);
                }
                return Poll::Ready(Ok(()));
            }

            match this.waiter.and_then(|k| state.waiters.get_mut(k)) {
                Some(w) => {
                    // Lost the race for the permit we were told about.
                    w.notified = false;
                    if !w.waker.will_wake(cx.waker()) {
                        w.waker = cx.waker().clone();
                    }
                }
                None => {
                    this.waiter = Some(state.waiters.insert(Waiter {
                        waker: cx.waker().clone(),
                        notified: false,
                    }));
                }
            }
        }

        if let Some(token) = this.cancel {
            if token.register(&mut this.cancel_slot, cx.waker()) {
                this.withdraw();
                return Poll::Ready(Err(LockError::Cancelled));
            }
        }
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        self.withdraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let c = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (c.clone(), Waker::from(c))
    }

    /// Invariant: no more than `max_permits` can be taken at once.
    #[test]
    fn try_acquire_respects_capacity() {
        let s = Semaphore::new(2);
        assert!(s.try_acquire());
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
        s.release();
        assert_eq!(s.available_permits(), 1);
        assert!(s.try_acquire());
    }

    /// Invariant: a pending future is woken by `release`, then resolves with
    /// the permit and leaves the waiter list empty.
    #[test]
    fn release_wakes_pending_future() {
        let s = Semaphore::new(1);
        assert!(s.try_acquire());

        let (count, waker) = counting();
        let mut cx = Context::from_waker(&waker);
        let mut fut = s.acquire(None);
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert_eq!(s.waiting(), 1);

        s.release();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(()))));
        assert_eq!(s.waiting(), 0);
        assert_eq!(s.available_permits(), 0);
    }

    /// Invariant: a notified waiter that is dropped passes the wakeup to the
    /// next waiter instead of swallowing it.
    #[test]
    fn dropped_notified_waiter_hands_off() {
        let s = Semaphore::new(1);
        assert!(s.try_acquire());

        let (c1, w1) = counting();
        let (c2, w2) = counting();
        let mut f1 = s.acquire(None);
        let mut f2 = s.acquire(None);
        assert!(Pin::new(&mut f1)
            .poll(&mut Context::from_waker(&w1))
            .is_pending());
        assert!(Pin::new(&mut f2)
            .poll(&mut Context::from_waker(&w2))
            .is_pending());

        s.release();
        let first = c1.0.load(Ordering::SeqCst) + c2.0.load(Ordering::SeqCst);
        assert_eq!(first, 1);

        // Drop whichever one was notified; the other must be woken.
        if c1.0.load(Ordering::SeqCst) == 1 {
            drop(f1);
            assert_eq!(c2.0.load(Ordering::SeqCst), 1);
            assert!(matches!(
                Pin::new(&mut f2).poll(&mut Context::from_waker(&w2)),
                Poll::Ready(Ok(()))
            ));
        } else {
            drop(f2);
            assert_eq!(c1.0.load(Ordering::SeqCst), 1);
            assert!(matches!(
                Pin::new(&mut f1).poll(&mut Context::from_waker(&w1)),
                Poll::Ready(Ok(()))
            ));
        }
        assert_eq!(s.available_permits(), 0);
    }

    /// Invariant: an already-cancelled token fails even when a permit is free,
    /// and no permit is consumed.
    #[test]
    fn cancelled_token_wins_over_free_permit() {
        let s = Semaphore::new(1);
        let t = CancellationToken::new();
        t.cancel();
        assert_eq!(s.acquire_blocking(None, Some(&t)), Err(LockError::Cancelled));

        let (_c, waker) = counting();
        let mut fut = s.acquire(Some(&t));
        assert!(matches!(
            Pin::new(&mut fut).poll(&mut Context::from_waker(&waker)),
            Poll::Ready(Err(LockError::Cancelled))
        ));
        assert_eq!(s.available_permits(), 1);
    }

    /// Invariant: a blocking wait with a past deadline returns `false` at once
    /// and registers nothing.
    #[test]
    fn blocking_timeout_returns_false() {
        let s = Semaphore::new(1);
        assert!(s.try_acquire());
        assert_eq!(s.acquire_blocking(Some(Instant::now()), None), Ok(false));
        let short = Instant::now() + Duration::from_millis(20);
        assert_eq!(s.acquire_blocking(Some(short), None), Ok(false));
        assert_eq!(s.waiting(), 0);
        assert_eq!(s.available_permits(), 0);
    }

    /// Invariant: cancelling wakes a thread blocked without a deadline.
    #[test]
    fn cancel_unblocks_thread() {
        let s = Arc::new(Semaphore::new(1));
        assert!(s.try_acquire());
        let t = CancellationToken::new();

        let waiter = {
            let s = s.clone();
            let t = t.clone();
            thread::spawn(move || s.acquire_blocking(None, Some(&t)))
        };
        thread::sleep(Duration::from_millis(30));
        t.cancel();
        assert_eq!(waiter.join().unwrap(), Err(LockError::Cancelled));
        assert_eq!(s.waiting(), 0);
        assert_eq!(s.available_permits(), 0);
    }

    /// Invariant: a blocked thread takes the permit once it is released.
    #[test]
    fn release_unblocks_thread() {
        let s = Arc::new(Semaphore::new(1));
        assert!(s.try_acquire());
        let waiter = {
            let s = s.clone();
            thread::spawn(move || s.acquire_blocking(None, None))
        };
        thread::sleep(Duration::from_millis(30));
        s.release();
        assert_eq!(waiter.join().unwrap(), Ok(true));
        assert_eq!(s.available_permits(), 0);
    }
}
