//! Releaser: the per-key semaphore plus its reference-count bookkeeping.
//!
//! A Releaser is either live (registered for exactly one key, `in_use`) or
//! free (in the pool or about to be dropped). Its key is only reassigned
//! while it is free. All bookkeeping goes through `state`, a lock private to
//! this instance, so unrelated keys never contend.

use crate::semaphore::Semaphore;
use core::borrow::Borrow;
use parking_lot::Mutex;

pub(crate) struct Releaser<K> {
    state: Mutex<ReleaserState<K>>,
    pub(crate) semaphore: Semaphore,
}

struct ReleaserState<K> {
    key: Option<K>,
    hash: u64,
    ref_count: usize,
    in_use: bool,
}

impl<K> Releaser<K> {
    /// A free Releaser with a full semaphore and no key.
    pub(crate) fn new(max_count: usize) -> Self {
        Self {
            state: Mutex::new(ReleaserState {
                key: None,
                hash: 0,
                ref_count: 0,
                in_use: false,
            }),
            semaphore: Semaphore::new(max_count),
        }
    }

    /// Make a free, reset Releaser live for `key` with one reference (the
    /// caller).
    pub(crate) fn assign(&self, key: K, hash: u64) {
        let mut st = self.state.lock();
        debug_assert!(!st.in_use && st.key.is_none(), "assigning a used releaser");
        st.key = Some(key);
        st.hash = hash;
        st.ref_count = 1;
        st.in_use = true;
    }

    /// Forget the key of a free Releaser before it is pooled.
    pub(crate) fn reset(&self) -> Option<K> {
        let mut st = self.state.lock();
        debug_assert!(!st.in_use, "resetting a live releaser");
        st.key.take()
    }

    /// Attach one more reference. Fails if this instance has been released
    /// to zero or now serves another key; the caller then installs a fresh
    /// Releaser instead.
    pub(crate) fn try_increment<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let mut st = self.state.lock();
        if !st.in_use || !st.key.as_ref().is_some_and(|k| k.borrow() == q) {
            return false;
        }
        st.ref_count += 1;
        true
    }

    /// Detach one reference. On the last one the instance goes free and the
    /// stored key hash is returned so the caller can unlink it.
    pub(crate) fn decrement(&self) -> Option<u64> {
        let mut st = self.state.lock();
        debug_assert!(st.in_use && st.ref_count > 0, "releaser count underflow");
        st.ref_count -= 1;
        if st.ref_count == 0 {
            st.in_use = false;
            Some(st.hash)
        } else {
            None
        }
    }

    /// Whether the stored key equals `q`, regardless of liveness.
    pub(crate) fn key_matches<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.state
            .lock()
            .key
            .as_ref()
            .is_some_and(|k| k.borrow() == q)
    }

    /// Reference count if this instance is live for `q`.
    pub(crate) fn live_count<Q>(&self, q: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let st = self.state.lock();
        (st.in_use && st.key.as_ref().is_some_and(|k| k.borrow() == q)).then_some(st.ref_count)
    }

    #[cfg(test)]
    pub(crate) fn is_free(&self) -> bool {
        !self.state.lock().in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Invariant: a fresh Releaser is free, keyless and fully permitted.
    #[test]
    fn new_is_free() {
        let r: Releaser<String> = Releaser::new(3);
        assert!(r.is_free());
        assert!(!r.key_matches("a"));
        assert_eq!(r.live_count("a"), None);
        assert_eq!(r.semaphore.available_permits(), 3);
    }

    /// Invariant: increments only succeed while live and for the same key.
    #[test]
    fn try_increment_checks_liveness_and_key() {
        let r: Releaser<String> = Releaser::new(1);
        assert!(!r.try_increment("k"), "free releaser must refuse");

        r.assign("k".to_string(), 7);
        assert!(!r.try_increment("other"));
        assert!(r.try_increment("k"));
        assert_eq!(r.live_count("k"), Some(2));
        assert_eq!(r.live_count("other"), None);
    }

    /// Invariant: the last decrement frees the instance and reports the hash;
    /// a freed instance refuses increments but still remembers its key until
    /// reset.
    #[test]
    fn last_decrement_frees() {
        let r: Releaser<String> = Releaser::new(1);
        r.assign("k".to_string(), 42);
        assert!(r.try_increment("k"));
        assert_eq!(r.decrement(), None);
        assert_eq!(r.decrement(), Some(42));
        assert!(r.is_free());
        assert!(!r.try_increment("k"));
        assert!(r.key_matches("k"));
        assert_eq!(r.live_count("k"), None);

        assert_eq!(r.reset(), Some("k".to_string()));
        assert!(!r.key_matches("k"));
    }

    /// Invariant: after reset and reassignment the instance serves only the
    /// new key.
    #[test]
    fn reassign_after_reset_serves_new_key() {
        let r: Releaser<String> = Releaser::new(1);
        r.assign("old".to_string(), 1);
        assert_eq!(r.decrement(), Some(1));
        assert_eq!(r.reset(), Some("old".to_string()));
        r.assign("new".to_string(), 2);
        assert!(!r.try_increment("old"));
        assert_eq!(r.live_count("new"), Some(1));
    }
}
