//! KeyedLock: the public facade. Every entry point attaches to the key's
//! Releaser through the registry, waits on its semaphore, and hands back a
//! `KeyedLockGuard` whose drop releases.
//!
//! A failed wait (timeout, cancellation, or the waiting future being
//! dropped) undoes its reference count before anything is reported, through
//! the same guard with `holds_permit == false`.

use crate::cancel::CancellationToken;
use crate::error::{ConfigError, LockError};
use crate::options::KeyedLockOptions;
use crate::pool::ReleaserPool;
use crate::registry::Registry;
use crate::releaser::Releaser;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Timeout meaning "wait forever". Any timeout whose deadline does not fit
/// in an `Instant` is treated the same way.
pub const INFINITE: Duration = Duration::MAX;

/// Per-key locks over an unbounded key space, allowing up to `max_count`
/// concurrent holders per key. Distinct keys never contend.
///
/// Both threads and tasks can wait on the same key: the blocking methods
/// park the thread, the `async` ones suspend the task. Finite non-zero
/// timeouts on the `async` methods use Tokio's timer and need a Tokio
/// runtime; everything else is runtime-agnostic.
///
/// Waiters are not served in arrival order.
pub struct KeyedLock<K, S = RandomState> {
    registry: Registry<K, S>,
    max_count: usize,
}

/// Held permit for one key. Dropping it releases the permit and, for the
/// last holder, retires the key's Releaser.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyedLockGuard<'a, K, S = RandomState> {
    registry: &'a Registry<K, S>,
    releaser: Arc<Releaser<K>>,
    holds_permit: bool,
}

impl<K, S> Drop for KeyedLockGuard<'_, K, S> {
    fn drop(&mut self) {
        self.registry.release(&self.releaser, self.holds_permit);
    }
}

impl<K, S> fmt::Debug for KeyedLockGuard<'_, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLockGuard").finish_non_exhaustive()
    }
}

fn deadline(timeout: Duration) -> Option<Instant> {
    if timeout == INFINITE {
        return None;
    }
    Instant::now().checked_add(timeout)
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash,
{
    /// Mutual exclusion per key with default pooling.
    pub fn new() -> Self {
        Self::build(KeyedLockOptions::default(), RandomState::new())
    }

    pub fn with_max_count(max_count: usize) -> Result<Self, ConfigError> {
        Self::with_options(KeyedLockOptions::with_max_count(max_count))
    }

    pub fn with_options(options: KeyedLockOptions) -> Result<Self, ConfigError> {
        Self::with_options_and_hasher(options, RandomState::new())
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> KeyedLock<K, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Build with explicit options and key hasher. Options are validated
    /// before anything is allocated.
    pub fn with_options_and_hasher(options: KeyedLockOptions, hasher: S) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self::build(options, hasher))
    }

    fn build(options: KeyedLockOptions, hasher: S) -> Self {
        let shards = options.shard_count();
        let pool = ReleaserPool::new(options.pool_size, options.initial_fill(), options.max_count);
        debug!(
            max_count = options.max_count,
            pool_size = options.pool_size,
            shards,
            "keyed lock created"
        );
        Self {
            registry: Registry::new(hasher, shards, options.capacity, pool),
            max_count: options.max_count,
        }
    }

    fn attach(&self, key: K) -> KeyedLockGuard<'_, K, S> {
        KeyedLockGuard {
            registry: &self.registry,
            releaser: self.registry.get_or_add(key),
            holds_permit: false,
        }
    }

    /// Turn a wait outcome into the caller's result. On a negative outcome
    /// the unentered guard drops here, undoing its reference.
    fn settle<'a>(
        mut guard: KeyedLockGuard<'a, K, S>,
        outcome: Result<bool, LockError>,
    ) -> Result<Option<KeyedLockGuard<'a, K, S>>, LockError> {
        match outcome {
            Ok(true) => {
                guard.holds_permit = true;
                Ok(Some(guard))
            }
            Ok(false) => {
                trace!("keyed lock wait timed out");
                Ok(None)
            }
            Err(e) => {
                trace!("keyed lock wait cancelled");
                Err(e)
            }
        }
    }

    fn wait_blocking(
        &self,
        key: K,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<KeyedLockGuard<'_, K, S>>, LockError> {
        let guard = self.attach(key);
        let outcome = guard
            .releaser
            .semaphore
            .acquire_blocking(deadline(timeout), cancel);
        Self::settle(guard, outcome)
    }

    async fn wait_async(
        &self,
        key: K,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<KeyedLockGuard<'_, K, S>>, LockError> {
        let guard = self.attach(key);
        let outcome = {
            let semaphore = &guard.releaser.semaphore;
            if timeout.is_zero() {
                semaphore.try_acquire_cancellable(cancel)
            } else if deadline(timeout).is_none() {
                semaphore.acquire(cancel).await.map(|()| true)
            } else {
                match tokio::time::timeout(timeout, semaphore.acquire(cancel)).await {
                    Ok(res) => res.map(|()| true),
                    Err(_elapsed) => Ok(false),
                }
            }
        };
        Self::settle(guard, outcome)
    }

    /// Block until the key is entered.
    pub fn lock(&self, key: K) -> KeyedLockGuard<'_, K, S> {
        let mut guard = self.attach(key);
        let outcome = guard.releaser.semaphore.acquire_blocking(None, None);
        debug_assert_eq!(outcome, Ok(true));
        guard.holds_permit = true;
        guard
    }

    /// Block until the key is entered or `cancel` fires.
    pub fn lock_cancellable(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<KeyedLockGuard<'_, K, S>, LockError> {
        self.wait_blocking(key, INFINITE, Some(cancel))
            .and_then(|g| g.ok_or(LockError::Cancelled))
    }

    /// Block for at most `timeout`. `None` means the key was not entered.
    pub fn lock_timeout(&self, key: K, timeout: Duration) -> Option<KeyedLockGuard<'_, K, S>> {
        self.wait_blocking(key, timeout, None).ok().flatten()
    }

    pub fn lock_timeout_cancellable(
        &self,
        key: K,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyedLockGuard<'_, K, S>>, LockError> {
        self.wait_blocking(key, timeout, Some(cancel))
    }

    /// Enter only if a permit is free right now.
    pub fn try_lock(&self, key: K) -> Option<KeyedLockGuard<'_, K, S>> {
        self.lock_timeout(key, Duration::ZERO)
    }

    pub async fn lock_async(&self, key: K) -> KeyedLockGuard<'_, K, S> {
        let mut guard = self.attach(key);
        let outcome = guard.releaser.semaphore.acquire(None).await;
        debug_assert_eq!(outcome, Ok(()));
        guard.holds_permit = true;
        guard
    }

    pub async fn lock_async_cancellable(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<KeyedLockGuard<'_, K, S>, LockError> {
        self.wait_async(key, INFINITE, Some(cancel))
            .await
            .and_then(|g| g.ok_or(LockError::Cancelled))
    }

    /// Wait for at most `timeout`. `None` means the key was not entered.
    ///
    /// A finite, non-zero `timeout` uses Tokio's timer and panics outside a
    /// Tokio runtime with timers enabled. `Duration::ZERO` and `INFINITE`
    /// need no runtime.
    pub async fn lock_timeout_async(
        &self,
        key: K,
        timeout: Duration,
    ) -> Option<KeyedLockGuard<'_, K, S>> {
        self.wait_async(key, timeout, None).await.ok().flatten()
    }

    /// Wait for at most `timeout` or until `cancel` fires. Like
    /// `lock_timeout_async`, a finite non-zero timeout needs a Tokio runtime.
    pub async fn lock_timeout_async_cancellable(
        &self,
        key: K,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyedLockGuard<'_, K, S>>, LockError> {
        self.wait_async(key, timeout, Some(cancel)).await
    }

    /// Run `f` under the key if it can be entered within `timeout`.
    /// Returns `Some` with the result iff `f` ran.
    pub fn try_run<F, R>(&self, key: K, timeout: Duration, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        let _guard = self.lock_timeout(key, timeout)?;
        Some(f())
    }

    pub fn try_run_cancellable<F, R>(
        &self,
        key: K,
        timeout: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<Option<R>, LockError>
    where
        F: FnOnce() -> R,
    {
        let Some(_guard) = self.lock_timeout_cancellable(key, timeout, cancel)? else {
            return Ok(None);
        };
        Ok(Some(f()))
    }

    /// Run `f` under the key if it can be entered within `timeout`.
    /// Returns `Some` with the result iff `f` ran. Timer requirements as
    /// for `lock_timeout_async`.
    pub async fn try_run_async<F, Fut, R>(&self, key: K, timeout: Duration, f: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _guard = self.lock_timeout_async(key, timeout).await?;
        Some(f().await)
    }

    /// Like `try_run_async`, but fails with `Cancelled` if `cancel` fires
    /// first; `f` does not run then. Needs a Tokio runtime for finite,
    /// non-zero timeouts.
    pub async fn try_run_async_cancellable<F, Fut, R>(
        &self,
        key: K,
        timeout: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<Option<R>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let Some(_guard) = self
            .lock_timeout_async_cancellable(key, timeout, cancel)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(f().await))
    }

    /// Whether any caller currently holds or waits for `key`.
    pub fn is_in_use<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.registry.live_count(key).is_some()
    }

    /// Callers holding or waiting for `key`; 0 if the key is idle.
    pub fn current_count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.registry.live_count(key).unwrap_or(0)
    }

    /// `max_count` minus `current_count`, floored at 0.
    pub fn remaining_count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.max_count.saturating_sub(self.current_count(key))
    }
}

impl<K, S> KeyedLock<K, S> {
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Keys currently registered.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free Releasers waiting in the pool.
    pub fn pooled(&self) -> usize {
        self.registry.pooled()
    }
}

impl<K, S> Drop for KeyedLock<K, S> {
    fn drop(&mut self) {
        debug!(keys = self.registry.len(), "keyed lock dropped");
        self.registry.clear();
    }
}

impl<K, S> fmt::Debug for KeyedLock<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLock")
            .field("max_count", &self.max_count)
            .field("keys", &self.len())
            .field("pooled", &self.pooled())
            .finish()
    }
}
