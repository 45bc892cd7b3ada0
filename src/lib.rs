//! keyed-lock: per-key mutual exclusion (or bounded concurrency) over an
//! unbounded key space, usable from blocking threads and async tasks alike.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: grant up to `max_count` concurrent holders per key while keeping
//!   unrelated keys entirely independent, without allocating a semaphore per
//!   acquisition under key churn.
//! - Layers:
//!   - Semaphore: counting semaphore with one permit pool and two waits, a
//!     `Future` and a thread-parking driver of that same future.
//!   - Releaser: one key's semaphore plus reference count and `in_use` flag,
//!     guarded by a lock private to the instance.
//!   - ReleaserPool: bounded free-list of Releasers reused across keys.
//!   - Registry: sharded `HashTable` index from key to live Releaser with
//!     the create-or-attach and detach-or-remove protocols.
//!   - KeyedLock: public facade returning RAII `KeyedLockGuard`s.
//!
//! Constraints
//! - At most `max_count` holders per key at any instant. Entry order among
//!   waiters is not FIFO.
//! - A key is registered iff some caller holds or waits for it.
//! - Never two live Releasers for one key; a recycled Releaser is never
//!   reachable under its previous key.
//! - A failed acquisition (timeout, cancellation, dropped future) consumes
//!   no permit and undoes its reference before returning.
//! - A holder returns its permit before dropping its reference, so a
//!   Releaser only reaches the pool with every permit back.
//!
//! Locking
//! - Releaser state: one lock per instance; unrelated keys never share it.
//! - Registry: one `RwLock` per shard. Order is shard, then Releaser.
//! - Pool: its own lock, never held together with a Releaser or shard lock.
//!
//! Hasher invariants
//! - Each registry slot stores the key hash computed once per acquisition;
//!   rehashing uses the stored hash and never calls `K: Hash`.
//!
//! Reentrancy
//! - `K: Eq`, `K: Hash` and `S: BuildHasher` run while registry locks are
//!   held and must not call back into the same `KeyedLock`.
//!
//! Notes and non-goals
//! - No fairness guarantee; a consumer needing FIFO entry needs a different
//!   primitive.
//! - No poisoning: a panic while holding a guard releases the key normally.

mod cancel;
mod error;
mod keyed_lock;
mod options;
mod pool;
mod registry;
mod releaser;
mod semaphore;

// Public surface
pub use cancel::CancellationToken;
pub use error::{ConfigError, LockError};
pub use keyed_lock::{KeyedLock, KeyedLockGuard, INFINITE};
pub use options::{KeyedLockOptions, DEFAULT_POOL_INITIAL_FILL, DEFAULT_POOL_SIZE};
