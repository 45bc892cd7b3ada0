//! Error types for configuration and acquisition.
//!
//! A timed-out acquisition is not an error; it is reported as `None` by the
//! timed entry points.

use thiserror::Error;

/// Rejected `KeyedLockOptions`. Returned before anything is allocated.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_count must be at least 1, got {max_count}")]
    MaxCountOutOfRange { max_count: usize },
    #[error("pool_initial_fill ({fill}) exceeds pool_size ({pool_size})")]
    PoolInitialFillTooLarge { fill: usize, pool_size: usize },
}

/// Failure of a cancellable acquisition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The token was cancelled before a permit was obtained. No permit is
    /// held and the key's reference count has already been undone.
    #[error("lock acquisition cancelled")]
    Cancelled,
}
