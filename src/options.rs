//! Construction-time configuration. Immutable once a `KeyedLock` is built.

use crate::error::ConfigError;

pub const DEFAULT_POOL_SIZE: usize = 20;
pub const DEFAULT_POOL_INITIAL_FILL: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct KeyedLockOptions {
    /// Concurrent holders allowed per key. 1 is plain mutual exclusion.
    pub max_count: usize,
    /// Capacity of the Releaser pool. 0 disables pooling.
    pub pool_size: usize,
    /// Releasers created up front. `None` fills the whole pool.
    pub pool_initial_fill: Option<usize>,
    /// Registry shard count hint; rounded up to a power of two. `None` picks
    /// four shards per available core.
    pub concurrency_level: Option<usize>,
    /// Initial registry capacity, spread across shards.
    pub capacity: usize,
}

impl Default for KeyedLockOptions {
    fn default() -> Self {
        Self {
            max_count: 1,
            pool_size: DEFAULT_POOL_SIZE,
            pool_initial_fill: Some(DEFAULT_POOL_INITIAL_FILL),
            concurrency_level: None,
            capacity: 0,
        }
    }
}

impl KeyedLockOptions {
    pub fn with_max_count(max_count: usize) -> Self {
        Self {
            max_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_count < 1 {
            return Err(ConfigError::MaxCountOutOfRange {
                max_count: self.max_count,
            });
        }
        if let Some(fill) = self.pool_initial_fill {
            if fill > self.pool_size {
                return Err(ConfigError::PoolInitialFillTooLarge {
                    fill,
                    pool_size: self.pool_size,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn initial_fill(&self) -> usize {
        self.pool_initial_fill.unwrap_or(self.pool_size)
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.concurrency_level.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(4, |n| n.get()) * 4
        })
    }
}
