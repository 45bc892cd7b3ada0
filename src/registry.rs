//! Registry: sharded key -> Releaser index with the create-or-attach and
//! detach-or-remove protocols.
//!
//! Each shard is a `hashbrown::HashTable` of slots behind its own `RwLock`.
//! A slot stores the key hash computed once at insertion; rehashing uses the
//! stored hash and never calls back into `K: Hash`. Key equality is checked
//! through the Releaser's own lock, which is the only place the key lives.
//!
//! Lock order: shard lock, then Releaser lock. The pool lock is never taken
//! while a shard lock is held, and a Releaser lock is never held while
//! taking a shard lock.
//!
//! Invariants
//! - A slot exists for a key iff its Releaser is live (reference count > 0)
//!   or is a dead Releaser whose last holder is about to unlink it.
//! - At most one slot per key, hence at most one live Releaser per key.
//! - A Releaser is only pooled after it has been unlinked, so a recycled
//!   instance is never reachable under its previous key.

use crate::pool::ReleaserPool;
use crate::releaser::Releaser;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::hash_table::Entry;
use hashbrown::HashTable;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

struct Slot<K> {
    hash: u64,
    releaser: Arc<Releaser<K>>,
}

pub(crate) struct Registry<K, S> {
    hasher: S,
    shards: Box<[RwLock<HashTable<Slot<K>>>]>,
    shard_mask: usize,
    pool: ReleaserPool<K>,
}

impl<K, S> Registry<K, S> {
    /// `shards` is rounded up to a power of two.
    pub(crate) fn new(hasher: S, shards: usize, capacity: usize, pool: ReleaserPool<K>) -> Self {
        let n = shards.max(1).next_power_of_two();
        let per_shard = capacity.div_ceil(n);
        let shards = (0..n)
            .map(|_| RwLock::new(HashTable::with_capacity(per_shard)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            hasher,
            shards,
            shard_mask: n - 1,
            pool,
        }
    }

    fn shard(&self, hash: u64) -> &RwLock<HashTable<Slot<K>>> {
        // High bits pick the shard; hashbrown consumes the low and top-7 bits.
        &self.shards[((hash >> 32) as usize) & self.shard_mask]
    }

    /// Detach one reference from `releaser`. `permit` says whether the caller
    /// holds a semaphore permit that must be returned.
    ///
    /// The permit goes back while our reference is still counted: any other
    /// detacher then sees a count above zero and cannot pool the instance
    /// with a permit outstanding.
    pub(crate) fn release(&self, releaser: &Arc<Releaser<K>>, permit: bool) {
        if permit {
            releaser.semaphore.release();
        }
        if let Some(hash) = releaser.decrement() {
            self.unlink(hash, releaser);
            // Drop the key outside the Releaser lock.
            let key = releaser.reset();
            drop(key);
            self.pool.put(releaser.clone());
        }
    }

    fn unlink(&self, hash: u64, releaser: &Arc<Releaser<K>>) {
        let mut table = self.shard(hash).write();
        if let Ok(occ) = table.find_entry(hash, |s| Arc::ptr_eq(&s.releaser, releaser)) {
            occ.remove();
            trace!("unlinked releaser after last release");
        }
    }

    /// Number of keys with a slot, live or pending unlink.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub(crate) fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn clear(&self) {
        for shard in self.shards.iter() {
            let drained: Vec<Slot<K>> = shard.write().drain().collect();
            drop(drained);
        }
        self.pool.clear();
    }
}

impl<K, S> Registry<K, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    /// Return the live Releaser for `key` with one more reference attached,
    /// creating or recycling one if needed.
    pub(crate) fn get_or_add(&self, key: K) -> Arc<Releaser<K>> {
        let hash = self.make_hash(&key);
        let shard = self.shard(hash);

        // Fast path: attach to the live entry under the read lock.
        {
            let table = shard.read();
            if let Some(slot) = table.find(hash, |s| s.releaser.key_matches(&key)) {
                if slot.releaser.try_increment(&key) {
                    return slot.releaser.clone();
                }
            }
        }

        // Slow path: prepare a free Releaser outside any shard lock, then
        // either attach to a racing winner or install ours.
        let fresh = self.pool.take();
        let mut table = shard.write();
        let winner = match table.entry(hash, |s| s.releaser.key_matches(&key), |s| s.hash) {
            Entry::Occupied(mut occ) => {
                if occ.get().releaser.try_increment(&key) {
                    occ.get().releaser.clone()
                } else {
                    // Dead entry whose last holder has not unlinked it yet;
                    // that holder's pointer-checked unlink leaves ours alone.
                    fresh.assign(key, hash);
                    occ.get_mut().releaser = fresh.clone();
                    trace!("replaced released entry with fresh releaser");
                    return fresh;
                }
            }
            Entry::Vacant(vac) => {
                fresh.assign(key, hash);
                vac.insert(Slot {
                    hash,
                    releaser: fresh.clone(),
                });
                trace!("installed releaser for new key");
                return fresh;
            }
        };
        drop(table);
        self.pool.put(fresh);
        winner
    }

    /// Reference count of the live Releaser for `q`. Liveness and key are
    /// validated under the Releaser's own lock, so a concurrently recycled
    /// instance reads as absent.
    pub(crate) fn live_count<Q>(&self, q: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        let table = self.shard(hash).read();
        table
            .find(hash, |s| s.releaser.key_matches(q))
            .and_then(|s| s.releaser.live_count(q))
    }
}
