//! A dispatcher entry (§4.5): the shard it names, lazily opened, plus
//! the bookkeeping the aggregator's routing and GC passes need.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, RwLock,
};

use crate::{aggregator::compact::Compacting1To2, seqno::SeqGen, shard::Shard, Result};

/// One dispatcher entry. `dirty` is set the instant a split or merge
/// decides to replace this handle; any caller that observes it set
/// after acquiring `lock` must release and retry `find_best_match`
/// (§4.5: "if dirty, release both and retry"). While `compacting` is
/// set, the handle is mid-split: callers route through the wrapper
/// instead of the bare shard (§4.6 steps 3-5).
pub struct ShardHandle {
    dir_name: String,
    shard: RwLock<Option<Arc<Shard>>>,
    hit_count: AtomicU64,
    dirty: AtomicBool,
    lock: RwLock<()>,
    compacting: RwLock<Option<Arc<Compacting1To2>>>,
}

impl ShardHandle {
    pub fn new(dir_name: String) -> ShardHandle {
        ShardHandle {
            dir_name,
            shard: RwLock::new(None),
            hit_count: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            lock: RwLock::new(()),
            compacting: RwLock::new(None),
        }
    }

    pub fn with_shard(dir_name: String, shard: Arc<Shard>) -> ShardHandle {
        ShardHandle {
            dir_name,
            shard: RwLock::new(Some(shard)),
            hit_count: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            lock: RwLock::new(()),
            compacting: RwLock::new(None),
        }
    }

    /// The in-progress split wrapper, if any.
    pub fn compacting(&self) -> Option<Arc<Compacting1To2>> {
        self.compacting.read().unwrap().clone()
    }

    /// Install a split wrapper; rejects nesting (§5 "a shard that has a
    /// compaction wrapper rejects new compactions").
    pub fn begin_compacting(&self, wrapper: Arc<Compacting1To2>) -> Result<()> {
        let mut slot = self.compacting.write().unwrap();
        if slot.is_some() {
            return err_at!(InvalidArgument, msg: "shard {} is already compacting", self.dir_name);
        }
        *slot = Some(wrapper);
        Ok(())
    }

    pub fn clear_compacting(&self) {
        *self.compacting.write().unwrap() = None;
    }

    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn bump_hits(&self) -> u64 {
        self.hit_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn hits(&self) -> u64 {
        self.hit_count.load(Ordering::SeqCst)
    }

    pub fn halve_hits(&self) {
        self.hit_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| Some(h / 2)).ok();
    }

    /// The shard object, opening it from `root.join(dir_name)` the
    /// first time it is needed (§4.5: "possibly lazy-loaded, nullable").
    pub fn load(&self, root: &std::path::Path, seq_gen: &Arc<SeqGen>) -> Result<Arc<Shard>> {
        if let Some(shard) = self.shard.read().unwrap().as_ref() {
            return Ok(Arc::clone(shard));
        }
        let mut slot = self.shard.write().unwrap();
        if let Some(shard) = slot.as_ref() {
            return Ok(Arc::clone(shard));
        }
        let shard = Arc::new(Shard::open(&root.join(&self.dir_name), Arc::clone(seq_gen))?);
        *slot = Some(Arc::clone(&shard));
        Ok(shard)
    }

    /// Close and evict the loaded shard, if any, so the next [Self::load]
    /// reopens it from disk (§4.5 GC loop's "close the least-hit shards").
    pub fn unload(&self) -> Result<()> {
        let mut slot = self.shard.write().unwrap();
        if let Some(shard) = slot.take() {
            shard.close()?;
        }
        Ok(())
    }

    /// Read-lock for a point operation; released on drop.
    pub fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap()
    }

    pub fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap()
    }
}
