//! Presents one DB interface over many shards with online split and
//! merge (§4.5), grounded on `dgm.rs`'s `Dgm` — a `BTreeMap`-keyed
//! dispatcher over child indexes with its own structural RW lock — for
//! the routing shape, generalized from two fixed tiers to an arbitrary
//! number of numbered shard directories.

pub mod compact;
pub mod handle;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use crate::{
    aggregator::handle::ShardHandle,
    options::{AggregatorOptions, OpenOptions, PutOptions, RemoveOptions, WriteOptions},
    seqno::{SeqGen, Snapshot},
    shard::Shard,
    Result,
};

/// The DB-wide dispatcher: one `BTreeMap<lower_bound_key, ShardHandle>`
/// under its own RW lock, plus the shared [SeqGen] every shard's MVCC
/// overlay ticks against (§4.5, §5: "a snapshot pins the shard-local
/// overlay of every shard it visits at the seq value at snapshot-creation
/// time").
pub struct Aggregator {
    dir: PathBuf,
    opts: AggregatorOptions,
    seq_gen: Arc<SeqGen>,
    dispatcher: RwLock<std::collections::BTreeMap<Vec<u8>, Arc<ShardHandle>>>,
    next_shard_num: AtomicU64,
    gc_running: std::sync::atomic::AtomicBool,
}

impl Aggregator {
    pub fn open(dir: &Path, open_opts: OpenOptions, opts: AggregatorOptions) -> Result<Aggregator> {
        let exists = dir.exists();
        if exists && open_opts.error_if_exists {
            return err_at!(InvalidArgument, msg: "db already exists at {}", dir.display());
        }
        if !exists {
            if !open_opts.create_if_missing {
                return err_at!(NotFound, msg: "db directory missing: {}", dir.display());
            }
            err_at!(IOError, fs::create_dir_all(dir))?;
        }

        compact::recover_markers(dir)?;

        let seq_gen = SeqGen::new();
        let mut dispatcher = std::collections::BTreeMap::new();
        let mut max_num = 0u64;

        for entry in err_at!(IOError, fs::read_dir(dir))? {
            let entry = err_at!(IOError, entry)?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains('+') {
                continue; // already handled by recover_markers
            }
            // A `_a` / `_b` name marks a 1→2 split (§4.6 step 6): each
            // sibling is a real shard from the moment it is created, so
            // whatever it has on disk at crash time is internally
            // consistent and needs no special repair beyond registering
            // it like any other shard below.
            if let Ok(n) = name.trim_end_matches(['-', '+']).parse::<u64>() {
                max_num = max_num.max(n + 1);
            } else if let Some(digits) = name.split(['_']).next() {
                if let Ok(n) = digits.parse::<u64>() {
                    max_num = max_num.max(n + 1);
                }
            }

            let shard = Shard::open(&entry.path(), Arc::clone(&seq_gen))?;
            let (smallest, _largest) = shard.bounds();
            let handle = Arc::new(ShardHandle::with_shard(name, Arc::new(shard)));
            dispatcher.insert(smallest.unwrap_or_default(), handle);
        }

        if dispatcher.is_empty() {
            let name = "0".to_string();
            let shard = Shard::create(&dir.join(&name), Arc::clone(&seq_gen))?;
            let handle = Arc::new(ShardHandle::with_shard(name, Arc::new(shard)));
            dispatcher.insert(Vec::new(), handle);
            max_num = max_num.max(1);
        }

        Ok(Aggregator {
            dir: dir.to_path_buf(),
            opts,
            seq_gen,
            dispatcher: RwLock::new(dispatcher),
            next_shard_num: AtomicU64::new(max_num),
            gc_running: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Floor lookup on the dispatcher (§4.5 `findBestMatch`): the entry
    /// with the greatest lower-bound `<= key`.
    fn find_best_match(&self, key: &[u8]) -> Result<Arc<ShardHandle>> {
        loop {
            let dispatcher = self.dispatcher.read().unwrap();
            let handle = dispatcher
                .range(..=key.to_vec())
                .next_back()
                .map(|(_, h)| Arc::clone(h))
                .or_else(|| dispatcher.values().next().map(Arc::clone));
            drop(dispatcher);
            let handle = match handle {
                Some(h) => h,
                None => return err_at!(Corruption, msg: "empty dispatcher"),
            };
            if handle.is_dirty() {
                continue;
            }
            handle.bump_hits();
            return Ok(handle);
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8], opts: PutOptions) -> Result<()> {
        loop {
            let handle = self.find_best_match(key)?;
            if self.settle_compaction(&handle)? {
                continue;
            }
            if let Some(wrapper) = handle.compacting() {
                wrapper.put(key, value, opts)?;
                return Ok(());
            }
            let _g = handle.write_lock();
            let shard = handle.load(&self.dir, &self.seq_gen)?;
            if shard.put(key, value, opts)? {
                return Ok(());
            }
            self.begin_split(&handle, &shard)?;
        }
    }

    pub fn delete(&self, key: &[u8], opts: RemoveOptions) -> Result<()> {
        loop {
            let handle = self.find_best_match(key)?;
            if self.settle_compaction(&handle)? {
                continue;
            }
            if let Some(wrapper) = handle.compacting() {
                wrapper.remove(key, opts)?;
                return Ok(());
            }
            let _g = handle.write_lock();
            let shard = handle.load(&self.dir, &self.seq_gen)?;
            if shard.remove(key, opts)? {
                return Ok(());
            }
            self.begin_split(&handle, &shard)?;
        }
    }

    pub fn get(&self, key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        loop {
            let handle = self.find_best_match(key)?;
            if self.settle_compaction(&handle)? {
                continue;
            }
            if let Some(wrapper) = handle.compacting() {
                return wrapper.get(key, snapshot);
            }
            let _g = handle.read_lock();
            let shard = handle.load(&self.dir, &self.seq_gen)?;
            return shard.get(key, snapshot);
        }
    }

    /// Sort `records` by key and split the batch across shard
    /// boundaries (§4.5 "batched write"): the prefix belonging to the
    /// primary shard goes via `find_best_match(first_key)`, then each
    /// right neighbor claims its own prefix until the batch is
    /// exhausted.
    pub fn write(&self, mut records: Vec<(Vec<u8>, Vec<u8>, bool)>, opts: WriteOptions) -> Result<()> {
        records.sort_by(|a, b| a.0.cmp(&b.0));
        let mut start = 0;
        while start < records.len() {
            let handle = self.find_best_match(&records[start].0)?;
            let upper = self
                .dispatcher
                .read()
                .unwrap()
                .range(records[start].0.clone()..)
                .nth(1)
                .map(|(k, _)| k.clone());
            let end = match &upper {
                Some(bound) => records[start..].iter().position(|(k, _, _)| k >= bound).map(|i| start + i).unwrap_or(records.len()),
                None => records.len(),
            };

            if self.settle_compaction(&handle)? {
                continue;
            }
            if let Some(wrapper) = handle.compacting() {
                for (key, value, deleted) in &records[start..end] {
                    if *deleted {
                        wrapper.remove(key, RemoveOptions { sync: opts.sync })?;
                    } else {
                        wrapper.put(key, value, PutOptions { sync: opts.sync })?;
                    }
                }
                start = end;
                continue;
            }

            let _g = handle.write_lock();
            let shard = handle.load(&self.dir, &self.seq_gen)?;
            let slice = &records[start..end];
            if !shard.write(slice, opts)? {
                self.begin_split(&handle, &shard)?;
                continue; // retry this slice against the post-split routing
            }
            start = end;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<SeqGen> {
        Arc::clone(&self.seq_gen)
    }

    /// Start a background split of `handle`'s shard (§4.6 steps 1-3):
    /// the two product shards exist and take live traffic immediately,
    /// routed through the handle's [compact::Compacting1To2] wrapper
    /// until the background drain finishes.
    fn begin_split(&self, handle: &Arc<ShardHandle>, shard: &Arc<Shard>) -> Result<()> {
        let source_dir = self.dir.join(handle.dir_name());
        let wrapper = compact::Compacting1To2::begin(Arc::clone(shard), &source_dir, &self.seq_gen)?;
        handle.begin_compacting(wrapper)
    }

    /// If `handle` is mid-split and the background drain has finished,
    /// swap the dispatcher over to the two finished products and mark
    /// `handle` dirty (§4.5 "split handoff", §4.6 step 5). Returns
    /// `true` when a swap happened, so the caller re-resolves via
    /// `find_best_match` instead of using the now-stale `handle`.
    fn settle_compaction(&self, handle: &Arc<ShardHandle>) -> Result<bool> {
        let wrapper = match handle.compacting() {
            Some(w) if w.can_release() => w,
            _ => return Ok(false),
        };
        let _g = handle.write_lock();
        if handle.is_dirty() {
            // Another caller already settled this split while we waited
            // for the write lock; just signal a retry.
            return Ok(true);
        }
        let (a, b, split_key) = wrapper.finish()?;
        a.close()?;
        b.close()?;

        let num_a = self.next_shard_num.fetch_add(1, Ordering::SeqCst);
        let num_b = self.next_shard_num.fetch_add(1, Ordering::SeqCst);
        let name_a = num_a.to_string();
        let name_b = num_b.to_string();
        fs::remove_dir_all(self.dir.join(&name_a)).ok();
        fs::remove_dir_all(self.dir.join(&name_b)).ok();
        err_at!(IOError, fs::rename(a.dir(), self.dir.join(&name_a)))?;
        err_at!(IOError, fs::rename(b.dir(), self.dir.join(&name_b)))?;

        let source = handle.load(&self.dir, &self.seq_gen)?;
        let (lower_key, _) = source.bounds();
        let shard_a = Shard::open(&self.dir.join(&name_a), Arc::clone(&self.seq_gen))?;
        let shard_b = Shard::open(&self.dir.join(&name_b), Arc::clone(&self.seq_gen))?;
        let handle_a = Arc::new(ShardHandle::with_shard(name_a, Arc::new(shard_a)));
        let handle_b = Arc::new(ShardHandle::with_shard(name_b, Arc::new(shard_b)));

        handle.mark_dirty();
        handle.clear_compacting();
        let mut dispatcher = self.dispatcher.write().unwrap();
        dispatcher.insert(lower_key.unwrap_or_default(), handle_a);
        dispatcher.insert(split_key, handle_b);
        drop(dispatcher);
        fs::remove_dir_all(self.dir.join(handle.dir_name())).ok();
        Ok(true)
    }

    /// Walk the dispatcher once, merging consecutive non-dirty,
    /// non-compacting neighbors whose combined disk usage is below
    /// `merge_usage_fraction` of the shard cap, then close the
    /// least-hit shards above `max_dbs`, halving every survivor's hit
    /// counter (§4.5 "GC loop").
    pub fn run_gc(&self) -> Result<()> {
        if self
            .gc_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.run_gc_inner();
        self.gc_running.store(false, Ordering::SeqCst);
        result
    }

    fn run_gc_inner(&self) -> Result<()> {
        let operating_dbs = self.dispatcher.read().unwrap().len();
        if operating_dbs <= self.opts.max_dbs {
            return Ok(());
        }

        let entries: Vec<(Vec<u8>, Arc<ShardHandle>)> =
            self.dispatcher.read().unwrap().iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();

        let mut i = 0;
        while i + 1 < entries.len() {
            let (key_a, handle_a) = &entries[i];
            let (_, handle_b) = &entries[i + 1];
            if handle_a.is_dirty() || handle_b.is_dirty() || handle_a.compacting().is_some() || handle_b.compacting().is_some() {
                i += 1;
                continue;
            }
            let shard_a = handle_a.load(&self.dir, &self.seq_gen)?;
            let shard_b = handle_b.load(&self.dir, &self.seq_gen)?;
            let combined = shard_a.disk_usage() + shard_b.disk_usage();
            let threshold = (crate::shard::SHARD_CAP as f64 * self.opts.merge_usage_fraction) as u64;
            if combined < threshold {
                let (product, product_name) = compact::merge(
                    &self.dir,
                    &shard_a,
                    handle_a.dir_name(),
                    &shard_b,
                    handle_b.dir_name(),
                    &self.seq_gen,
                )?;
                handle_a.mark_dirty();
                handle_b.mark_dirty();
                let merged_handle = Arc::new(ShardHandle::with_shard(product_name, Arc::new(product)));
                let mut dispatcher = self.dispatcher.write().unwrap();
                dispatcher.insert(key_a.clone(), merged_handle);
                let key_b = &entries[i + 1].0;
                dispatcher.remove(key_b);
                i += 2;
            } else {
                i += 1;
            }
        }

        let snapshot: Vec<Arc<ShardHandle>> =
            self.dispatcher.read().unwrap().values().cloned().collect();
        if snapshot.len() > self.opts.max_dbs {
            let mut by_hits: Vec<&Arc<ShardHandle>> = snapshot.iter().collect();
            by_hits.sort_by_key(|h| h.hits());
            for handle in by_hits.iter().take(snapshot.len() - self.opts.max_dbs) {
                if handle.hits() < self.opts.close_hit_threshold {
                    handle.unload()?;
                }
            }
        }
        for handle in &snapshot {
            handle.halve_hits();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("levidb-aggregator-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn open_creates_a_default_shard_and_routes_to_it() {
        let dir = scratch_dir("basic");
        fs::remove_dir_all(&dir).ok();
        let agg = Aggregator::open(
            &dir,
            OpenOptions { create_if_missing: true, error_if_exists: false },
            AggregatorOptions::default(),
        )
        .unwrap();

        agg.put(b"hello", b"world", PutOptions::default()).unwrap();
        assert_eq!(agg.get(b"hello", None).unwrap(), Some(b"world".to_vec()));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_then_get_returns_none() {
        let dir = scratch_dir("delete");
        fs::remove_dir_all(&dir).ok();
        let agg = Aggregator::open(
            &dir,
            OpenOptions { create_if_missing: true, error_if_exists: false },
            AggregatorOptions::default(),
        )
        .unwrap();

        agg.put(b"k", b"v", PutOptions::default()).unwrap();
        agg.delete(b"k", RemoveOptions::default()).unwrap();
        assert_eq!(agg.get(b"k", None).unwrap(), None);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn batched_write_round_trips() {
        let dir = scratch_dir("batch");
        fs::remove_dir_all(&dir).ok();
        let agg = Aggregator::open(
            &dir,
            OpenOptions { create_if_missing: true, error_if_exists: false },
            AggregatorOptions::default(),
        )
        .unwrap();

        let records = vec![
            (b"c".to_vec(), b"3".to_vec(), false),
            (b"a".to_vec(), b"1".to_vec(), false),
            (b"b".to_vec(), b"2".to_vec(), false),
        ];
        agg.write(records, WriteOptions::default()).unwrap();
        assert_eq!(agg.get(b"a", None).unwrap(), Some(b"1".to_vec()));
        assert_eq!(agg.get(b"c", None).unwrap(), Some(b"3".to_vec()));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reopen_recovers_existing_shards() {
        let dir = scratch_dir("reopen");
        fs::remove_dir_all(&dir).ok();
        {
            let agg = Aggregator::open(
                &dir,
                OpenOptions { create_if_missing: true, error_if_exists: false },
                AggregatorOptions::default(),
            )
            .unwrap();
            agg.put(b"k", b"v", PutOptions::default()).unwrap();
        }
        let agg = Aggregator::open(
            &dir,
            OpenOptions { create_if_missing: false, error_if_exists: false },
            AggregatorOptions::default(),
        )
        .unwrap();
        assert_eq!(agg.get(b"k", None).unwrap(), Some(b"v".to_vec()));

        fs::remove_dir_all(&dir).ok();
    }
}
