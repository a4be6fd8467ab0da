//! Binds one [crate::index::BitDegradeIndex] to one log file under a
//! single read/write lock (§4.4), grounded on
//! `original_source/src/db_impl.h` for the put/remove/write/get/scan
//! shape and on `dgm.rs`'s single-writer-wrapped-index idiom for
//! reporting "this container is full" as data instead of an exception.

pub mod keeper;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    arena::Arena,
    error::Outcome,
    index::{mvcc::DELETED, BitDegradeIndex, IndexOverlay, ScanIterator},
    log::{cache::RecordCache, reader, LogWriter, RecordCursor, RecoveryIterator, TableIterator},
    options::{PutOptions, RemoveOptions, ScanOptions, WriteOptions},
    seqno::{SeqGen, Snapshot},
    shard::keeper::Keeper,
    util, Result,
};
use std::sync::{Arc, RwLock};

/// A shard's log is capped at 4 GiB (§1); `put`/`remove`/`write`
/// returning `false` signals the aggregator to split this shard.
pub const SHARD_CAP: u64 = 4 * 1024 * 1024 * 1024;

/// A compressed group is kept only if it saves at least this fraction
/// of the uncompressed concatenation (§4.4, §6).
const MIN_COMPRESS_SAVINGS: f64 = 1.0 / 8.0;

struct Bounds {
    smallest: Option<Vec<u8>>,
    largest: Option<Vec<u8>>,
}

impl Bounds {
    fn observe(&mut self, key: &[u8]) {
        if self.smallest.as_deref().map(|s| key < s).unwrap_or(true) {
            self.smallest = Some(key.to_vec());
        }
        if self.largest.as_deref().map(|l| key > l).unwrap_or(true) {
            self.largest = Some(key.to_vec());
        }
    }
}

/// One shard: a log file, a bit-degrade index over it, and the MVCC
/// overlay sitting in front of the index (§4.3). All operations take
/// `lock` in the mode matching their contract with the caller (§5:
/// "within one shard, all operations linearize on the shard's RW lock").
pub struct Shard {
    dir: PathBuf,
    lock: RwLock<()>,
    log_writer: LogWriter,
    log_file: fs::File,
    index: BitDegradeIndex,
    overlay: IndexOverlay,
    cache: RecordCache,
    seq_gen: Arc<SeqGen>,
    bounds: Mutex<Bounds>,
    compress_scratch: Arena,
}

fn data_path(dir: &Path) -> PathBuf {
    dir.join("data")
}
fn index_path(dir: &Path) -> PathBuf {
    dir.join("index")
}
fn keeper_path(dir: &Path) -> PathBuf {
    dir.join("keeper")
}

impl Shard {
    /// Create a brand-new, empty shard directory at `dir`.
    pub fn create(dir: &Path, seq_gen: Arc<SeqGen>) -> Result<Shard> {
        err_at!(IOError, fs::create_dir_all(dir))?;
        let log_writer = LogWriter::create(&data_path(dir))?;
        let log_file = util::open_file_r(&data_path(dir))?;
        let index = BitDegradeIndex::create(&index_path(dir))?;
        Ok(Shard {
            dir: dir.to_path_buf(),
            lock: RwLock::new(()),
            log_writer,
            log_file,
            index,
            overlay: IndexOverlay::new(),
            cache: RecordCache::new(),
            seq_gen,
            bounds: Mutex::new(Bounds { smallest: None, largest: None }),
            compress_scratch: Arena::new(),
        })
    }

    /// Open an existing shard directory, repairing it if the keeper
    /// sidecar is missing or the log reports corruption (§4.4).
    pub fn open(dir: &Path, seq_gen: Arc<SeqGen>) -> Result<Shard> {
        let log_file = util::open_file_r(&data_path(dir))?;
        let log_len = err_at!(IOError, log_file.metadata())?.len();

        let keeper = Keeper::load(&keeper_path(dir));
        let index = match (keeper, index_path(dir).exists()) {
            (Some(_), true) => match BitDegradeIndex::open(&index_path(dir)) {
                Ok(idx) => idx,
                Err(err) => {
                    log::warn!("shard {}: index open failed ({}), rebuilding", dir.display(), err);
                    Self::rebuild_index(dir, &log_file, log_len)?
                }
            },
            _ => {
                log::info!("shard {}: no clean keeper, rebuilding index from log", dir.display());
                Self::rebuild_index(dir, &log_file, log_len)?
            }
        };

        let mut bounds = Bounds { smallest: None, largest: None };
        {
            let file = util::open_file_r(&data_path(dir))?;
            for item in TableIterator::new(&file, log_len) {
                if let Ok((key, _)) = item {
                    bounds.observe(&key);
                }
            }
        }

        let log_writer = LogWriter::reopen(&data_path(dir), log_len)?;
        Ok(Shard {
            dir: dir.to_path_buf(),
            lock: RwLock::new(()),
            log_writer,
            log_file,
            index,
            overlay: IndexOverlay::new(),
            cache: RecordCache::new(),
            seq_gen,
            bounds: Mutex::new(bounds),
            compress_scratch: Arena::new(),
        })
    }

    /// Rebuild the index from scratch by scanning the log with the
    /// table iterator (§4.2 "the aggregator's per-shard repair path
    /// rebuilds the index from the log"). If the log itself reports
    /// corruption, fall back to the recovery iterator and accept the
    /// prefix it could salvage.
    fn rebuild_index(dir: &Path, log_file: &fs::File, log_len: u64) -> Result<BitDegradeIndex> {
        fs::remove_file(index_path(dir)).ok();
        let index = BitDegradeIndex::create(&index_path(dir))?;
        let mut keys: std::collections::HashMap<u32, Vec<u8>> = std::collections::HashMap::new();
        let read_key = |offset: u32| -> Result<Vec<u8>> {
            Ok(keys.get(&offset).cloned().unwrap_or_default())
        };

        let table_ok = {
            let mut ok = true;
            for item in TableIterator::new(log_file, log_len) {
                match item {
                    Ok((key, offset)) => {
                        keys.entry(offset).or_insert_with(|| key.clone());
                        index.insert(&key, offset, &read_key)?;
                    }
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            ok
        };
        if table_ok {
            return Ok(index);
        }

        // Log itself is corrupt: replay what the recovery iterator can
        // salvage into a fresh index (§4.4's "open a scratch shard and
        // replay via the recovery iterator" path, collapsed here since
        // the index alone — not the log — needed rebuilding).
        log::warn!("shard {}: log table scan hit corruption, falling back to recovery replay", dir.display());
        fs::remove_file(index_path(dir)).ok();
        let index = BitDegradeIndex::create(&index_path(dir))?;
        let mut keys: std::collections::HashMap<u32, Vec<u8>> = std::collections::HashMap::new();
        let read_key = |offset: u32| -> Result<Vec<u8>> {
            Ok(keys.get(&offset).cloned().unwrap_or_default())
        };
        let iter = RecoveryIterator::new(log_file, log_len, |e, off| {
            log::warn!("shard {}: dropping corrupt record at offset {}: {}", dir.display(), off, e);
        });
        let mut recovered = 0usize;
        for (key, offset) in iter {
            keys.entry(offset).or_insert_with(|| key.clone());
            index.insert(&key, offset, &read_key)?;
            recovered += 1;
        }
        log::info!("shard {}: recovered {} records", dir.display(), recovered);
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_len(&self) -> Result<u64> {
        Ok(err_at!(IOError, self.log_file.metadata())?.len())
    }

    fn read_key(&self, offset: u32) -> Result<Vec<u8>> {
        let len = self.log_len()?;
        let cursor = RecordCursor::open(&self.log_file, offset, len, &self.cache)?;
        Ok(cursor.key().to_vec())
    }

    /// `get(key)` under `snapshot`'s seq, if given, else the current
    /// newest seq. Checks the MVCC overlay first, then the persistent
    /// index, confirming the candidate against the log (§4.2, §4.3).
    pub fn get(&self, key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        let _g = self.lock.read().unwrap();
        let seq = snapshot.map(Snapshot::seq_num).unwrap_or_else(|| self.seq_gen.newest_issued());

        if let Some(offset) = self.overlay.find(key, seq) {
            if offset == DELETED {
                return Ok(None);
            }
            return self.fetch_value(key, offset);
        }

        match self.index.find(key)? {
            Some(ptr) => self.fetch_value(key, ptr.record_offset()),
            None => Ok(None),
        }
    }

    fn fetch_value(&self, key: &[u8], offset: u32) -> Result<Option<Vec<u8>>> {
        let len = self.log_len()?;
        let cursor = RecordCursor::open(&self.log_file, offset, len, &self.cache)?;
        match &cursor {
            RecordCursor::Normal { .. } => {
                if cursor.key() != key {
                    return Ok(None);
                }
                if cursor.is_deleted() {
                    return Ok(None);
                }
                Ok(Some(cursor.value().to_vec()))
            }
            RecordCursor::Group { .. } => {
                cursor.seek_to_first();
                if !cursor.seek(key) {
                    return Ok(None);
                }
                Ok(Some(cursor.value().to_vec()))
            }
        }
    }

    /// `true` on success; `false` (not an error, §4.4) when the shard
    /// has reached its log size cap and the aggregator should split it.
    pub fn put(&self, key: &[u8], value: &[u8], opts: PutOptions) -> Result<bool> {
        let _g = self.lock.write().unwrap();
        if self.log_writer.len() >= SHARD_CAP {
            return Ok(false);
        }
        let offset = match self.log_writer.add_record(key, value)? {
            Outcome::Done(offset) => offset,
            Outcome::Overflow(_) => return Ok(false),
        };
        if opts.sync {
            self.log_writer.sync()?;
        }
        self.seq_gen.unique_seq();
        self.overlay.record(&self.seq_gen, key.to_vec(), offset);
        self.bounds.lock().unwrap().observe(key);
        self.drain_overlay()?;
        Ok(true)
    }

    pub fn remove(&self, key: &[u8], opts: RemoveOptions) -> Result<bool> {
        let _g = self.lock.write().unwrap();
        if self.log_writer.len() >= SHARD_CAP {
            return Ok(false);
        }
        match self.log_writer.add_record_for_del(key)? {
            Outcome::Done(_) => {}
            Outcome::Overflow(_) => return Ok(false),
        };
        if opts.sync {
            self.log_writer.sync()?;
        }
        self.seq_gen.unique_seq();
        self.overlay.record(&self.seq_gen, key.to_vec(), DELETED);
        self.drain_overlay()?;
        Ok(true)
    }

    /// Batched write of `(key, value, is_deletion)` triples. With
    /// `opts.try_compress`, attempts one compressed group first,
    /// falling back to per-entry normal records if it doesn't save at
    /// least 1/8 of the uncompressed size (§4.4, §6).
    pub fn write(&self, records: &[(Vec<u8>, Vec<u8>, bool)], opts: WriteOptions) -> Result<bool> {
        let _g = self.lock.write().unwrap();
        if records.is_empty() {
            return Ok(true);
        }
        if self.log_writer.len() >= SHARD_CAP {
            return Ok(false);
        }

        let can_compress = opts.try_compress && records.iter().all(|(_, _, del)| !del);
        if can_compress {
            let entries: Vec<(Vec<u8>, Vec<u8>)> =
                records.iter().map(|(k, v, _)| (k.clone(), v.clone())).collect();
            let uncompressed_size: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
            let payload = reader::build_compressed_payload(&entries, &self.compress_scratch)?;
            let savings = 1.0 - (payload.len() as f64 / uncompressed_size.max(1) as f64);
            if savings >= MIN_COMPRESS_SAVINGS {
                let offset = match self.log_writer.add_compressed_records(&payload)? {
                    Outcome::Done(offset) => offset,
                    Outcome::Overflow(_) => return Ok(false),
                };
                // Every member shares the group's offset (§4.1); the
                // index later marks each member's slot "special" only
                // once it is actually materialized into the trie via
                // `drain_overlay`, matching the immediate-write path's
                // grouping semantics while keeping deferral uniform.
                for (key, _) in &entries {
                    self.seq_gen.unique_seq();
                    self.overlay.record(&self.seq_gen, key.clone(), offset);
                    self.bounds.lock().unwrap().observe(key);
                }
                self.drain_overlay()?;
                if opts.sync {
                    self.log_writer.sync()?;
                }
                return Ok(true);
            }
        }

        let del_flags: Vec<bool> = records.iter().map(|(_, _, del)| *del).collect();
        let kv: Vec<(Vec<u8>, Vec<u8>)> = records.iter().map(|(k, v, _)| (k.clone(), v.clone())).collect();
        let offsets = match self.log_writer.add_records_may_del(&kv, &del_flags)? {
            Outcome::Done(offsets) => offsets,
            Outcome::Overflow(_) => return Ok(false),
        };
        for ((key, _, del), offset) in records.iter().zip(offsets) {
            self.seq_gen.unique_seq();
            let stored = if *del { DELETED } else { offset };
            self.overlay.record(&self.seq_gen, key.clone(), stored);
            self.bounds.lock().unwrap().observe(key);
        }
        if opts.sync {
            self.log_writer.sync()?;
        }
        self.drain_overlay()?;
        Ok(true)
    }

    /// Fold every overlay bundle no live snapshot still needs into the
    /// persistent index (§4.3). A deletion unlinks the key from the
    /// trie outright rather than pinning a tombstone offset in place —
    /// a simplification of §4.2's "special" slot-pinning, acceptable
    /// since lookups always re-confirm candidates against the log.
    fn drain_overlay(&self) -> Result<()> {
        if let Some(folded) = self.overlay.try_apply_pending(&self.seq_gen) {
            for (key, offset) in folded {
                if offset == DELETED {
                    self.index.remove(&key, &|o| self.read_key(o))?;
                } else {
                    self.index.insert(&key, offset, &|o| self.read_key(o))?;
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.seq_gen.snapshot()
    }

    /// An ordered cursor over candidate keys (§4.2); callers confirm
    /// each candidate the same way `get` does.
    pub fn scan(&self, _opts: ScanOptions) -> ScanIterator<'_> {
        ScanIterator::new(&self.index, Box::new(move |o| self.read_key(o)))
    }

    /// Materialize every live `(key, value)` pair in ascending key
    /// order, confirming each scan candidate against the log the same
    /// way `get` does and dropping tombstones. Used by compaction
    /// (§4.6), which needs a plain ordered sequence of live entries
    /// rather than a cursor over candidates.
    pub fn live_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let _g = self.lock.read().unwrap();
        let mut out = Vec::new();
        let mut iter = ScanIterator::new(&self.index, Box::new(move |o| self.read_key(o)));
        iter.seek_to_first()?;
        while let Some((key, ptr)) = iter.current().map(|(k, p)| (k.to_vec(), p)) {
            if let Some(value) = self.fetch_value(&key, ptr.record_offset())? {
                out.push((key, value));
            }
            if !iter.next()? {
                break;
            }
        }
        Ok(out)
    }

    /// Smallest/largest key observed so far, used by the aggregator to
    /// register this shard's lower bound and by compaction to pick a
    /// split midpoint (§4.5, §4.6).
    pub fn bounds(&self) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
        let b = self.bounds.lock().unwrap();
        (b.smallest.clone(), b.largest.clone())
    }

    pub fn disk_usage(&self) -> u64 {
        self.log_writer.len()
    }

    /// Flush and fsync the log, msync the index, and rewrite the keeper
    /// sidecar (§4.4, §6). Called on shard close.
    pub fn close(&self) -> Result<()> {
        let _g = self.lock.write().unwrap();
        self.log_writer.sync()?;
        self.index.sync()?;
        let (smallest, largest) = self.bounds();
        let keeper = Keeper::new(0, smallest.unwrap_or_default(), largest.unwrap_or_default());
        keeper.store(&keeper_path(&self.dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("levidb-shard-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = scratch_dir("basic");
        fs::remove_dir_all(&dir).ok();
        let seq_gen = SeqGen::new();
        let shard = Shard::create(&dir, seq_gen).unwrap();

        assert!(shard.put(b"alpha", b"1", PutOptions::default()).unwrap());
        assert!(shard.put(b"beta", b"2", PutOptions::default()).unwrap());
        assert_eq!(shard.get(b"alpha", None).unwrap(), Some(b"1".to_vec()));
        assert_eq!(shard.get(b"missing", None).unwrap(), None);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn remove_then_get_returns_none() {
        let dir = scratch_dir("remove");
        fs::remove_dir_all(&dir).ok();
        let seq_gen = SeqGen::new();
        let shard = Shard::create(&dir, seq_gen).unwrap();

        shard.put(b"k", b"v", PutOptions::default()).unwrap();
        shard.remove(b"k", RemoveOptions::default()).unwrap();
        assert_eq!(shard.get(b"k", None).unwrap(), None);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn compressed_write_round_trips() {
        let dir = scratch_dir("write");
        fs::remove_dir_all(&dir).ok();
        let seq_gen = SeqGen::new();
        let shard = Shard::create(&dir, seq_gen).unwrap();

        let records = vec![
            (b"a".to_vec(), b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec(), false),
            (b"b".to_vec(), b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_vec(), false),
            (b"c".to_vec(), b"cccccccccccccccccccccccccccccccc".to_vec(), false),
        ];
        assert!(shard.write(&records, WriteOptions::default()).unwrap());
        assert_eq!(shard.get(b"b", None).unwrap(), Some(b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_vec()));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reopen_after_close_recovers_state() {
        let dir = scratch_dir("reopen");
        fs::remove_dir_all(&dir).ok();
        let seq_gen = SeqGen::new();
        {
            let shard = Shard::create(&dir, seq_gen.clone()).unwrap();
            shard.put(b"k", b"v", PutOptions::default()).unwrap();
            shard.close().unwrap();
        }
        let reopened = Shard::open(&dir, seq_gen).unwrap();
        assert_eq!(reopened.get(b"k", None).unwrap(), Some(b"v".to_vec()));
        fs::remove_dir_all(&dir).ok();
    }
}
