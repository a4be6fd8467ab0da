//! Online 1→2 split and 2→1 merge compaction (§4.6).
//!
//! A 1→2 split is backgrounded: [Compacting1To2::begin] opens the two
//! empty product shards up front and hands them straight to the caller,
//! then spawns a thread that drains the source's remaining entries into
//! them. Until that thread finishes, direct puts/removes land in the
//! products immediately and record the touched key in an ignore set so
//! the background drain skips anything a live writer already
//! superseded; reads check the products first and fall back to the
//! source. [Compacting1To2::can_release] is the quiescence check the
//! aggregator polls before swapping the dispatcher over to the
//! finished products (§4.6 steps 3-5).
//!
//! A 2→1 merge copies both non-dirty sources into the product on two
//! joined threads (§4.6 step 2); since both sources are required to
//! already be releasable before a merge starts, there is no live
//! traffic to interleave with the copy itself.

use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use crate::{
    error::Error,
    options::{PutOptions, RemoveOptions, WriteOptions},
    seqno::{SeqGen, Snapshot},
    shard::Shard,
    Result,
};

/// Wraps a shard mid-split: `a`/`b` are already-open product shards
/// taking live traffic while a background thread drains the rest of
/// `source`'s entries into them (§4.6 steps 3-5).
pub struct Compacting1To2 {
    source: Arc<Shard>,
    a: Arc<Shard>,
    b: Arc<Shard>,
    split_key: Vec<u8>,
    ignore: Mutex<HashSet<Vec<u8>>>,
    inflight: AtomicUsize,
    done: AtomicBool,
    error: Mutex<Option<Error>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Compacting1To2 {
    /// Count `source`'s live entries, pick the midpoint key, create the
    /// two empty sibling shards `<dir>_a` / `<dir>_b`, and spawn the
    /// background copier (§4.6 steps 1-3).
    pub fn begin(source: Arc<Shard>, source_dir: &Path, seq_gen: &Arc<SeqGen>) -> Result<Arc<Compacting1To2>> {
        let entries = source.live_entries()?;
        let mid = entries.len() / 2;
        let split_key = entries.get(mid).map(|(k, _)| k.clone()).unwrap_or_default();

        let dir_a = sibling_dir(source_dir, "_a");
        let dir_b = sibling_dir(source_dir, "_b");
        fs::remove_dir_all(&dir_a).ok();
        fs::remove_dir_all(&dir_b).ok();
        let a = Arc::new(Shard::create(&dir_a, Arc::clone(seq_gen))?);
        let b = Arc::new(Shard::create(&dir_b, Arc::clone(seq_gen))?);
        log::info!(
            "starting background split of {} ({} entries) at {:?}",
            source_dir.display(),
            entries.len(),
            split_key
        );

        let wrapper = Arc::new(Compacting1To2 {
            source,
            a: Arc::clone(&a),
            b: Arc::clone(&b),
            split_key,
            ignore: Mutex::new(HashSet::new()),
            inflight: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let bg = Arc::clone(&wrapper);
        let handle = thread::spawn(move || bg.run_copy(entries));
        *wrapper.worker.lock().unwrap() = Some(handle);
        Ok(wrapper)
    }

    fn run_copy(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) {
        for (key, value) in entries {
            if self.ignore.lock().unwrap().contains(&key) {
                continue; // a direct write already placed the live value
            }
            if let Err(e) = self.target(&key).put(&key, &value, PutOptions::default()) {
                *self.error.lock().unwrap() = Some(e);
                break;
            }
        }
        self.done.store(true, Ordering::SeqCst);
    }

    fn target(&self, key: &[u8]) -> &Arc<Shard> {
        if key < self.split_key.as_slice() {
            &self.a
        } else {
            &self.b
        }
    }

    /// Direct write during compaction: goes straight to the owning
    /// product and is marked ignored so the background drain never
    /// overwrites it with the source's stale copy.
    pub fn put(&self, key: &[u8], value: &[u8], opts: PutOptions) -> Result<bool> {
        self.ignore.lock().unwrap().insert(key.to_vec());
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.target(key).put(key, value, opts);
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub fn remove(&self, key: &[u8], opts: RemoveOptions) -> Result<bool> {
        self.ignore.lock().unwrap().insert(key.to_vec());
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.target(key).remove(key, opts);
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Check the owning product first, then fall back to the source
    /// for entries the background drain has not reached yet.
    pub fn get(&self, key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let found = self.target(key).get(key, snapshot);
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        match found? {
            Some(value) => Ok(Some(value)),
            None => self.source.get(key, snapshot),
        }
    }

    /// §4.6 step 5: the background drain is done and no direct
    /// operation is still touching the products.
    pub fn can_release(&self) -> bool {
        self.done.load(Ordering::SeqCst) && self.inflight.load(Ordering::SeqCst) == 0
    }

    /// Join the copier, surface any error it recorded, and hand back
    /// the two finished products plus the boundary key. Only valid to
    /// call once [Self::can_release] is `true`.
    pub fn finish(&self) -> Result<(Arc<Shard>, Arc<Shard>, Vec<u8>)> {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.join().ok();
        }
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok((Arc::clone(&self.a), Arc::clone(&self.b), self.split_key.clone()))
    }
}

fn sibling_dir(source_dir: &Path, suffix: &str) -> std::path::PathBuf {
    let name = source_dir.file_name().unwrap_or_default().to_string_lossy().into_owned();
    source_dir.with_file_name(format!("{}{}", name, suffix))
}

/// Merge `a` and `b` into one product shard at `<root>/<a_name>+<b_name>`,
/// renamed to `...-` once committed (§4.6 steps 1-3; crash recovery is
/// handled by [recover_markers] on aggregator open). `a` and `b` are
/// copied on their own joined threads (§4.6 step 2's "spawn two tasks");
/// neither source takes live traffic once the aggregator has routed
/// here, so there is nothing to interleave with.
pub fn merge(
    root: &Path,
    a: &Shard,
    a_name: &str,
    b: &Shard,
    b_name: &str,
    seq_gen: &Arc<SeqGen>,
) -> Result<(Shard, String)> {
    let product_name = format!("{}+{}", a_name, b_name);
    let product_dir = root.join(&product_name);
    fs::remove_dir_all(&product_dir).ok();
    log::info!("merging {} + {} into {}", a_name, b_name, product_name);

    let product = Arc::new(Shard::create(&product_dir, Arc::clone(seq_gen))?);
    let a_entries = a.live_entries()?;
    let b_entries = b.live_entries()?;

    let product_a = Arc::clone(&product);
    let task_a = thread::spawn(move || write_batch(&product_a, a_entries));
    let task_b = thread::spawn({
        let product_b = Arc::clone(&product);
        move || write_batch(&product_b, b_entries)
    });
    let result_a = task_a.join().map_err(|_| join_panicked())?;
    let result_b = task_b.join().map_err(|_| join_panicked())?;
    result_a?;
    result_b?;

    product.close()?;

    let committed_name = format!("{}-", product_name);
    let committed_dir = root.join(&committed_name);
    fs::remove_dir_all(&committed_dir).ok();
    err_at!(IOError, fs::rename(&product_dir, &committed_dir))?;

    let product = Shard::open(&committed_dir, Arc::clone(seq_gen))?;
    log::info!("merge committed: {}", committed_name);
    Ok((product, committed_name))
}

fn write_batch(product: &Shard, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
    for (key, value) in entries {
        product.write(&[(key, value, false)], WriteOptions { sync: false, try_compress: false })?;
    }
    Ok(())
}

fn join_panicked() -> Error {
    Error::new(crate::error::ErrorKind::IOError, "compact::merge", "copy thread panicked")
}

/// On aggregator open, clean up any compaction that crashed mid-flight
/// (§4.5 "crash recovery", §4.6 step 4's "reopen" clause):
/// - `<a>+<b>` with no trailing `-`: the merge never committed, delete it.
/// - `<a>+<b>-`: the merge committed, the sources `<a>`/`<b>` are
///   leftover and get deleted.
/// - `<r>_a` / `<r>_b`: a split was in progress; both are left in place
///   for the caller to re-register (each is a complete, self-contained
///   shard the moment it is created by [Compacting1To2::begin]).
pub fn recover_markers(root: &Path) -> Result<()> {
    let mut entries = Vec::new();
    for entry in err_at!(IOError, fs::read_dir(root))? {
        let entry = err_at!(IOError, entry)?;
        if entry.path().is_dir() {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    for name in &entries {
        if let Some(stripped) = name.strip_suffix('-') {
            if let Some((a, b)) = stripped.split_once('+') {
                log::info!("recovering committed merge {}: deleting sources {}, {}", name, a, b);
                fs::remove_dir_all(root.join(a)).ok();
                fs::remove_dir_all(root.join(b)).ok();
            }
        } else if name.contains('+') {
            log::warn!("recovering crashed merge: deleting incomplete product {}", name);
            fs::remove_dir_all(root.join(name)).ok();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::PutOptions;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("levidb-compact-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn split_partitions_keys_and_background_drain_completes() {
        let dir = scratch_dir("split");
        fs::remove_dir_all(&dir).ok();
        let seq_gen = SeqGen::new();
        let shard = Arc::new(Shard::create(&dir, seq_gen.clone()).unwrap());
        for k in [b"a", b"b", b"c", b"d"] {
            shard.put(k, b"v", PutOptions::default()).unwrap();
        }

        let wrapper = Compacting1To2::begin(Arc::clone(&shard), &dir, &seq_gen).unwrap();
        while !wrapper.can_release() {
            std::thread::yield_now();
        }
        let (a, b, _split_key) = wrapper.finish().unwrap();
        let a_entries = a.live_entries().unwrap();
        let b_entries = b.live_entries().unwrap();
        assert_eq!(a_entries.len() + b_entries.len(), 4);

        fs::remove_dir_all(&dir).ok();
        fs::remove_dir_all(sibling_dir(&dir, "_a")).ok();
        fs::remove_dir_all(sibling_dir(&dir, "_b")).ok();
    }

    #[test]
    fn split_direct_write_during_compaction_wins_over_background_drain() {
        let dir = scratch_dir("split-live");
        fs::remove_dir_all(&dir).ok();
        let seq_gen = SeqGen::new();
        let shard = Arc::new(Shard::create(&dir, seq_gen.clone()).unwrap());
        shard.put(b"a", b"stale", PutOptions::default()).unwrap();
        shard.put(b"z", b"stale", PutOptions::default()).unwrap();

        let wrapper = Compacting1To2::begin(Arc::clone(&shard), &dir, &seq_gen).unwrap();
        wrapper.put(b"a", b"fresh", PutOptions::default()).unwrap();
        while !wrapper.can_release() {
            std::thread::yield_now();
        }
        assert_eq!(wrapper.get(b"a", None).unwrap(), Some(b"fresh".to_vec()));
        assert_eq!(wrapper.get(b"z", None).unwrap(), Some(b"stale".to_vec()));

        let (a, b, _) = wrapper.finish().unwrap();
        a.close().ok();
        b.close().ok();
        fs::remove_dir_all(&dir).ok();
        fs::remove_dir_all(sibling_dir(&dir, "_a")).ok();
        fs::remove_dir_all(sibling_dir(&dir, "_b")).ok();
    }

    #[test]
    fn merge_combines_both_sources() {
        let root = scratch_dir("merge-root");
        fs::remove_dir_all(&root).ok();
        fs::create_dir_all(&root).unwrap();
        let seq_gen = SeqGen::new();

        let a = Shard::create(&root.join("0"), seq_gen.clone()).unwrap();
        a.put(b"a", b"1", PutOptions::default()).unwrap();
        let b = Shard::create(&root.join("1"), seq_gen.clone()).unwrap();
        b.put(b"z", b"2", PutOptions::default()).unwrap();

        let (product, name) = merge(&root, &a, "0", &b, "1", &seq_gen).unwrap();
        assert!(name.ends_with('-'));
        assert_eq!(product.get(b"a", None).unwrap(), Some(b"1".to_vec()));
        assert_eq!(product.get(b"z", None).unwrap(), Some(b"2".to_vec()));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn recover_markers_deletes_incomplete_merge_product() {
        let root = scratch_dir("recover");
        fs::remove_dir_all(&root).ok();
        fs::create_dir_all(root.join("0+1")).unwrap();
        recover_markers(&root).unwrap();
        assert!(!root.join("0+1").exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn recover_markers_deletes_sources_after_committed_merge() {
        let root = scratch_dir("recover2");
        fs::remove_dir_all(&root).ok();
        fs::create_dir_all(root.join("0")).unwrap();
        fs::create_dir_all(root.join("1")).unwrap();
        fs::create_dir_all(root.join("0+1-")).unwrap();
        recover_markers(&root).unwrap();
        assert!(!root.join("0").exists());
        assert!(!root.join("1").exists());
        assert!(root.join("0+1-").exists());
        fs::remove_dir_all(&root).ok();
    }
}
