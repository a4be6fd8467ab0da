//! The bit-degrade index: a page-packed crit-bit trie over a
//! memory-mapped file, grounded on `original_source/src/index_impl.h`
//! for the descend/split/free-list algorithm and on `spinlock.rs` +
//! `gate.rs` for the "typed view over a shared byte slice, guarded by
//! per-page locks" concurrency idiom this crate generalizes to mmap
//! (§9 design notes: "an index page is a typed view over a 4 KiB
//! region of a shared byte slice").
//!
//! Mutating an mmap'd page through a shared reference is inherently
//! unsafe in Rust; its soundness here rests on the invariant that every
//! access to page `p`'s bytes holds `locks.page(p)`'s read or write
//! guard for the duration of that access, and that `mmap` itself is
//! only remapped while holding `mmap`'s write lock (which every page
//! access also holds, for reading, for its own duration) — this is the
//! same two-level (global + per-page) locking scheme §4.2 specifies.
//! `find` takes only `mmap`'s read lock and a brief per-page read lock
//! per page visited, so lookups against different pages run
//! concurrently with each other; `insert`/`remove` still serialize all
//! structural change behind `mmap`'s write lock (the page write locks
//! they also take mark which page is mid-mutation, matching §9's
//! invariant, even though a single in-process writer at a time is the
//! only case this crate's callers ever produce — `Shard` already
//! serializes its own writes).

use std::{fs, sync::RwLock};

use memmap2::MmapMut;

use crate::{
    index::{
        lock::PageLockTable,
        page::{diff_discriminator, CritPtr, Discriminator, FreeNode, PageView, PAGE_SIZE},
    },
    util, Result,
};

/// Pages are allocated one at a time; the file grows by doubling when
/// the free list is empty (§4.2).
const INITIAL_PAGES: usize = 4;

struct Header {
    root_page: u32,
    free_head: u32,
}

/// Persistent key → log-offset map, in memory-mapped form.
pub struct BitDegradeIndex {
    file: fs::File,
    mmap: RwLock<MmapMut>,
    locks: RwLock<PageLockTable>,
    header: std::sync::Mutex<Header>,
}

impl BitDegradeIndex {
    pub fn create(path: &std::path::Path) -> Result<BitDegradeIndex> {
        let file = util::create_file_a(path)?;
        let len = (INITIAL_PAGES * PAGE_SIZE) as u64;
        err_at!(IOError, file.set_len(len))?;
        let mut mmap = err_at!(IOError, unsafe { MmapMut::map_mut(&file) })?;

        {
            let mut root = PageView::new(&mut mmap[0..PAGE_SIZE])?;
            root.set_leaf(true);
        }
        link_free_pages(&mut mmap, 1, INITIAL_PAGES)?;

        Ok(BitDegradeIndex {
            file,
            mmap: RwLock::new(mmap),
            locks: RwLock::new(PageLockTable::new(INITIAL_PAGES)),
            header: std::sync::Mutex::new(Header { root_page: 0, free_head: PAGE_SIZE as u32 }),
        })
    }

    pub fn open(path: &std::path::Path) -> Result<BitDegradeIndex> {
        let file = util::open_file_rw(path)?;
        let len = err_at!(IOError, file.metadata())?.len();
        let mmap = err_at!(IOError, unsafe { MmapMut::map_mut(&file) })?;
        let page_count = (len as usize) / PAGE_SIZE;
        Ok(BitDegradeIndex {
            file,
            mmap: RwLock::new(mmap),
            locks: RwLock::new(PageLockTable::new(page_count)),
            header: std::sync::Mutex::new(Header { root_page: 0, free_head: PAGE_SIZE as u32 }),
        })
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(err_at!(IOError, self.file.metadata())?.len())
    }

    fn page_bytes_mut<'a>(&'a self, mmap: &'a mut MmapMut, offset: u32) -> &'a mut [u8] {
        &mut mmap[offset as usize..offset as usize + PAGE_SIZE]
    }

    /// `find_best_match` cascaded across pages: enter at the root,
    /// recurse into child pages until the candidate slot holds a record
    /// offset rather than a page pointer. Returns the candidate offset
    /// (the caller must confirm equality via the log, §4.2).
    ///
    /// Holds `mmap`'s read lock for the whole descent (so a concurrent
    /// `grow` can't remap underneath it) and each visited page's own
    /// read lock only while reading that page, so concurrent lookups
    /// against different pages don't block each other.
    pub fn find(&self, key: &[u8]) -> Result<Option<CritPtr>> {
        let mmap = self.mmap.read().unwrap();
        let root = self.header.lock().unwrap().root_page;
        let mut page_offset = root;
        loop {
            let locks = self.locks.read().unwrap();
            let _page_guard = locks.page(page_offset).acquire_read();
            let bytes = &mmap[page_offset as usize..page_offset as usize + PAGE_SIZE];
            let count = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
            if count == 0 {
                return Ok(None);
            }
            let mut scratch = bytes.to_vec();
            let view = PageView::new(&mut scratch)?;
            let idx = view.find_best_match(key);
            let ptr = view.slot(idx);
            match ptr.child_page_offset() {
                Some(child) => page_offset = child,
                None => return Ok(Some(ptr)),
            }
        }
    }

    /// Insert `key → offset`. `read_key` resolves an existing candidate
    /// slot's offset back to its stored key (via the log, §4.1) so the
    /// new discriminator can be computed. Returns the previous offset if
    /// `key` already existed (the index overwrites in place).
    pub fn insert(
        &self,
        key: &[u8],
        offset: u32,
        read_key: &dyn Fn(u32) -> Result<Vec<u8>>,
    ) -> Result<Option<u32>> {
        self.insert_special(key, offset, false, read_key)
    }

    /// Like [Self::insert], but marks the new slot "special" (§4.2): the
    /// stored offset is shared by every member of a compressed group, so
    /// `remove` must overwrite rather than unlink it.
    pub fn insert_special(
        &self,
        key: &[u8],
        offset: u32,
        special: bool,
        read_key: &dyn Fn(u32) -> Result<Vec<u8>>,
    ) -> Result<Option<u32>> {
        self.try_insert(key, offset, special, read_key)
    }

    /// Descend to the slot `key` belongs at, tracking the `(page,
    /// slot_index)` path taken so a full leaf (or a full ancestor, once
    /// the split propagates) can be split in place via [Self::split_page]
    /// instead of the previous (buggy) "grow the file and retry against
    /// the same full page" loop, which never actually shrank the page
    /// and spun forever once a page reached `RANK` entries.
    fn try_insert(
        &self,
        key: &[u8],
        offset: u32,
        special: bool,
        read_key: &dyn Fn(u32) -> Result<Vec<u8>>,
    ) -> Result<Option<u32>> {
        let mut mmap = self.mmap.write().unwrap();
        let root = self.header.lock().unwrap().root_page;
        let mut page_offset = root;
        let mut path: Vec<(u32, usize)> = Vec::new();

        loop {
            let locks = self.locks.read().unwrap();
            let page_guard = locks.page(page_offset).acquire_write();
            let bytes = self.page_bytes_mut(&mut mmap, page_offset);
            let mut view = PageView::new(bytes)?;

            if view.count() == 0 {
                view.init_root(offset);
                if special {
                    view.set_slot(0, CritPtr::to_record(offset, true));
                }
                return Ok(None);
            }

            let idx = view.find_best_match(key);
            let candidate = view.slot(idx);
            if let Some(child) = candidate.child_page_offset() {
                drop(view);
                drop(page_guard);
                drop(locks);
                path.push((page_offset, idx));
                page_offset = child;
                continue;
            }

            let existing_offset = candidate.record_offset();
            let existing_key = read_key(existing_offset)?;
            if existing_key == key {
                view.set_slot(idx, CritPtr::to_record(offset, special || candidate.is_special()));
                return Ok(Some(existing_offset));
            }

            let disc = diff_discriminator(&existing_key, key);
            let after = disc.bit_of(key);
            let new_ptr = CritPtr::to_record(offset, special);

            if !view.is_full() {
                view.insert_at(idx, disc, new_ptr, after);
                return Ok(None);
            }

            drop(view);
            drop(page_guard);
            drop(locks);
            self.split_page(&mut mmap, page_offset, &path, idx, disc, new_ptr, after)?;
            return Ok(None);
        }
    }

    /// Split a full page: move its upper half of entries (plus the
    /// entry that overflowed it) into a freshly allocated sibling, and
    /// link the sibling into the parent page via the promoted median
    /// discriminator. If the parent is itself full, the same split
    /// repeats one level up; if the page that overflowed had no parent
    /// (it was the root), a new root is allocated with the old root and
    /// the new sibling as its two children (§4.2, §9).
    ///
    /// Runs entirely under the already-held `mmap` write lock, so it
    /// allocates pages via [Self::alloc_page_locked] rather than
    /// [Self::alloc_page] (which takes its own `mmap` lock and would
    /// deadlock re-entering it).
    fn split_page(
        &self,
        mmap: &mut MmapMut,
        mut page_offset: u32,
        path: &[(u32, usize)],
        mut idx: usize,
        mut disc: Discriminator,
        mut new_ptr: CritPtr,
        mut after: bool,
    ) -> Result<()> {
        let mut ancestors = path.iter().rev();
        loop {
            let sibling_offset = {
                let mut header = self.header.lock().unwrap();
                self.alloc_page_locked(mmap, &mut header)?
            };

            let (left_slots, left_discs, right_slots, right_discs, pivot) = {
                let bytes = self.page_bytes_mut(mmap, page_offset);
                let view = PageView::new(bytes)?;
                let count = view.count();
                let mut slots: Vec<CritPtr> = (0..count).map(|i| view.slot(i)).collect();
                let mut discs: Vec<Discriminator> =
                    (0..count.saturating_sub(1)).map(|i| view.discriminator(i)).collect();

                let insert_slot = if after { idx + 1 } else { idx };
                let insert_disc = if after { insert_slot - 1 } else { insert_slot };
                slots.insert(insert_slot, new_ptr);
                discs.insert(insert_disc, disc);

                // `discs[mid - 1]` joins the last slot kept on the left
                // with the first slot moved right: it is promoted to
                // the parent rather than kept by either half.
                let mid = slots.len() / 2;
                let right_discs = discs.split_off(mid);
                let pivot = discs.pop().unwrap();
                let right_slots = slots.split_off(mid);
                (slots, discs, right_slots, right_discs, pivot)
            };

            write_page(self.page_bytes_mut(mmap, page_offset), &left_slots, &left_discs)?;
            write_page(self.page_bytes_mut(mmap, sibling_offset), &right_slots, &right_discs)?;

            new_ptr = CritPtr::to_child_page(sibling_offset);
            disc = pivot;
            after = true;

            match ancestors.next() {
                Some(&(parent_offset, parent_idx)) => {
                    let bytes = self.page_bytes_mut(mmap, parent_offset);
                    let mut view = PageView::new(bytes)?;
                    if !view.is_full() {
                        view.insert_at(parent_idx, disc, new_ptr, after);
                        return Ok(());
                    }
                    drop(view);
                    page_offset = parent_offset;
                    idx = parent_idx;
                    continue;
                }
                None => {
                    let mut header = self.header.lock().unwrap();
                    let new_root = self.alloc_page_locked(mmap, &mut header)?;
                    header.root_page = new_root;
                    drop(header);
                    let bytes = self.page_bytes_mut(mmap, new_root);
                    let mut view = PageView::new(bytes)?;
                    view.set_count(2);
                    view.set_slot(0, CritPtr::to_child_page(page_offset));
                    view.set_slot(1, new_ptr);
                    view.set_discriminator(0, disc);
                    return Ok(());
                }
            }
        }
    }

    /// Remove `key`. `read_key` is used the same way as in [Self::insert]
    /// to confirm the candidate slot really holds `key` before removing
    /// it. Returns the removed offset, if any.
    pub fn remove(&self, key: &[u8], read_key: &dyn Fn(u32) -> Result<Vec<u8>>) -> Result<Option<u32>> {
        let mut mmap = self.mmap.write().unwrap();
        let root = self.header.lock().unwrap().root_page;
        let mut page_offset = root;

        loop {
            let locks = self.locks.read().unwrap();
            let page_guard = locks.page(page_offset).acquire_write();
            let bytes = self.page_bytes_mut(&mut mmap, page_offset);
            let mut view = PageView::new(bytes)?;
            if view.count() == 0 {
                return Ok(None);
            }
            let idx = view.find_best_match(key);
            let candidate = view.slot(idx);
            if let Some(child) = candidate.child_page_offset() {
                drop(view);
                drop(page_guard);
                drop(locks);
                page_offset = child;
                continue;
            }
            let existing_key = read_key(candidate.record_offset())?;
            if existing_key != key {
                return Ok(None);
            }
            if candidate.is_special() {
                // Pinned: part of a live compressed group. §4.2 says to
                // overwrite in place and keep it special rather than
                // unlink the slot (the group's other entries still need
                // a reachable path to this page).
                view.set_slot(idx, candidate.with_special(true));
                return Ok(Some(candidate.record_offset()));
            }
            view.remove_at(idx);
            return Ok(Some(candidate.record_offset()));
        }
    }

    /// Grow the file by doubling its page count and wire the new pages
    /// into the free list, freeing from the highest address downward so
    /// `alloc_page` returns them in ascending order (§4.2).
    fn grow(&self) -> Result<()> {
        let mut mmap = self.mmap.write().unwrap();
        let mut header = self.header.lock().unwrap();
        self.grow_locked(&mut mmap, &mut header)
    }

    /// [Self::grow]'s body, for callers that already hold both the
    /// `mmap` write lock and the header mutex (the split path).
    fn grow_locked(&self, mmap: &mut MmapMut, header: &mut Header) -> Result<()> {
        let old_pages = mmap.len() / PAGE_SIZE;
        let new_pages = old_pages * 2;
        log::debug!("index expanding {} -> {} pages", old_pages, new_pages);

        err_at!(IOError, self.file.set_len((new_pages * PAGE_SIZE) as u64))?;
        let mut new_mmap = err_at!(IOError, unsafe { MmapMut::map_mut(&self.file) })?;
        link_free_pages(&mut new_mmap, old_pages, new_pages)?;
        *mmap = new_mmap;

        header.free_head = (old_pages * PAGE_SIZE) as u32;
        self.locks.write().unwrap().grow_to(new_pages);
        Ok(())
    }

    /// Pop the free list head, verifying its checksum, and zero the
    /// reclaimed page before returning its offset. Growing the file
    /// first (via [Self::grow]) if the free list is empty; takes its own
    /// locks, so callers that already hold `mmap`'s write lock (the
    /// split path) must use [Self::alloc_page_locked] instead.
    pub fn alloc_page(&self) -> Result<u32> {
        loop {
            {
                let header = self.header.lock().unwrap();
                if header.free_head == 0 {
                    drop(header);
                    self.grow()?;
                    continue;
                }
            }
            let locks = self.locks.read().unwrap();
            let _alloc_guard = locks.allocator_lock.lock().unwrap();
            let mut mmap = self.mmap.write().unwrap();
            let mut header = self.header.lock().unwrap();
            if header.free_head == 0 {
                continue;
            }
            let head = header.free_head;
            let node = FreeNode::decode(&mmap[head as usize..head as usize + PAGE_SIZE])?;
            header.free_head = node.next;
            let page = &mut mmap[head as usize..head as usize + PAGE_SIZE];
            for b in page.iter_mut() {
                *b = 0;
            }
            return Ok(head);
        }
    }

    /// [Self::alloc_page]'s body for callers that already hold the
    /// `mmap` write lock and the header mutex. Doesn't take
    /// `allocator_lock`: the caller's held `mmap` write lock already
    /// excludes every other mutator (`Shard` serializes its own writers
    /// one level up, so this is never actually contended).
    fn alloc_page_locked(&self, mmap: &mut MmapMut, header: &mut Header) -> Result<u32> {
        if header.free_head == 0 {
            self.grow_locked(mmap, header)?;
        }
        let head = header.free_head;
        let node = FreeNode::decode(&mmap[head as usize..head as usize + PAGE_SIZE])?;
        header.free_head = node.next;
        let page = &mut mmap[head as usize..head as usize + PAGE_SIZE];
        for b in page.iter_mut() {
            *b = 0;
        }
        Ok(head)
    }

    /// Overwrite `page` with a [FreeNode] pointing at the current free
    /// list head, and make it the new head. Not yet called by any
    /// production path (page splitting only allocates; this crate
    /// doesn't merge sparse pages back together on remove) — kept as the
    /// free list's other half and exercised directly by its own test.
    pub fn free_page(&self, page_offset: u32) -> Result<()> {
        let locks = self.locks.read().unwrap();
        let _alloc_guard = locks.allocator_lock.lock().unwrap();
        let mut mmap = self.mmap.write().unwrap();
        let mut header = self.header.lock().unwrap();

        let node = FreeNode { next: header.free_head };
        let encoded = node.encode();
        mmap[page_offset as usize..page_offset as usize + PAGE_SIZE].copy_from_slice(&encoded);
        header.free_head = page_offset;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mmap = self.mmap.read().unwrap();
        err_at!(IOError, mmap.flush())
    }
}

fn link_free_pages(mmap: &mut MmapMut, first_page: usize, page_count: usize) -> Result<()> {
    // Free from the highest address downward so alloc_page (which pops
    // the head) hands pages back out starting at `first_page`.
    let mut next = 0u32;
    for page_idx in (first_page..page_count).rev() {
        let offset = page_idx * PAGE_SIZE;
        let node = FreeNode { next };
        mmap[offset..offset + PAGE_SIZE].copy_from_slice(&node.encode());
        next = offset as u32;
    }
    Ok(())
}

/// Rewrite a page's slots and discriminators from scratch — used by
/// [BitDegradeIndex::split_page] to lay out each half of a split page.
fn write_page(bytes: &mut [u8], slots: &[CritPtr], discs: &[Discriminator]) -> Result<()> {
    let mut view = PageView::new(bytes)?;
    view.zero();
    view.set_count(slots.len());
    for (i, s) in slots.iter().enumerate() {
        view.set_slot(i, *s);
    }
    for (i, d) in discs.iter().enumerate() {
        view.set_discriminator(i, *d);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("levidb-tree-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn insert_then_find_round_trips() {
        let path = scratch_path("basic");
        let index = BitDegradeIndex::create(&path).unwrap();
        let mut keys: HashMap<u32, Vec<u8>> = HashMap::new();
        keys.insert(100, b"alpha".to_vec());
        keys.insert(200, b"beta".to_vec());
        let read_key = |off: u32| Ok(keys.get(&off).cloned().unwrap());

        index.insert(b"alpha", 100, &read_key).unwrap();
        index.insert(b"beta", 200, &read_key).unwrap();

        let found = index.find(b"alpha").unwrap().unwrap();
        assert_eq!(found.record_offset(), 100);
        let found = index.find(b"beta").unwrap().unwrap();
        assert_eq!(found.record_offset(), 200);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn insert_overwrite_returns_previous_offset() {
        let path = scratch_path("overwrite");
        let index = BitDegradeIndex::create(&path).unwrap();
        let read_key = |_off: u32| Ok(b"k".to_vec());
        index.insert(b"k", 10, &read_key).unwrap();
        let prev = index.insert(b"k", 20, &read_key).unwrap();
        assert_eq!(prev, Some(10));
        let found = index.find(b"k").unwrap().unwrap();
        assert_eq!(found.record_offset(), 20);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn remove_unlinks_entry() {
        let path = scratch_path("remove");
        let index = BitDegradeIndex::create(&path).unwrap();
        let mut keys: HashMap<u32, Vec<u8>> = HashMap::new();
        keys.insert(1, b"a".to_vec());
        keys.insert(2, b"b".to_vec());
        let read_key = |off: u32| Ok(keys.get(&off).cloned().unwrap());
        index.insert(b"a", 1, &read_key).unwrap();
        index.insert(b"b", 2, &read_key).unwrap();

        let removed = index.remove(b"a", &read_key).unwrap();
        assert_eq!(removed, Some(1));
        assert!(index.find(b"a").unwrap().is_none() || index.find(b"a").unwrap().unwrap().record_offset() != 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn free_page_round_trips_through_alloc_page() {
        let path = scratch_path("free-page");
        let index = BitDegradeIndex::create(&path).unwrap();
        let page = index.alloc_page().unwrap();
        index.free_page(page).unwrap();
        let reused = index.alloc_page().unwrap();
        assert_eq!(reused, page);
        std::fs::remove_file(&path).ok();
    }

    /// Insert enough distinct keys that a leaf page must split (`RANK`
    /// is 454), then enough more that the split propagates into a new
    /// root — exercising the path the old "grow and retry against the
    /// same full page" code could never reach without hanging.
    #[test]
    fn insert_past_rank_splits_pages() {
        let path = scratch_path("split");
        let index = BitDegradeIndex::create(&path).unwrap();
        let keys: std::cell::RefCell<HashMap<u32, Vec<u8>>> = std::cell::RefCell::new(HashMap::new());
        let read_key = |off: u32| Ok(keys.borrow().get(&off).cloned().unwrap());

        let total = crate::index::page::RANK as u32 * 3;
        for i in 0..total {
            let key = format!("key-{:06}", i).into_bytes();
            keys.borrow_mut().insert(i, key.clone());
            index.insert(&key, i, &read_key).unwrap();
        }

        for i in 0..total {
            let key = format!("key-{:06}", i).into_bytes();
            let found = index.find(&key).unwrap().unwrap_or_else(|| panic!("missing key {}", i));
            assert_eq!(found.record_offset(), i);
        }
        std::fs::remove_file(&path).ok();
    }

    // Seeded-RNG property test against a `HashMap` reference model,
    // mirroring `robt/index_test.rs`'s seed-and-print approach so a
    // failure is reproducible from the printed seed.
    #[test]
    fn fuzz_insert_remove_against_reference_model() {
        use rand::{rngs::SmallRng, Rng, SeedableRng};

        let seed: u64 = rand::random();
        println!("fuzz_insert_remove_against_reference_model seed {}", seed);
        let mut rng = SmallRng::seed_from_u64(seed);

        let path = scratch_path("fuzz");
        let index = BitDegradeIndex::create(&path).unwrap();
        let keys: std::cell::RefCell<HashMap<u32, Vec<u8>>> = std::cell::RefCell::new(HashMap::new());
        let mut model: HashMap<Vec<u8>, u32> = HashMap::new();
        let read_key = |off: u32| Ok(keys.borrow().get(&off).cloned().unwrap());

        for i in 0..2000u32 {
            // Keys range wide enough that, combined with the split test
            // above, both the unsplit and split regimes get covered
            // across the suite without making every fuzz run pay for a
            // full split (2000 steps over a 300-key universe churns the
            // same handful of pages repeatedly, which is the point of a
            // reference-model fuzz test).
            let key = format!("k{:04}", rng.gen_range(0..300)).into_bytes();
            if rng.gen_bool(0.25) {
                let expect = model.remove(&key);
                let got = index.remove(&key, &read_key).unwrap();
                assert_eq!(got, expect, "remove({:?}) mismatch at step {}", key, i);
            } else {
                keys.borrow_mut().insert(i, key.clone());
                let expect = model.insert(key.clone(), i);
                let got = index.insert(&key, i, &read_key).unwrap();
                assert_eq!(got, expect, "insert({:?}) mismatch at step {}", key, i);
            }
        }

        for (key, offset) in &model {
            let found = index.find(key).unwrap().unwrap_or_else(|| panic!("missing key {:?}", key));
            assert_eq!(found.record_offset(), *offset);
        }
        std::fs::remove_file(&path).ok();
    }
}
