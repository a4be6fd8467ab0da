//! Per-page read/write spinlocks, grounded on `spinlock.rs`'s
//! latch-and-lock `RWSpinlock`. Extended with [RWSpinlock::try_upgrade]
//! (read → write, non-blocking) for the optimistic insert/remove loop
//! described in §9: a writer takes a read lock, does its structural
//! check, then tries to upgrade; on failure it releases and restarts
//! the whole descent.

use std::sync::{
    atomic::{AtomicU64, Ordering::SeqCst},
    Mutex,
};

/// Latch-and-lock RW spinlock for one page. Bit layout matches
/// `spinlock.rs`: reader count in bits 0-61, latch in bit 62, lock in
/// bit 63.
pub struct RWSpinlock {
    value: AtomicU64,
}

const LATCH_FLAG: u64 = 0x4000_0000_0000_0000;
const LOCK_FLAG: u64 = 0x8000_0000_0000_0000;
const LATCH_LOCK_FLAG: u64 = LATCH_FLAG | LOCK_FLAG;
const READERS_FLAG: u64 = 0x3FFF_FFFF_FFFF_FFFF;

impl RWSpinlock {
    pub fn new() -> RWSpinlock {
        RWSpinlock { value: AtomicU64::new(0) }
    }

    pub fn acquire_read(&self) -> ReadGuard<'_> {
        loop {
            let c = self.value.load(SeqCst);
            if c & LATCH_LOCK_FLAG == 0 {
                let n = c + 1;
                if self.value.compare_exchange(c, n, SeqCst, SeqCst).is_ok() {
                    return ReadGuard { door: self };
                }
            }
            std::thread::yield_now();
        }
    }

    pub fn acquire_write(&self) -> WriteGuard<'_> {
        loop {
            let c = self.value.load(SeqCst);
            if c & LATCH_FLAG == 0 {
                let n = c | LATCH_FLAG;
                if self.value.compare_exchange(c, n, SeqCst, SeqCst).is_ok() {
                    break;
                }
            }
            std::thread::yield_now();
        }
        loop {
            let c = self.value.load(SeqCst);
            if c & READERS_FLAG == 0 {
                let n = c | LOCK_FLAG;
                if self.value.compare_exchange(c, n, SeqCst, SeqCst).is_ok() {
                    return WriteGuard { door: self };
                }
            }
            std::thread::yield_now();
        }
    }

    /// Attempt to upgrade a held read lock to a write lock without
    /// releasing it in between. Succeeds only if this is the sole
    /// reader and no writer is latched; on failure the caller still
    /// holds its read lock (callers typically drop it and restart).
    pub fn try_upgrade<'a>(&'a self, read: ReadGuard<'a>) -> Result<WriteGuard<'a>, ReadGuard<'a>> {
        let c = self.value.load(SeqCst);
        if c & LATCH_LOCK_FLAG != 0 || c & READERS_FLAG != 1 {
            return Err(read);
        }
        let n = (c & !READERS_FLAG) | LATCH_LOCK_FLAG;
        if self.value.compare_exchange(c, n, SeqCst, SeqCst).is_ok() {
            std::mem::forget(read);
            Ok(WriteGuard { door: self })
        } else {
            Err(read)
        }
    }
}

impl Default for RWSpinlock {
    fn default() -> RWSpinlock {
        RWSpinlock::new()
    }
}

pub struct ReadGuard<'a> {
    door: &'a RWSpinlock,
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        self.door.value.fetch_sub(1, SeqCst);
    }
}

pub struct WriteGuard<'a> {
    door: &'a RWSpinlock,
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        self.door.value.fetch_and(!LATCH_LOCK_FLAG, SeqCst);
    }
}

/// One [RWSpinlock] per page, indexed by `page_offset / PAGE_SIZE`, plus
/// the two global locks §4.2 calls for: `expand_lock` serializes file
/// growth, `allocator_lock` protects the free list.
pub struct PageLockTable {
    pages: Vec<RWSpinlock>,
    pub expand_lock: Mutex<()>,
    pub allocator_lock: Mutex<()>,
}

impl PageLockTable {
    pub fn new(page_count: usize) -> PageLockTable {
        PageLockTable {
            pages: (0..page_count).map(|_| RWSpinlock::new()).collect(),
            expand_lock: Mutex::new(()),
            allocator_lock: Mutex::new(()),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn grow_to(&mut self, page_count: usize) {
        while self.pages.len() < page_count {
            self.pages.push(RWSpinlock::new());
        }
    }

    pub fn page(&self, page_offset: u32) -> &RWSpinlock {
        &self.pages[page_offset as usize / crate::index::page::PAGE_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_excludes_concurrent_read() {
        let lock = RWSpinlock::new();
        let w = lock.acquire_write();
        assert_eq!(lock.value.load(SeqCst) & LATCH_LOCK_FLAG, LATCH_LOCK_FLAG);
        drop(w);
        assert_eq!(lock.value.load(SeqCst), 0);
    }

    #[test]
    fn upgrade_succeeds_when_sole_reader() {
        let lock = RWSpinlock::new();
        let r = lock.acquire_read();
        let w = lock.try_upgrade(r).unwrap_or_else(|_| panic!("sole reader should upgrade"));
        drop(w);
        assert_eq!(lock.value.load(SeqCst), 0);
    }

    #[test]
    fn upgrade_fails_with_second_reader() {
        let lock = RWSpinlock::new();
        let r1 = lock.acquire_read();
        let _r2 = lock.acquire_read();
        let r1 = match lock.try_upgrade(r1) {
            Ok(_) => panic!("upgrade should fail with two readers"),
            Err(r) => r,
        };
        drop(r1);
    }
}
