//! A small scratch-buffer pool, the idiomatic-Rust analogue of
//! `original_source/src/arena.h`'s block arena.
//!
//! The original arena hands out raw `char*` slices carved out of
//! 4 KiB blocks so a skiplist memtable never calls `malloc` per node.
//! Rust's allocator already amortizes small allocations well, so
//! instead of raw pointer arithmetic this just pools reusable
//! `Vec<u8>` buffers; `Shard` keeps one and hands it to
//! `build_compressed_payload` so repeated batched-compressed writes on
//! the same shard stop re-allocating the concatenated-plaintext buffer
//! every call (§4.1).

use std::sync::Mutex;

/// A pool of `Vec<u8>` scratch buffers. `take()` returns a cleared
/// buffer (reusing one of at least `hint` capacity if the pool has one);
/// dropping the returned [Scratch] returns it to the pool.
pub struct Arena {
    pool: Mutex<Vec<Vec<u8>>>,
}

impl Arena {
    pub fn new() -> Arena {
        Arena {
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self, hint: usize) -> Scratch<'_> {
        let mut buf = {
            let mut pool = self.pool.lock().unwrap();
            pool.pop().unwrap_or_default()
        };
        buf.clear();
        if buf.capacity() < hint {
            buf.reserve(hint - buf.capacity());
        }
        Scratch { arena: self, buf: Some(buf) }
    }
}

impl Default for Arena {
    fn default() -> Arena {
        Arena::new()
    }
}

/// A borrowed scratch buffer; returns to its [Arena] on drop.
pub struct Scratch<'a> {
    arena: &'a Arena,
    buf: Option<Vec<u8>>,
}

impl<'a> std::ops::Deref for Scratch<'a> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().unwrap()
    }
}

impl<'a> std::ops::DerefMut for Scratch<'a> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().unwrap()
    }
}

impl<'a> Drop for Scratch<'a> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut pool = self.arena.pool.lock().unwrap();
            if pool.len() < 64 {
                pool.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_capacity() {
        let arena = Arena::new();
        {
            let mut s = arena.take(256);
            s.extend_from_slice(&[1u8; 256]);
        }
        let s = arena.take(16);
        assert!(s.capacity() >= 256);
        assert_eq!(s.len(), 0);
    }
}
