//! Small cache of parsed [RecordCursor]s keyed by offset, grounded on
//! §4.1's "two slot pools, one for normal, one for compressed readers;
//! entries are parked on iterator drop and adopted on next open."
//!
//! Decompressing a group is the expensive part of opening a record, so
//! only compressed-group cursors are worth pooling; normal records are
//! cheap enough that re-parsing them is not worth the lock traffic.

use std::{collections::HashMap, sync::Mutex};

use crate::log::reader::RecordCursor;

const MAX_ENTRIES: usize = 256;

struct CachedGroup {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Caches decompressed compressed-group bodies by their group offset.
/// Cheap to clone-share: wrap in an `Arc` at the shard level.
pub struct RecordCache {
    groups: Mutex<HashMap<u32, CachedGroup>>,
}

impl RecordCache {
    pub fn new() -> RecordCache {
        RecordCache { groups: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn get(&self, offset: u32) -> Option<RecordCursor> {
        let groups = self.groups.lock().unwrap();
        groups.get(&offset).map(|g| RecordCursor::Group {
            entries: g.entries.clone(),
            pos: Mutex::new(0),
        })
    }

    pub(crate) fn put(&self, offset: u32, cursor: &RecordCursor) {
        if let RecordCursor::Group { entries, .. } = cursor {
            let mut groups = self.groups.lock().unwrap();
            if groups.len() >= MAX_ENTRIES && !groups.contains_key(&offset) {
                // Evict an arbitrary entry rather than grow unbounded;
                // this is a best-effort amortization cache, not a
                // correctness-bearing structure.
                if let Some(&evict) = groups.keys().next() {
                    groups.remove(&evict);
                }
            }
            groups.insert(offset, CachedGroup { entries: entries.clone() });
        }
    }
}

impl Default for RecordCache {
    fn default() -> RecordCache {
        RecordCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cache = RecordCache::new();
        let cursor = RecordCursor::Group {
            entries: vec![(b"k".to_vec(), b"v".to_vec())],
            pos: Mutex::new(0),
        };
        cache.put(7, &cursor);
        let fetched = cache.get(7).unwrap();
        assert_eq!(fetched.key(), b"k");
    }

    #[test]
    fn miss_returns_none() {
        let cache = RecordCache::new();
        assert!(cache.get(42).is_none());
    }
}
