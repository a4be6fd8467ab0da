//! An embedded, single-process, ordered key-value store.
//!
//! A database directory holds many numbered *shards* (§4.4), each one
//! a log file (§4.1) plus a memory-mapped bit-degrade index (§4.2)
//! keyed on discriminating bits rather than whole keys. An *aggregator*
//! (§4.5) routes keys to shards through a `BTreeMap` dispatcher and
//! runs shards through online 1→2 split and 2→1 merge compaction
//! (§4.6) as they fill up or go cold, so callers see one flat key space
//! no matter how many shards back it.
//!
//! ```no_run
//! use levidb::{Db, OpenOptions};
//!
//! let opts = OpenOptions { create_if_missing: true, ..Default::default() };
//! let db = Db::open("/tmp/example-db", opts).unwrap();
//! db.put(b"key", b"value", Default::default()).unwrap();
//! assert_eq!(db.get(b"key", None).unwrap(), Some(b"value".to_vec()));
//! ```

#[macro_use]
mod error;

mod aggregator;
mod arena;
mod index;
mod log;
mod options;
mod seqno;
mod shard;
mod util;

use std::path::Path;

pub use crate::{
    aggregator::Aggregator,
    error::{Error, ErrorKind, Outcome, OverflowSignal, Result},
    options::{
        AggregatorOptions, OpenOptions, PutOptions, ReadOptions, RemoveOptions, ScanOptions,
        WriteOptions,
    },
    seqno::Snapshot,
};

/// The top-level handle to a database directory, wrapping an
/// [Aggregator]. Share a `Db` behind an `Arc` across threads the same
/// way the aggregator's internals already do.
pub struct Db {
    aggregator: Aggregator,
}

impl Db {
    /// Open (or create, per `open_opts`) the database directory at
    /// `path`, with default aggregator tuning (the `max_dbs` /
    /// `merge_usage_fraction` / `close_hit_threshold` values §6 left as
    /// an open question — resolved in DESIGN.md).
    pub fn open<P: AsRef<Path>>(path: P, open_opts: OpenOptions) -> Result<Db> {
        Db::open_with(path, open_opts, AggregatorOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        open_opts: OpenOptions,
        agg_opts: AggregatorOptions,
    ) -> Result<Db> {
        Ok(Db { aggregator: Aggregator::open(path.as_ref(), open_opts, agg_opts)? })
    }

    pub fn put(&self, key: &[u8], value: &[u8], opts: PutOptions) -> Result<()> {
        self.aggregator.put(key, value, opts)
    }

    pub fn remove(&self, key: &[u8], opts: RemoveOptions) -> Result<()> {
        self.aggregator.delete(key, opts)
    }

    /// Batched write of `(key, value, is_deletion)` triples (§4.4,
    /// §4.5); see [WriteOptions::try_compress].
    pub fn write(&self, records: Vec<(Vec<u8>, Vec<u8>, bool)>, opts: WriteOptions) -> Result<()> {
        self.aggregator.write(records, opts)
    }

    pub fn get(&self, key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        self.aggregator.get(key, snapshot)
    }

    /// Pin a consistent read view across every shard (§5: "a snapshot
    /// pins the shard-local MVCC overlay of every shard it visits at
    /// the seq value at snapshot-creation time").
    pub fn snapshot(&self) -> Snapshot {
        self.aggregator.snapshot().snapshot()
    }

    /// Run one pass of the aggregator's GC loop: pairwise-merge cold
    /// neighbor shards and close the least-hit shards above
    /// `max_dbs` (§4.5). Idempotent; a no-op while another GC pass is
    /// already running or `operating_dbs <= max_dbs`.
    pub fn run_gc(&self) -> Result<()> {
        self.aggregator.run_gc()
    }
}
