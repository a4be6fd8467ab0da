//! Options accepted at open and per-operation, grounded on
//! `original_source/src/options.h`.

/// Options accepted when opening a database directory (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Create the DB directory if it does not exist; otherwise opening a
    /// missing DB is a [crate::error::ErrorKind::NotFound] error.
    pub create_if_missing: bool,
    /// Fail open if the DB directory already exists.
    pub error_if_exists: bool,
}

/// Per-write options.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Flush and fsync the shard log before returning.
    pub sync: bool,
    /// Attempt grouped compression for a batch write; kept only if it
    /// saves at least 1/8 of the uncompressed size (§4.4).
    pub try_compress: bool,
}

impl Default for WriteOptions {
    fn default() -> WriteOptions {
        WriteOptions {
            sync: false,
            try_compress: true,
        }
    }
}

/// Per-put options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    pub sync: bool,
}

/// Per-remove options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub sync: bool,
}

/// Reserved for read-path knobs; currently featureless, kept as a
/// distinct type so the API can grow without breaking callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {}

/// Reserved for scan-path knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {}

/// Aggregator-wide tuning, left open by `spec.md` (resolved in DESIGN.md):
/// the soft `max_dbs` threshold that trips the GC/merge loop (§4.5) and
/// the combined-disk-usage threshold below which two neighbors are
/// eligible to merge (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct AggregatorOptions {
    /// Once more than this many shards are open, the GC loop starts
    /// looking for pairwise merge candidates.
    pub max_dbs: usize,
    /// Two neighbor shards merge only if `a.disk_usage() + b.disk_usage()`
    /// is below this fraction of the shard cap (4 GiB, see `spec.md` §1).
    pub merge_usage_fraction: f64,
    /// Hit-counter halving/closing threshold used by the GC loop to close
    /// the least-hit shards once `operating_dbs` exceeds `max_dbs`.
    pub close_hit_threshold: u64,
}

impl Default for AggregatorOptions {
    fn default() -> AggregatorOptions {
        AggregatorOptions {
            max_dbs: 100,
            merge_usage_fraction: 0.4,
            close_hit_threshold: 4,
        }
    }
}
