//! On-disk framing constants and the chunk type byte, grounded on
//! `original_source/src/log_writer.h` / `log_reader.h` (bit-exact layout
//! is normative, see §4.1).

/// Every log file is an unbroken sequence of blocks this size; a chunk
/// header never straddles a block boundary.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// `checksum(4) | type(1) | length(2)`.
pub const HEADER_SIZE: usize = 7;

/// A shard's log (and index) may not grow past this size; reaching it
/// is signaled as [crate::shard::ShardFull], not an error.
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Batch-concat type: describes where this chunk sits in the sequence
/// of chunks making up the surrounding multi-record batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    Full,
    First,
    Middle,
    Last,
}

/// Record-concat type: describes where this chunk sits in the sequence
/// of chunks making up one logical record's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Full,
    First,
    Middle,
    Last,
}

impl BatchType {
    fn bits(self) -> u8 {
        match self {
            BatchType::Full => 0,
            BatchType::First => 1,
            BatchType::Middle => 2,
            BatchType::Last => 3,
        }
    }

    fn from_bits(bits: u8) -> Option<BatchType> {
        match bits {
            0 => Some(BatchType::Full),
            1 => Some(BatchType::First),
            2 => Some(BatchType::Middle),
            3 => Some(BatchType::Last),
            _ => None,
        }
    }
}

impl RecordType {
    fn bits(self) -> u8 {
        match self {
            RecordType::Full => 0,
            RecordType::First => 1,
            RecordType::Middle => 2,
            RecordType::Last => 3,
        }
    }

    fn from_bits(bits: u8) -> Option<RecordType> {
        match bits {
            0 => Some(RecordType::Full),
            1 => Some(RecordType::First),
            2 => Some(RecordType::Middle),
            3 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// The packed type byte: bits 0-1 batch-concat, bits 2-3 record-concat,
/// bit 4 compressed, bit 5 deletion, bits 6-7 reserved (always 0 here;
/// a nonzero reserved field on read is not itself a corruption, since a
/// future writer may set it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkType {
    pub batch: BatchType,
    pub record: RecordType,
    pub compressed: bool,
    pub deleted: bool,
}

impl ChunkType {
    pub fn encode(self) -> u8 {
        let mut b = self.batch.bits() | (self.record.bits() << 2);
        if self.compressed {
            b |= 1 << 4;
        }
        if self.deleted {
            b |= 1 << 5;
        }
        b
    }

    pub fn decode(byte: u8) -> Option<ChunkType> {
        Some(ChunkType {
            batch: BatchType::from_bits(byte & 0b11)?,
            record: RecordType::from_bits((byte >> 2) & 0b11)?,
            compressed: byte & (1 << 4) != 0,
            deleted: byte & (1 << 5) != 0,
        })
    }

    /// True if `next` may legally follow `self` on the same record/batch
    /// (§4.1: "after FULL/LAST only FULL/FIRST may follow; after
    /// FIRST/MIDDLE only MIDDLE/LAST with the same compressed and del
    /// bits may follow").
    pub fn may_follow(self, next: ChunkType) -> bool {
        // The compressed/del equality constraint binds only the
        // record-continuation dimension: a batch can carry records with
        // differing flags, a split record cannot change flags mid-split.
        let batch_ok = match self.batch {
            BatchType::Full | BatchType::Last => {
                matches!(next.batch, BatchType::Full | BatchType::First)
            }
            BatchType::First | BatchType::Middle => {
                matches!(next.batch, BatchType::Middle | BatchType::Last)
            }
        };
        let record_ok = match self.record {
            RecordType::Full | RecordType::Last => {
                matches!(next.record, RecordType::Full | RecordType::First)
            }
            RecordType::First | RecordType::Middle => {
                matches!(next.record, RecordType::Middle | RecordType::Last)
                    && next.compressed == self.compressed
                    && next.deleted == self.deleted
            }
        };
        batch_ok && record_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_byte_round_trips() {
        for batch in [BatchType::Full, BatchType::First, BatchType::Middle, BatchType::Last] {
            for record in [RecordType::Full, RecordType::First, RecordType::Middle, RecordType::Last] {
                for compressed in [false, true] {
                    for deleted in [false, true] {
                        let ct = ChunkType { batch, record, compressed, deleted };
                        let decoded = ChunkType::decode(ct.encode()).unwrap();
                        assert_eq!(ct, decoded);
                    }
                }
            }
        }
    }

    #[test]
    fn dependency_rules() {
        let full = ChunkType { batch: BatchType::Full, record: RecordType::Full, compressed: false, deleted: false };
        let first = ChunkType { batch: BatchType::First, record: RecordType::First, compressed: true, deleted: false };
        let middle_same = ChunkType { batch: BatchType::Middle, record: RecordType::Middle, compressed: true, deleted: false };
        let middle_diff = ChunkType { batch: BatchType::Middle, record: RecordType::Middle, compressed: false, deleted: false };

        assert!(full.may_follow(first));
        assert!(first.may_follow(middle_same));
        assert!(!first.may_follow(middle_diff));
        assert!(!full.may_follow(middle_same));
    }
}
