//! Append-only record writer, grounded on
//! `original_source/src/log_writer.h` for the block-chunking algorithm
//! and on `wral/journal.rs` for the "single mutex serializes appends,
//! each caller gets back the offset of its own write" shape.

use std::{
    io::Write,
    sync::Mutex,
};

use crate::{
    error::{Outcome, OverflowSignal},
    log::format::{BatchType, ChunkType, RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_FILE_SIZE},
    util,
    Result,
};

struct Inner {
    file: std::fs::File,
    /// Absolute byte offset of the next byte to be written.
    fpos: u64,
}

/// Appends records and record groups to one shard's data file. All
/// `add_*` calls serialize behind [Inner]'s mutex (§4.9): concurrent
/// callers each get a unique, correctly-ordered offset, but may observe
/// their own offset returned out of call-start order.
pub struct LogWriter {
    inner: Mutex<Inner>,
}

impl LogWriter {
    /// Create a brand-new, empty log file at `path`.
    pub fn create(path: &std::path::Path) -> Result<LogWriter> {
        let file = util::create_file_a(path)?;
        Ok(LogWriter { inner: Mutex::new(Inner { file, fpos: 0 }) })
    }

    /// Reopen an existing log file for further appends, positioned at
    /// `len` (the file's current size, typically `metadata().len()`).
    pub fn reopen(path: &std::path::Path, len: u64) -> Result<LogWriter> {
        let file = util::open_file_rw(path)?;
        Ok(LogWriter { inner: Mutex::new(Inner { file, fpos: len }) })
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().unwrap().fpos
    }

    /// Append a normal `(key, value)` record, returns its offset.
    pub fn add_record(&self, key: &[u8], value: &[u8]) -> Result<Outcome<u32>> {
        self.add_one(key, value, false)
    }

    /// Append a deletion tombstone for `key`.
    pub fn add_record_for_del(&self, key: &[u8]) -> Result<Outcome<u32>> {
        self.add_one(key, &[], true)
    }

    fn add_one(&self, key: &[u8], value: &[u8], deleted: bool) -> Result<Outcome<u32>> {
        let mut payload = Vec::with_capacity(5 + key.len() + value.len());
        util::varint::encode_u32(&mut payload, util::try_convert(key.len(), "key length")?);
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);

        let mut inner = self.inner.lock().unwrap();
        if !has_room(&inner, payload.len()) {
            return Ok(Outcome::Overflow(OverflowSignal::LogFull));
        }
        Ok(Outcome::Done(write_chunks(&mut inner, &payload, false, deleted, BatchType::Full, true, true)?))
    }

    /// Append a pre-built compressed-group payload (meta + zstd body, see
    /// §4.1), returns its offset.
    pub fn add_compressed_records(&self, payload: &[u8]) -> Result<Outcome<u32>> {
        let mut inner = self.inner.lock().unwrap();
        if !has_room(&inner, payload.len()) {
            return Ok(Outcome::Overflow(OverflowSignal::LogFull));
        }
        Ok(Outcome::Done(write_chunks(&mut inner, payload, true, false, BatchType::Full, true, true)?))
    }

    /// Append `records` (each `(key, value)`) as one batch, returning one
    /// offset per record in input order. `del_flags[i]` marks record `i`
    /// as a deletion. All-or-nothing: on overflow, nothing from this
    /// batch is left appended.
    pub fn add_records_may_del(
        &self,
        records: &[(Vec<u8>, Vec<u8>)],
        del_flags: &[bool],
    ) -> Result<Outcome<Vec<u32>>> {
        assert_eq!(records.len(), del_flags.len());
        if records.is_empty() {
            return Ok(Outcome::Done(vec![]));
        }

        let mut payloads = Vec::with_capacity(records.len());
        for (key, value) in records {
            let mut payload = Vec::with_capacity(5 + key.len() + value.len());
            util::varint::encode_u32(&mut payload, util::try_convert(key.len(), "key length")?);
            payload.extend_from_slice(key);
            payload.extend_from_slice(value);
            payloads.push(payload);
        }

        let mut inner = self.inner.lock().unwrap();
        let total: usize = payloads.iter().map(Vec::len).sum();
        if !has_room(&inner, total) {
            return Ok(Outcome::Overflow(OverflowSignal::LogFull));
        }

        // Room is checked up front against the whole batch, so nothing
        // partial can be left appended: past this point a write only
        // fails on a genuine OS I/O error, which recovery resolves via
        // the recovery iterator (§4.1), same as a torn write from a
        // crash.
        let mut offsets = Vec::with_capacity(payloads.len());
        let last = payloads.len() - 1;
        for (i, payload) in payloads.iter().enumerate() {
            let batch = if last == 0 {
                BatchType::Full
            } else if i == 0 {
                BatchType::First
            } else if i == last {
                BatchType::Last
            } else {
                BatchType::Middle
            };
            let deleted = del_flags[i];
            let offset = write_chunks(&mut inner, payload, false, deleted, batch, true, true)?;
            offsets.push(offset);
        }
        Ok(Outcome::Done(offsets))
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        err_at!(IOError, inner.file.sync_all())
    }
}

fn has_room(inner: &Inner, payload_len: usize) -> bool {
    // Worst case every byte needs its own block header; this is a
    // conservative (not tight) bound, which is fine since MAX_FILE_SIZE
    // itself is a soft 4 GiB cap, not a hard wire-format limit.
    let worst_case = payload_len as u64 + HEADER_SIZE as u64 * (payload_len as u64 / BLOCK_SIZE as u64 + 2);
    inner.fpos + worst_case <= MAX_FILE_SIZE
}

/// Split `payload` into chunks respecting block boundaries, write them,
/// and return the file offset of the first chunk's payload (the offset
/// callers later pass to the reader).
#[allow(clippy::too_many_arguments)]
fn write_chunks(
    inner: &mut Inner,
    payload: &[u8],
    compressed: bool,
    deleted: bool,
    outer_batch: BatchType,
    batch_is_first: bool,
    batch_is_last: bool,
) -> Result<u32> {
    let start_offset = util::try_convert::<u64, u32>(inner.fpos, "log offset")?;
    let mut remaining = payload;
    let mut first_chunk = true;

    loop {
        let block_remaining = BLOCK_SIZE - (inner.fpos as usize % BLOCK_SIZE);
        if block_remaining < HEADER_SIZE {
            pad_block_tail(inner, block_remaining)?;
            continue;
        }
        let room = block_remaining - HEADER_SIZE;
        let take = room.min(remaining.len());
        let is_last_chunk = take == remaining.len();

        let record = match (first_chunk, is_last_chunk) {
            (true, true) => RecordType::Full,
            (true, false) => RecordType::First,
            (false, true) => RecordType::Last,
            (false, false) => RecordType::Middle,
        };
        let batch = match outer_batch {
            BatchType::Full => BatchType::Full,
            _ => {
                if first_chunk && batch_is_first {
                    outer_batch
                } else if is_last_chunk && batch_is_last {
                    BatchType::Last
                } else {
                    BatchType::Middle
                }
            }
        };
        let chunk_type = ChunkType { batch, record, compressed, deleted };

        let chunk_payload = &remaining[..take];
        write_one_chunk(inner, chunk_type, chunk_payload)?;

        remaining = &remaining[take..];
        first_chunk = false;
        if remaining.is_empty() {
            break;
        }
    }
    Ok(start_offset)
}

fn write_one_chunk(inner: &mut Inner, chunk_type: ChunkType, payload: &[u8]) -> Result<()> {
    let length = util::try_convert::<usize, u16>(payload.len(), "chunk length")?;
    let type_byte = chunk_type.encode();

    let mut header_tail = Vec::with_capacity(HEADER_SIZE - 4 + payload.len());
    header_tail.push(type_byte);
    header_tail.extend_from_slice(&length.to_le_bytes());
    let crc = crate::util::crc32::extend(crate::util::crc32::value(&header_tail), payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&header_tail);
    frame.extend_from_slice(payload);

    let n = err_at!(IOError, inner.file.write(&frame))?;
    if n != frame.len() {
        return err_at!(IOError, msg: "partial chunk write {}/{}", n, frame.len());
    }
    inner.fpos += frame.len() as u64;
    Ok(())
}

fn pad_block_tail(inner: &mut Inner, tail: usize) -> Result<()> {
    if tail == 0 {
        return Ok(());
    }
    let zeros = vec![0u8; tail];
    let n = err_at!(IOError, inner.file.write(&zeros))?;
    if n != tail {
        return err_at!(IOError, msg: "partial pad write {}/{}", n, tail);
    }
    inner.fpos += tail as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("levidb-writer-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn single_record_round_trip_offsets() {
        let path = scratch_path("single");
        let writer = LogWriter::create(&path).unwrap();
        let off0 = writer.add_record(b"alpha", b"1").unwrap().done().unwrap();
        let off1 = writer.add_record(b"beta", b"2").unwrap().done().unwrap();
        assert_eq!(off0, 0);
        assert!(off1 > off0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn large_record_spans_multiple_blocks() {
        let path = scratch_path("large");
        let writer = LogWriter::create(&path).unwrap();
        let value = vec![7u8; BLOCK_SIZE * 3];
        let off = writer.add_record(b"k", &value).unwrap().done().unwrap();
        assert_eq!(off, 0);
        assert!(writer.len() > (BLOCK_SIZE * 3) as u64);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn batch_writes_return_one_offset_per_record() {
        let path = scratch_path("batch");
        let writer = LogWriter::create(&path).unwrap();
        let records = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ];
        let offsets = writer.add_records_may_del(&records, &[false, false, true]).unwrap().done().unwrap();
        assert_eq!(offsets.len(), 3);
        assert!(offsets.windows(2).all(|w| w[1] > w[0]));
        std::fs::remove_file(&path).ok();
    }
}
