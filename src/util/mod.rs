//! Small, dependency-light helpers shared by every subsystem: file-open
//! wrappers, positional reads, CRC32C, and varint32 coding.

use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{error::ErrorKind, Error, Result};

pub mod crc32;
pub mod varint;

/// Create `file` for append-only writing. Removes any pre-existing file
/// at that path first (levidb log/index files are always created fresh;
/// reopening an existing shard goes through [open_file_rw]).
pub fn create_file_a(file: &Path) -> Result<fs::File> {
    if let Some(parent) = file.parent() {
        err_at!(IOError, fs::create_dir_all(parent))?;
    }
    fs::remove_file(file).ok();
    let mut opts = fs::OpenOptions::new();
    err_at!(IOError, opts.read(true).append(true).create_new(true).open(file))
}

/// Open an existing file for read-and-append.
pub fn open_file_rw(file: &Path) -> Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    err_at!(IOError, opts.read(true).append(true).open(file))
}

/// Open an existing file for reading only.
pub fn open_file_r(file: &Path) -> Result<fs::File> {
    err_at!(IOError, fs::OpenOptions::new().read(true).open(file))
}

/// Read exactly `n` bytes starting at `fpos`. A short read is a
/// [ErrorKind::Corruption] (premature EOF), not silently truncated.
pub fn read_at(fd: &fs::File, fpos: u64, n: usize) -> Result<Vec<u8>> {
    let mut fd = fd.try_clone().map_err(Error::from)?;
    err_at!(IOError, fd.seek(SeekFrom::Start(fpos)))?;
    let mut buf = vec![0u8; n];
    let got = err_at!(IOError, fd.read(&mut buf))?;
    if got != n {
        return err_at!(Corruption, msg: "short read at {}: wanted {} got {}", fpos, n, got);
    }
    Ok(buf)
}

/// Write `data` and fsync. Used by the keeper sidecar and the shard's
/// explicit `sync` path.
pub fn sync_write(file: &mut fs::File, data: &[u8]) -> Result<()> {
    let n = err_at!(IOError, file.write(data))?;
    if n != data.len() {
        return err_at!(IOError, msg: "partial write {}/{}", n, data.len());
    }
    err_at!(IOError, file.sync_all())?;
    Ok(())
}

/// Fallible narrowing/widening integer conversion with a uniform error.
pub fn try_convert<T, U>(from: T, msg: &str) -> Result<U>
where
    T: Copy + std::fmt::Display + std::convert::TryInto<U>,
{
    from.try_into()
        .map_err(|_| Error::new(ErrorKind::InvalidArgument, "util::try_convert", format!("{}: {}", msg, from)))
}
