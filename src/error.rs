//! Error kinds and the [Error] type returned by every public `levidb` API.
//!
//! Kinds mirror the taxonomy of the storage core: `NotFound`, `InvalidArgument`,
//! `IOError`, `Corruption` and `NotSupported`. An [Error] always carries a
//! `context` (typically `file:line` of the call-site, filled in by [err_at!])
//! and a human `detail` message, so failures read as `"kind context: detail"`.

use std::{fmt, io, result};

/// Broad classification of a failure, exposed at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing DB directory, or a required file missing on open.
    NotFound,
    /// Bad arguments: `error_if_exists` on an existing DB, unsupported
    /// format/db version, nested compaction, malformed options.
    InvalidArgument,
    /// Any OS-level read/write/rename/mmap/lock failure.
    IOError,
    /// CRC mismatch, framing-dependency violation, bad free-list or
    /// tree-node checksum, impossible length fields.
    Corruption,
    /// Reserved for features intentionally left unimplemented.
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::IOError => "IOError",
            ErrorKind::Corruption => "Corruption",
            ErrorKind::NotSupported => "NotSupported",
        };
        write!(f, "{}", s)
    }
}

/// The error type for every fallible `levidb` operation.
///
/// `context` and `detail` are the "two optional message fragments" the
/// storage core is specified to carry; both are always filled in practice,
/// `context` naming the call-site and `detail` the underlying cause.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: String,
    detail: String,
}

impl Error {
    pub fn new<C, D>(kind: ErrorKind, context: C, detail: D) -> Error
    where
        C: Into<String>,
        D: Into<String>,
    {
        Error {
            kind,
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.context, self.detail)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new(ErrorKind::IOError, "io", err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = result::Result<T, Error>;

/// Control-flow signals modeled as data instead of exceptions (§9 design
/// notes): reaching the 4 GiB shard cap on the log or the index, or an
/// index page needing to expand before an insert can proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowSignal {
    IndexFull,
    LogFull,
    NeedExpand,
}

/// The result of an operation that may instead report an [OverflowSignal]
/// rather than succeeding. Overflow is not an [Error]: it is expected,
/// recoverable, caller-handled control flow (the aggregator's split path,
/// or an index page's expansion path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    Overflow(OverflowSignal),
}

impl<T> Outcome<T> {
    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(v) => Some(v),
            Outcome::Overflow(_) => None,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, Outcome::Overflow(_))
    }
}

/// Build an [Error] at the call-site, or adapt a foreign `Result`'s `Err`
/// arm into one.
///
/// ```ignore
/// err_at!(Corruption, msg: "bad crc at offset {}", fpos)?;
/// let buf = err_at!(IOError, fd.read(&mut buf))?;
/// ```
#[macro_export]
macro_rules! err_at {
    ($kind:ident, msg: $($arg:expr),+ $(,)?) => {{
        let detail = format!($($arg),+);
        Err::<_, $crate::error::Error>($crate::error::Error::new(
            $crate::error::ErrorKind::$kind,
            format!("{}:{}", file!(), line!()),
            detail,
        ))
    }};
    ($kind:ident, $e:expr) => {
        match $e {
            Ok(val) => Ok(val),
            Err(err) => Err($crate::error::Error::new(
                $crate::error::ErrorKind::$kind,
                format!("{}:{}", file!(), line!()),
                err.to_string(),
            )),
        }
    };
}
