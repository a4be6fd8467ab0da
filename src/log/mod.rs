//! Append-only record log: block/chunk framing, the writer, the reader
//! and its cache. See §4.1.

pub mod cache;
pub mod format;
pub mod reader;
pub mod writer;

pub use cache::RecordCache;
pub use reader::{RecordCursor, RecoveryIterator, TableIterator};
pub use writer::LogWriter;
