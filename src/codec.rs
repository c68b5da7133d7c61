//! Format seam: the pipeline only ever sees rows of `T` through these traits.

use anyhow::Result;
use std::path::Path;

/// Why a single row could not be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowFault {
    /// The raw row could not be read or parsed at all.
    Unreadable,
    /// The row parsed but does not fit the record type.
    Invalid,
}

/// Receives rows from a decoder, in file order.
pub trait RowVisitor<T> {
    /// An `Err` stops decoding; the file is treated as failed.
    fn record(&mut self, row_index: u64, record: T) -> Result<()>;

    /// Return `true` to continue with the next row.
    fn row_error(&mut self, row_index: u64, fault: RowFault, error: anyhow::Error) -> bool;

    /// Called once after the last row of a fully decoded file.
    fn complete(&mut self) -> Result<()>;
}

pub trait RowEncoder<T>: Send {
    /// Append a chunk. On error no row of the chunk may be left in the output.
    fn encode(&mut self, records: &[T]) -> Result<()>;

    /// Flush and close. Calling it again is a no-op.
    fn finish(&mut self) -> Result<()>;
}

/// Reads and writes one tabular format.
pub trait RowCodec<T>: Send + Sync {
    fn decode(&self, path: &Path, visitor: &mut dyn RowVisitor<T>) -> Result<()>;

    fn create_encoder(&self, path: &Path) -> Result<Box<dyn RowEncoder<T>>>;
}
