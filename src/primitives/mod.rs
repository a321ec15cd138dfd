//! Low-level primitives the cursor engine is built on.
//!
//! Includes byte utilities, latches, the page accessor with its file spaces,
//! mini-transactions, and the redo log buffer.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Latches and the process-wide hash-index latch.
pub mod concurrency;

/// Mini-transactions binding page latches to their redo records.
pub mod mtr;

/// Page accessor, tablespaces and extent reservations.
pub mod pager;

/// Redo log buffer.
pub mod wal;
