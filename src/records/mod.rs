//! Row storage.
//!
//! Rows are stored in an append-only log; the series index maps each
//! (user, mode) time series and each score key onto frame offsets.

mod index;
mod log;

pub use index::{
    ScoreEntry, ScoreEventEntry, ScoreKey, SeriesIndex, SeriesKey, SnapshotEntry,
};
pub use log::{LoggedRow, Row, RowIterator, RowKind, RowLog};
