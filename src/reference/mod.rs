//! Reference data shared across series.
//!
//! Users and beatmaps are rebuilt from the row log on open. Scores and
//! snapshots refer to them by id only.

mod tables;

pub use tables::ReferenceTables;
