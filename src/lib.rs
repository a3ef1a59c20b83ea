//! # osutrack
//!
//! Tracks osu! player statistics over time and answers "what did I gain"
//! queries.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: append-only captures of a player's stats in one mode,
//!   stored only when something changed
//! - **Deltas**: field-by-field differences between anchored snapshots
//! - **Hiscores**: append-only score history with a current best per beatmap
//! - **Anomalies**: captures where a counter went backwards, stored and flagged
//!
//! ## Example
//!
//! ```ignore
//! use osutrack::{Mode, RawSnapshot, Timestamp, Tracker, TrackerConfig, UserId};
//!
//! let tracker = Tracker::open(TrackerConfig::at("./osutrack-data"))?;
//!
//! // Each poll hands the raw API payload to the tracker.
//! let raw = RawSnapshot::from_api_response(&body)?.expect("user exists");
//! tracker.ingest(UserId(2), Mode::Standard, raw)?;
//!
//! // Gains over the last day.
//! let now = Timestamp::now();
//! let delta = tracker.compute_delta(
//!     UserId(2),
//!     Mode::Standard,
//!     Timestamp::from_secs(now.as_secs() - 86_400),
//!     now,
//! )?;
//! ```

pub mod clock;
pub mod config;
pub mod delta;
pub mod detect;
pub mod error;
pub mod hiscores;
pub mod locks;
pub mod query;
pub mod raw;
pub mod records;
pub mod reference;
mod store;
pub mod tracker;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use delta::{Anchor, Delta, DeltaResult, RankDelta, StatDelta};
pub use detect::{ChangeDetector, Decision};
pub use error::{ErrorKind, Result, TrackerError};
pub use hiscores::{ScoreEventCounts, ScoreIngestResult};
pub use query::QueryOptions;
pub use raw::{RawBeatmap, RawScore, RawSnapshot, ValidatedScore, ValidatedSnapshot};
pub use tracker::{IngestResult, SkipReason, Tracker, UpdateSummary};
pub use types::*;
