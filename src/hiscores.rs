//! High-score classification.
//!
//! Scores are never overwritten. Every play that is not an exact
//! redelivery is appended; the outcome only records how it compared to the
//! best on record when it arrived.

use crate::types::{BeatmapId, Mode, ScoreFields, ScoreFingerprint, ScoreOutcome, ScoreRecord, UserId};

/// Result of ingesting one score.
#[derive(Clone, Debug, PartialEq)]
pub enum ScoreIngestResult {
    /// First score for the key.
    New(ScoreRecord),
    /// Took the best slot from the previous best, which is returned
    /// alongside: a higher score, or the same score played earlier.
    Improved {
        record: ScoreRecord,
        previous_best: ScoreRecord,
    },
    /// Appended to history; the best is unchanged.
    Unchanged(ScoreRecord),
    /// Exact redelivery of a play already on record. Nothing was appended.
    Recorded(ScoreRecord),
}

impl ScoreIngestResult {
    pub fn record(&self) -> &ScoreRecord {
        match self {
            ScoreIngestResult::New(record)
            | ScoreIngestResult::Improved { record, .. }
            | ScoreIngestResult::Unchanged(record)
            | ScoreIngestResult::Recorded(record) => record,
        }
    }

    /// Whether this ingestion produced a new best.
    pub fn is_new_best(&self) -> bool {
        matches!(
            self,
            ScoreIngestResult::New(_) | ScoreIngestResult::Improved { .. }
        )
    }

    /// Whether a row was appended.
    pub fn appended(&self) -> bool {
        !matches!(self, ScoreIngestResult::Recorded(_))
    }
}

/// Outcome of an incoming score against the current best.
///
/// Follows the best-slot order of the score index: a higher score wins,
/// and an equal score wins only if it was played strictly earlier. An
/// incoming row is always newer than the best, so equal times keep the best.
pub fn classify(best: Option<&ScoreRecord>, incoming: &ScoreFields) -> ScoreOutcome {
    match best {
        None => ScoreOutcome::New,
        Some(best) if incoming.score > best.score => ScoreOutcome::Improved,
        Some(best) if incoming.score == best.score && incoming.score_time < best.score_time => {
            ScoreOutcome::Improved
        }
        Some(_) => ScoreOutcome::Unchanged,
    }
}

/// Fingerprint of a play. Two deliveries of the same play hash the same.
pub fn fingerprint(
    user: UserId,
    beatmap: BeatmapId,
    mode: Mode,
    fields: &ScoreFields,
) -> ScoreFingerprint {
    let mut canonical = Vec::with_capacity(4 + 4 + 1 + 8 + 4 + 8 + fields.rank.len());
    canonical.extend_from_slice(&user.0.to_le_bytes());
    canonical.extend_from_slice(&beatmap.0.to_le_bytes());
    canonical.push(mode.as_u8());
    canonical.extend_from_slice(&fields.score.to_le_bytes());
    canonical.extend_from_slice(&fields.enabled_mods.to_le_bytes());
    canonical.extend_from_slice(&fields.score_time.0.to_le_bytes());
    canonical.extend_from_slice(fields.rank.as_bytes());
    ScoreFingerprint::from_bytes(&canonical)
}

/// Score rows in a time range, by outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScoreEventCounts {
    pub new: usize,
    pub improved: usize,
    pub unchanged: usize,
}

impl ScoreEventCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a ScoreRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.outcome {
                ScoreOutcome::New => counts.new += 1,
                ScoreOutcome::Improved => counts.improved += 1,
                ScoreOutcome::Unchanged => counts.unchanged += 1,
            }
        }
        counts
    }

    /// Rows that took the best slot on arrival.
    pub fn new_bests(&self) -> usize {
        self.new + self.improved
    }

    pub fn total(&self) -> usize {
        self.new + self.improved + self.unchanged
    }
}
