//! In-memory indices over the row log.
//!
//! Rebuilt from the log on open. Every entry points at the offset of its
//! frame so full rows are only decoded when a query needs them.

use crate::types::{BeatmapId, Mode, RowId, ScoreFingerprint, ScoreOutcome, Timestamp, UserId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// A (user, mode) time series.
pub type SeriesKey = (UserId, Mode);

/// A (user, beatmap, mode) score history.
pub type ScoreKey = (UserId, BeatmapId, Mode);

/// Index entry for one stat snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: RowId,
    pub offset: u64,
    pub captured_at: Timestamp,
    pub anomaly: bool,
}

/// Index entry for one score row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreEntry {
    pub id: RowId,
    pub offset: u64,
    pub score: i64,
    pub score_time: Timestamp,
    pub recorded_at: Timestamp,
    pub fingerprint: ScoreFingerprint,
    pub outcome: ScoreOutcome,
}

impl ScoreEntry {
    /// Whether this entry holds the best slot over `other`: higher score,
    /// then the earlier play, then the earlier row.
    pub fn outranks(&self, other: &ScoreEntry) -> bool {
        if self.score != other.score {
            return self.score > other.score;
        }
        (self.score_time, self.id) < (other.score_time, other.id)
    }
}

/// Index entry for a score as an event in a (user, mode) timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreEventEntry {
    pub id: RowId,
    pub offset: u64,
    pub outcome: ScoreOutcome,
}

#[derive(Debug, Default)]
struct ScoreSeries {
    entries: Vec<ScoreEntry>,
    best: Option<usize>,
}

impl ScoreSeries {
    fn push(&mut self, entry: ScoreEntry) {
        let position = self.entries.len();
        let takes_best = match self.best {
            Some(best) => entry.outranks(&self.entries[best]),
            None => true,
        };
        self.entries.push(entry);
        if takes_best {
            self.best = Some(position);
        }
    }

    fn best(&self) -> Option<ScoreEntry> {
        self.best.map(|i| self.entries[i])
    }
}

/// Indices over snapshots, scores and online samples.
pub struct SeriesIndex {
    /// (user, mode) -> (captured_at, id) -> entry
    snapshots: RwLock<HashMap<SeriesKey, BTreeMap<(Timestamp, RowId), SnapshotEntry>>>,

    /// (user, beatmap, mode) -> score rows in append order.
    scores: RwLock<HashMap<ScoreKey, ScoreSeries>>,

    /// (user, mode) -> (recorded_at, id) -> score event
    score_events: RwLock<HashMap<SeriesKey, BTreeMap<(Timestamp, RowId), ScoreEventEntry>>>,

    /// (recorded_at, id) -> offset
    online: RwLock<BTreeMap<(Timestamp, RowId), u64>>,
}

impl Default for SeriesIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesIndex {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            scores: RwLock::new(HashMap::new()),
            score_events: RwLock::new(HashMap::new()),
            online: RwLock::new(BTreeMap::new()),
        }
    }

    // Snapshots

    pub fn insert_snapshot(&self, key: SeriesKey, entry: SnapshotEntry) {
        self.snapshots
            .write()
            .entry(key)
            .or_default()
            .insert((entry.captured_at, entry.id), entry);
    }

    pub fn last_snapshot(&self, key: SeriesKey) -> Option<SnapshotEntry> {
        self.snapshots
            .read()
            .get(&key)
            .and_then(|series| series.values().next_back().copied())
    }

    /// Up to `n` most recent snapshots, newest first.
    pub fn latest_snapshots(&self, key: SeriesKey, n: usize) -> Vec<SnapshotEntry> {
        self.snapshots
            .read()
            .get(&key)
            .map(|series| series.values().rev().take(n).copied().collect())
            .unwrap_or_default()
    }

    /// The newest snapshot captured at or before `at`. On equal capture
    /// times the higher row id wins.
    pub fn anchor_at_or_before(&self, key: SeriesKey, at: Timestamp) -> Option<SnapshotEntry> {
        self.snapshots.read().get(&key).and_then(|series| {
            series
                .range(..=(at, RowId::MAX))
                .next_back()
                .map(|(_, entry)| *entry)
        })
    }

    /// Snapshots with `from <= captured_at <= to`, oldest first.
    pub fn snapshots_between(
        &self,
        key: SeriesKey,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<SnapshotEntry> {
        if from > to {
            return Vec::new();
        }
        self.snapshots
            .read()
            .get(&key)
            .map(|series| {
                series
                    .range((from, RowId::MIN)..=(to, RowId::MAX))
                    .map(|(_, entry)| *entry)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Anomalous snapshots with `after < captured_at <= upto`.
    pub fn anomalies_between(&self, key: SeriesKey, after: Timestamp, upto: Timestamp) -> usize {
        if after >= upto {
            return 0;
        }
        self.snapshots
            .read()
            .get(&key)
            .map(|series| {
                series
                    .range((
                        Bound::Excluded((after, RowId::MAX)),
                        Bound::Included((upto, RowId::MAX)),
                    ))
                    .filter(|(_, entry)| entry.anomaly)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshots
            .read()
            .values()
            .map(|series| series.len() as u64)
            .sum()
    }

    // Scores

    pub fn insert_score(&self, key: ScoreKey, entry: ScoreEntry) {
        self.scores.write().entry(key).or_default().push(entry);
        self.score_events
            .write()
            .entry((key.0, key.2))
            .or_default()
            .insert(
                (entry.recorded_at, entry.id),
                ScoreEventEntry {
                    id: entry.id,
                    offset: entry.offset,
                    outcome: entry.outcome,
                },
            );
    }

    /// Number of rows recorded for a score key.
    pub fn score_len(&self, key: ScoreKey) -> usize {
        self.scores
            .read()
            .get(&key)
            .map(|series| series.entries.len())
            .unwrap_or(0)
    }

    pub fn best_score(&self, key: ScoreKey) -> Option<ScoreEntry> {
        self.scores.read().get(&key).and_then(ScoreSeries::best)
    }

    /// All rows for a score key in append order.
    pub fn score_series(&self, key: ScoreKey) -> Vec<ScoreEntry> {
        self.scores
            .read()
            .get(&key)
            .map(|series| series.entries.clone())
            .unwrap_or_default()
    }

    pub fn find_fingerprint(&self, key: ScoreKey, fingerprint: &ScoreFingerprint) -> Option<ScoreEntry> {
        self.scores.read().get(&key).and_then(|series| {
            series
                .entries
                .iter()
                .find(|entry| &entry.fingerprint == fingerprint)
                .copied()
        })
    }

    /// Score events with `from < recorded_at <= to`, oldest first.
    pub fn score_events_between(
        &self,
        key: SeriesKey,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<ScoreEventEntry> {
        if from >= to {
            return Vec::new();
        }
        self.score_events
            .read()
            .get(&key)
            .map(|events| {
                events
                    .range((
                        Bound::Excluded((from, RowId::MAX)),
                        Bound::Included((to, RowId::MAX)),
                    ))
                    .map(|(_, entry)| *entry)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn score_count(&self) -> u64 {
        self.scores
            .read()
            .values()
            .map(|series| series.entries.len() as u64)
            .sum()
    }

    // Online samples

    pub fn insert_online(&self, recorded_at: Timestamp, id: RowId, offset: u64) {
        self.online.write().insert((recorded_at, id), offset);
    }

    /// Offsets of samples with `from <= recorded_at <= to`, oldest first.
    pub fn online_between(&self, from: Timestamp, to: Timestamp) -> Vec<u64> {
        if from > to {
            return Vec::new();
        }
        self.online
            .read()
            .range((from, RowId::MIN)..=(to, RowId::MAX))
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn last_online(&self) -> Option<u64> {
        self.online.read().values().next_back().copied()
    }

    pub fn online_count(&self) -> u64 {
        self.online.read().len() as u64
    }

    /// Drop everything recorded for a user. Returns the number of entries removed.
    pub fn purge_user(&self, user: UserId) -> u64 {
        let mut removed = 0u64;

        self.snapshots.write().retain(|(owner, _), series| {
            if *owner == user {
                removed += series.len() as u64;
                false
            } else {
                true
            }
        });

        self.scores.write().retain(|(owner, _, _), series| {
            if *owner == user {
                removed += series.entries.len() as u64;
                false
            } else {
                true
            }
        });

        self.score_events
            .write()
            .retain(|(owner, _), _| *owner != user);

        removed
    }
}
