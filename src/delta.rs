//! Field-by-field deltas between anchored snapshots.
//!
//! A delta over `[from, to]` subtracts the newest snapshot captured at or
//! before `from` (the start anchor) from the newest snapshot captured at or
//! before `to` (the end anchor). When nothing was captured at or before
//! `from` there is no baseline, which is reported as
//! [`DeltaResult::NoBaseline`] rather than as a zero delta.
//!
//! Rank-type fields get a [`RankDelta`] with an explicit `improved` flag:
//! a lower placement is better, so a negative raw delta is an improvement.

use crate::error::{Result, TrackerError};
use crate::query::Deadline;
use crate::records::SeriesKey;
use crate::store::SnapshotStore;
use crate::types::{Mode, RowId, StatFields, StatSnapshot, Timestamp, UserId};
use serde::Serialize;

/// Movement of a placement where lower is better and 0 means unranked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RankDelta {
    pub from: i64,
    pub to: i64,
    /// `to - from`. Negative means the placement number went down.
    pub delta: i64,
    /// Whether the placement got better. Becoming ranked is an
    /// improvement; dropping to unranked never is.
    pub improved: bool,
}

impl RankDelta {
    pub fn between(from: i64, to: i64) -> Self {
        let improved = match (from, to) {
            (_, 0) => false,
            (0, _) => true,
            (from, to) => to < from,
        };
        Self {
            from,
            to,
            delta: to - from,
            improved,
        }
    }
}

/// Differences for every tracked field, `end - start`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatDelta {
    pub count300: i64,
    pub count100: i64,
    pub count50: i64,
    pub playcount: i64,
    pub ranked_score: i64,
    pub total_score: i64,
    pub pp_rank: RankDelta,
    pub level: f64,
    pub pp_raw: f64,
    pub accuracy: f64,
    pub count_rank_ss: i64,
    pub count_rank_s: i64,
    pub count_rank_a: i64,
    pub pp_country_rank: RankDelta,
}

impl StatDelta {
    pub fn between(start: &StatFields, end: &StatFields) -> Self {
        Self {
            count300: end.count300 - start.count300,
            count100: end.count100 - start.count100,
            count50: end.count50 - start.count50,
            playcount: end.playcount - start.playcount,
            ranked_score: end.ranked_score - start.ranked_score,
            total_score: end.total_score - start.total_score,
            pp_rank: RankDelta::between(start.pp_rank, end.pp_rank),
            level: end.level - start.level,
            pp_raw: end.pp_raw - start.pp_raw,
            accuracy: end.accuracy - start.accuracy,
            count_rank_ss: end.count_rank_ss - start.count_rank_ss,
            count_rank_s: end.count_rank_s - start.count_rank_s,
            count_rank_a: end.count_rank_a - start.count_rank_a,
            pp_country_rank: RankDelta::between(start.pp_country_rank, end.pp_country_rank),
        }
    }

    /// The zero delta at a capture.
    pub fn zero(at: &StatFields) -> Self {
        Self::between(at, at)
    }

    /// Whether nothing moved, with floats compared within `epsilon`.
    pub fn is_zero(&self, epsilon: f64) -> bool {
        let ints = [
            self.count300,
            self.count100,
            self.count50,
            self.playcount,
            self.ranked_score,
            self.total_score,
            self.pp_rank.delta,
            self.count_rank_ss,
            self.count_rank_s,
            self.count_rank_a,
            self.pp_country_rank.delta,
        ];
        let floats = [self.level, self.pp_raw, self.accuracy];
        ints.iter().all(|v| *v == 0) && floats.iter().all(|v| v.abs() <= epsilon)
    }
}

/// A snapshot chosen as a delta boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Anchor {
    pub id: RowId,
    pub captured_at: Timestamp,
}

impl From<&StatSnapshot> for Anchor {
    fn from(snapshot: &StatSnapshot) -> Self {
        Self {
            id: snapshot.id,
            captured_at: snapshot.captured_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Delta {
    /// `None` when the end is the first capture and the delta is against zero.
    pub start: Option<Anchor>,
    pub end: Anchor,
    pub first_update: bool,
    /// Anomaly-flagged snapshots captured after the start, up to the end.
    pub anomalies: usize,
    pub changes: StatDelta,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum DeltaResult {
    /// Nothing was captured at or before the start of the range.
    NoBaseline,
    Delta(Delta),
}

impl DeltaResult {
    pub fn delta(&self) -> Option<&Delta> {
        match self {
            DeltaResult::Delta(delta) => Some(delta),
            DeltaResult::NoBaseline => None,
        }
    }

    pub fn is_no_baseline(&self) -> bool {
        matches!(self, DeltaResult::NoBaseline)
    }
}

fn between(store: &SnapshotStore, key: SeriesKey, start: &StatSnapshot, end: &StatSnapshot) -> Delta {
    Delta {
        start: Some(Anchor::from(start)),
        end: Anchor::from(end),
        first_update: false,
        anomalies: store.anomalies_between(key, start.captured_at, end.captured_at),
        changes: StatDelta::between(&start.fields, &end.fields),
    }
}

fn first_update(end: &StatSnapshot) -> Delta {
    Delta {
        start: None,
        end: Anchor::from(end),
        first_update: true,
        anomalies: 0,
        changes: StatDelta::between(&StatFields::default(), &end.fields),
    }
}

/// Delta over `[from, to]`.
pub(crate) fn compute_delta(
    store: &SnapshotStore,
    user: UserId,
    mode: Mode,
    from: Timestamp,
    to: Timestamp,
    deadline: &Deadline,
) -> Result<DeltaResult> {
    if from > to {
        return Err(TrackerError::validation(
            "range",
            format!("start {from:?} is after end {to:?}"),
        ));
    }
    deadline.check()?;

    let key = (user, mode);
    let Some(start) = store.anchor_at_or_before(key, from) else {
        return Ok(DeltaResult::NoBaseline);
    };
    let end = store.anchor_at_or_before(key, to).unwrap_or(start);

    let start = store.load_snapshot(&start)?;
    deadline.check()?;

    if start.id == end.id {
        return Ok(DeltaResult::Delta(Delta {
            start: Some(Anchor::from(&start)),
            end: Anchor::from(&start),
            first_update: false,
            anomalies: 0,
            changes: StatDelta::zero(&start.fields),
        }));
    }

    let end = store.load_snapshot(&end)?;
    Ok(DeltaResult::Delta(between(store, key, &start, &end)))
}

/// Delta between the two most recent snapshots.
pub(crate) fn latest_changes(
    store: &SnapshotStore,
    user: UserId,
    mode: Mode,
    deadline: &Deadline,
) -> Result<DeltaResult> {
    let key = (user, mode);
    let entries = store.latest_snapshot_entries(key, 2);
    deadline.check()?;

    match entries.as_slice() {
        [] => Ok(DeltaResult::NoBaseline),
        [only] => Ok(DeltaResult::Delta(first_update(&store.load_snapshot(only)?))),
        [end, start, ..] => {
            let end = store.load_snapshot(end)?;
            let start = store.load_snapshot(start)?;
            Ok(DeltaResult::Delta(between(store, key, &start, &end)))
        }
    }
}

/// Delta from the snapshot just before the most recent pp change up to the
/// latest snapshot. With a single capture this is the first update; with no
/// pp change on record there is no baseline.
pub(crate) fn changes_since_pp_gain(
    store: &SnapshotStore,
    user: UserId,
    mode: Mode,
    epsilon: f64,
    deadline: &Deadline,
) -> Result<DeltaResult> {
    let key = (user, mode);
    let entries = store.latest_snapshot_entries(key, usize::MAX);

    let Some((latest_entry, older)) = entries.split_first() else {
        return Ok(DeltaResult::NoBaseline);
    };
    let latest = store.load_snapshot(latest_entry)?;
    if older.is_empty() {
        return Ok(DeltaResult::Delta(first_update(&latest)));
    }

    let mut newer_pp = latest.fields.pp_raw;
    for entry in older {
        deadline.check()?;
        let candidate = store.load_snapshot(entry)?;
        if (candidate.fields.pp_raw - newer_pp).abs() > epsilon {
            return Ok(DeltaResult::Delta(between(store, key, &candidate, &latest)));
        }
        newer_pp = candidate.fields.pp_raw;
    }

    Ok(DeltaResult::NoBaseline)
}
