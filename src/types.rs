//! Core types for the tracker.

use crate::error::TrackerError;
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Date format used by the upstream game API.
pub const API_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// osu! user id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u32);

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// osu! beatmap id (a single difficulty, not the set).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BeatmapId(pub u32);

impl fmt::Debug for BeatmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BeatmapId({})", self.0)
    }
}

impl fmt::Display for BeatmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned row identity. Strictly increasing across every table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct RowId(pub u64);

impl RowId {
    pub const MIN: RowId = RowId(0);
    pub const MAX: RowId = RowId(u64::MAX);

    pub fn next(self) -> Self {
        RowId(self.0 + 1)
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Row({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    pub fn as_secs(self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    /// The smallest timestamp strictly after this one.
    pub fn next(self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }

    /// Parse a date in the upstream API format (UTC).
    pub fn parse_api(value: &str) -> Result<Self, chrono::ParseError> {
        let naive = NaiveDateTime::parse_from_str(value.trim(), API_DATE_FORMAT)?;
        Ok(Timestamp(Utc.from_utc_datetime(&naive).timestamp_micros()))
    }

    /// Format in the upstream API format, if representable.
    pub fn to_api_string(self) -> Option<String> {
        Utc.timestamp_micros(self.0)
            .single()
            .map(|dt| dt.format(API_DATE_FORMAT).to_string())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Game mode. Closed set; anything else is rejected at the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    Standard = 0,
    Taiko = 1,
    CatchTheBeat = 2,
    Mania = 3,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Standard, Mode::Taiko, Mode::CatchTheBeat, Mode::Mania];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Standard => "osu",
            Mode::Taiko => "taiko",
            Mode::CatchTheBeat => "fruits",
            Mode::Mania => "mania",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Mode {
    type Error = TrackerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Standard),
            1 => Ok(Mode::Taiko),
            2 => Ok(Mode::CatchTheBeat),
            3 => Ok(Mode::Mania),
            other => Err(TrackerError::validation(
                "mode",
                format!("unknown mode {other}, expected 0-3"),
            )),
        }
    }
}

impl FromStr for Mode {
    type Err = TrackerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "osu" | "standard" | "std" => Ok(Mode::Standard),
            "1" | "taiko" => Ok(Mode::Taiko),
            "2" | "fruits" | "ctb" | "catch" => Ok(Mode::CatchTheBeat),
            "3" | "mania" => Ok(Mode::Mania),
            other => Err(TrackerError::validation(
                "mode",
                format!("unknown mode '{other}'"),
            )),
        }
    }
}

/// How a stat field behaves over time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Integer that only ever grows. A decrease is a source anomaly.
    Counter,
    /// Integer that legitimately moves both ways.
    Value,
    /// Placement where lower is better and 0 means unranked.
    Rank,
    /// Floating-point value compared with an epsilon.
    Float,
}

/// One tracked stat field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatField {
    Count300,
    Count100,
    Count50,
    Playcount,
    RankedScore,
    TotalScore,
    PpRank,
    Level,
    PpRaw,
    Accuracy,
    CountRankSs,
    CountRankS,
    CountRankA,
    PpCountryRank,
}

impl StatField {
    pub const ALL: [StatField; 14] = [
        StatField::Count300,
        StatField::Count100,
        StatField::Count50,
        StatField::Playcount,
        StatField::RankedScore,
        StatField::TotalScore,
        StatField::PpRank,
        StatField::Level,
        StatField::PpRaw,
        StatField::Accuracy,
        StatField::CountRankSs,
        StatField::CountRankS,
        StatField::CountRankA,
        StatField::PpCountryRank,
    ];

    /// Field name as used by the upstream API.
    pub fn name(self) -> &'static str {
        match self {
            StatField::Count300 => "count300",
            StatField::Count100 => "count100",
            StatField::Count50 => "count50",
            StatField::Playcount => "playcount",
            StatField::RankedScore => "ranked_score",
            StatField::TotalScore => "total_score",
            StatField::PpRank => "pp_rank",
            StatField::Level => "level",
            StatField::PpRaw => "pp_raw",
            StatField::Accuracy => "accuracy",
            StatField::CountRankSs => "count_rank_ss",
            StatField::CountRankS => "count_rank_s",
            StatField::CountRankA => "count_rank_a",
            StatField::PpCountryRank => "pp_country_rank",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            StatField::Count300
            | StatField::Count100
            | StatField::Count50
            | StatField::Playcount
            | StatField::TotalScore => FieldKind::Counter,
            StatField::RankedScore
            | StatField::CountRankSs
            | StatField::CountRankS
            | StatField::CountRankA => FieldKind::Value,
            StatField::PpRank | StatField::PpCountryRank => FieldKind::Rank,
            StatField::Level | StatField::PpRaw | StatField::Accuracy => FieldKind::Float,
        }
    }

    pub fn is_monotonic(self) -> bool {
        self.kind() == FieldKind::Counter
    }
}

impl fmt::Display for StatField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of a single field, as read through [`StatFields::get`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
}

/// The numeric fields of one stat capture.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct StatFields {
    pub count300: i64,
    pub count100: i64,
    pub count50: i64,
    pub playcount: i64,
    pub ranked_score: i64,
    pub total_score: i64,
    pub pp_rank: i64,
    pub level: f64,
    pub pp_raw: f64,
    pub accuracy: f64,
    pub count_rank_ss: i64,
    pub count_rank_s: i64,
    pub count_rank_a: i64,
    pub pp_country_rank: i64,
}

impl StatFields {
    pub fn get(&self, field: StatField) -> FieldValue {
        match field {
            StatField::Count300 => FieldValue::Int(self.count300),
            StatField::Count100 => FieldValue::Int(self.count100),
            StatField::Count50 => FieldValue::Int(self.count50),
            StatField::Playcount => FieldValue::Int(self.playcount),
            StatField::RankedScore => FieldValue::Int(self.ranked_score),
            StatField::TotalScore => FieldValue::Int(self.total_score),
            StatField::PpRank => FieldValue::Int(self.pp_rank),
            StatField::Level => FieldValue::Float(self.level),
            StatField::PpRaw => FieldValue::Float(self.pp_raw),
            StatField::Accuracy => FieldValue::Float(self.accuracy),
            StatField::CountRankSs => FieldValue::Int(self.count_rank_ss),
            StatField::CountRankS => FieldValue::Int(self.count_rank_s),
            StatField::CountRankA => FieldValue::Int(self.count_rank_a),
            StatField::PpCountryRank => FieldValue::Int(self.pp_country_rank),
        }
    }
}

/// A monotonic field that went backwards between two captures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Regression {
    pub field: StatField,
    pub previous: i64,
    pub current: i64,
}

/// A tracked player. Identity is fixed; the timestamps move on every ingestion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedUser {
    pub id: UserId,
    pub username: String,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// One stored capture of a user's stats in one mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub id: RowId,
    pub user_id: UserId,
    pub mode: Mode,
    /// When the stats were observed upstream. Strictly increasing per (user, mode).
    pub captured_at: Timestamp,
    /// When the row was written.
    pub recorded_at: Timestamp,
    pub fields: StatFields,
    /// Monotonic fields that regressed against the previous snapshot.
    pub regressions: Vec<Regression>,
}

impl StatSnapshot {
    pub fn is_anomaly(&self) -> bool {
        !self.regressions.is_empty()
    }
}

/// How a recorded score related to the best on record when it arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreOutcome {
    /// First score for the (user, beatmap, mode) key.
    New,
    /// Took the best slot from the previous best.
    Improved,
    /// Kept for history only.
    Unchanged,
}

/// Validated score values, before the store assigns identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreFields {
    pub score: i64,
    pub pp: f64,
    pub enabled_mods: u32,
    /// Letter grade as reported upstream ("SH", "A", ...).
    pub rank: String,
    /// When the play happened in-game.
    pub score_time: Timestamp,
}

/// A stored hiscore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: RowId,
    pub user_id: UserId,
    pub beatmap_id: BeatmapId,
    pub mode: Mode,
    pub score: i64,
    pub pp: f64,
    pub enabled_mods: u32,
    pub rank: String,
    pub score_time: Timestamp,
    pub recorded_at: Timestamp,
    pub outcome: ScoreOutcome,
}

impl ScoreRecord {
    /// Whether this record was appended for history only and never took
    /// the best slot on arrival.
    pub fn is_history_only(&self) -> bool {
        self.outcome == ScoreOutcome::Unchanged
    }
}

/// Beatmap reference metadata. Shared, referenced from scores by id only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Beatmap {
    pub beatmap_id: BeatmapId,
    pub beatmapset_id: u32,
    pub mode: Mode,
    /// Upstream approval state (-2 graveyard .. 4 loved).
    pub approved: i8,
    pub approved_date: Option<Timestamp>,
    pub last_update: Timestamp,
    pub total_length: u32,
    pub hit_length: u32,
    pub version: String,
    pub artist: String,
    pub title: String,
    pub creator: String,
    pub bpm: f64,
    pub source: String,
    pub difficulty: f64,
    pub diff_size: f64,
    pub diff_overall: f64,
    pub diff_approach: f64,
    pub diff_drain: f64,
}

/// A point-in-time sample of server population.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineActivity {
    pub id: RowId,
    pub recorded_at: Timestamp,
    pub users: u32,
    pub operators: u32,
    pub voiced: u32,
}

/// Content fingerprint of a play (SHA-256), used to absorb redelivery.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScoreFingerprint(pub [u8; 32]);

impl ScoreFingerprint {
    /// Compute the fingerprint of a canonical byte encoding.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ScoreFingerprint(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(ScoreFingerprint(arr))
    }
}

impl fmt::Debug for ScoreFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScoreFingerprint({}...)", &self.to_hex()[..8])
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub snapshot_count: u64,
    pub score_count: u64,
    pub online_count: u64,
    pub user_count: u64,
    pub beatmap_count: u64,
    pub log_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_roundtrip() {
        let fp = ScoreFingerprint::from_bytes(b"user:1 map:2 score:900000");
        let parsed = ScoreFingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn test_timestamp_api_format() {
        let ts = Timestamp::parse_api("2017-03-04 12:30:00").unwrap();
        assert_eq!(ts.as_secs(), 1_488_630_600);
        assert_eq!(ts.to_api_string().as_deref(), Some("2017-03-04 12:30:00"));
        assert!(Timestamp::parse_api("yesterday").is_err());
    }

    #[test]
    fn test_timestamp_next() {
        assert_eq!(Timestamp(5).next(), Timestamp(6));
        assert_eq!(Timestamp::MAX.next(), Timestamp::MAX);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(Mode::try_from(3).unwrap(), Mode::Mania);
        assert!(Mode::try_from(4).is_err());
        assert_eq!("ctb".parse::<Mode>().unwrap(), Mode::CatchTheBeat);
        assert_eq!("0".parse::<Mode>().unwrap(), Mode::Standard);
        assert!("piano".parse::<Mode>().is_err());
    }

    #[test]
    fn test_field_kinds() {
        assert!(StatField::Playcount.is_monotonic());
        assert!(!StatField::RankedScore.is_monotonic());
        assert_eq!(StatField::PpRank.kind(), FieldKind::Rank);
        assert_eq!(StatField::Accuracy.kind(), FieldKind::Float);
        assert_eq!(StatField::ALL.len(), 14);
    }

    #[test]
    fn test_fields_get() {
        let fields = StatFields {
            playcount: 150,
            pp_raw: 1234.5,
            ..Default::default()
        };
        assert_eq!(fields.get(StatField::Playcount), FieldValue::Int(150));
        assert_eq!(fields.get(StatField::PpRaw), FieldValue::Float(1234.5));
    }
}
