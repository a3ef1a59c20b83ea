//! Raw payloads as delivered by the upstream game API, and their validation.
//!
//! The API quotes every number as a string and returns `null` for fields it
//! has no value for (inactive accounts have no rank, loved maps give no pp).
//! Raw types keep everything as optional strings; `validate` turns them into
//! typed values or fails naming the first bad field. Nothing is written for a
//! payload that fails validation.

use crate::error::{Result, TrackerError};
use crate::types::{
    Beatmap, BeatmapId, Mode, ScoreFields, StatFields, Timestamp, UserId,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Accept a string, a number or null.
fn lenient<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn present<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TrackerError::missing(field)),
    }
}

fn parse_required<T>(value: &Option<String>, field: &'static str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = present(value, field)?;
    raw.parse::<T>()
        .map_err(|e| TrackerError::validation(field, format!("'{raw}': {e}")))
}

fn parse_count(value: &Option<String>, field: &'static str) -> Result<i64> {
    let parsed: i64 = parse_required(value, field)?;
    if parsed < 0 {
        return Err(TrackerError::validation(
            field,
            format!("must not be negative, got {parsed}"),
        ));
    }
    Ok(parsed)
}

fn parse_float(value: &Option<String>, field: &'static str) -> Result<f64> {
    let parsed: f64 = parse_required(value, field)?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(TrackerError::validation(
            field,
            format!("must be a finite non-negative number, got {parsed}"),
        ));
    }
    Ok(parsed)
}

fn parse_date(value: &Option<String>, field: &'static str) -> Result<Timestamp> {
    let raw = present(value, field)?;
    Timestamp::parse_api(raw).map_err(|e| TrackerError::validation(field, format!("'{raw}': {e}")))
}

fn optional<T>(value: &Option<String>, field: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(_) => parse_required(value, field).map(Some),
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// A user stats payload (`get_user`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    #[serde(default, deserialize_with = "lenient")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub count300: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub count100: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub count50: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub playcount: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub ranked_score: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub total_score: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub pp_rank: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub level: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub pp_raw: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub accuracy: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub count_rank_ss: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub count_rank_s: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub count_rank_a: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub pp_country_rank: Option<String>,

    /// When the poller fetched this payload. Used as the capture time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<Timestamp>,
}

/// A stats payload that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedSnapshot {
    pub user_id: UserId,
    pub username: String,
    pub fields: StatFields,
}

impl RawSnapshot {
    /// Build a payload from already-typed values.
    pub fn from_stats(user_id: UserId, username: impl Into<String>, fields: &StatFields) -> Self {
        Self {
            user_id: Some(user_id.0.to_string()),
            username: Some(username.into()),
            count300: Some(fields.count300.to_string()),
            count100: Some(fields.count100.to_string()),
            count50: Some(fields.count50.to_string()),
            playcount: Some(fields.playcount.to_string()),
            ranked_score: Some(fields.ranked_score.to_string()),
            total_score: Some(fields.total_score.to_string()),
            pp_rank: Some(fields.pp_rank.to_string()),
            level: Some(fields.level.to_string()),
            pp_raw: Some(fields.pp_raw.to_string()),
            accuracy: Some(fields.accuracy.to_string()),
            count_rank_ss: Some(fields.count_rank_ss.to_string()),
            count_rank_s: Some(fields.count_rank_s.to_string()),
            count_rank_a: Some(fields.count_rank_a.to_string()),
            pp_country_rank: Some(fields.pp_country_rank.to_string()),
            fetched_at: None,
        }
    }

    pub fn with_fetched_at(mut self, at: Timestamp) -> Self {
        self.fetched_at = Some(at);
        self
    }

    /// Parse one payload object.
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    /// Parse a `get_user` response body, which is an array holding zero or
    /// one user. An empty array means the user doesn't exist upstream.
    pub fn from_api_response(body: &str) -> Result<Option<Self>> {
        let mut users: Vec<RawSnapshot> = serde_json::from_str(body)?;
        if users.is_empty() {
            return Ok(None);
        }
        Ok(Some(users.swap_remove(0)))
    }

    pub fn validate(&self) -> Result<ValidatedSnapshot> {
        let user_id = UserId(parse_required(&self.user_id, "user_id")?);
        let username = present(&self.username, "username")?.to_string();

        let accuracy = parse_float(&self.accuracy, "accuracy")?;
        if accuracy > 100.0 {
            return Err(TrackerError::validation(
                "accuracy",
                format!("must be at most 100, got {accuracy}"),
            ));
        }

        let fields = StatFields {
            count300: parse_count(&self.count300, "count300")?,
            count100: parse_count(&self.count100, "count100")?,
            count50: parse_count(&self.count50, "count50")?,
            playcount: parse_count(&self.playcount, "playcount")?,
            ranked_score: parse_count(&self.ranked_score, "ranked_score")?,
            total_score: parse_count(&self.total_score, "total_score")?,
            pp_rank: parse_count(&self.pp_rank, "pp_rank")?,
            level: parse_float(&self.level, "level")?,
            pp_raw: parse_float(&self.pp_raw, "pp_raw")?,
            accuracy,
            count_rank_ss: parse_count(&self.count_rank_ss, "count_rank_ss")?,
            count_rank_s: parse_count(&self.count_rank_s, "count_rank_s")?,
            count_rank_a: parse_count(&self.count_rank_a, "count_rank_a")?,
            pp_country_rank: parse_count(&self.pp_country_rank, "pp_country_rank")?,
        };

        Ok(ValidatedSnapshot {
            user_id,
            username,
            fields,
        })
    }
}

/// One entry of a `get_user_best` response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawScore {
    #[serde(default, deserialize_with = "lenient")]
    pub beatmap_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub score: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub pp: Option<String>,
    #[serde(default, alias = "mods", deserialize_with = "lenient")]
    pub enabled_mods: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub rank: Option<String>,
    #[serde(default, alias = "score_time", deserialize_with = "lenient")]
    pub date: Option<String>,
}

/// A score payload that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedScore {
    pub beatmap_id: Option<BeatmapId>,
    pub fields: ScoreFields,
}

impl RawScore {
    /// Build a payload from already-typed values.
    pub fn from_fields(beatmap_id: BeatmapId, fields: &ScoreFields) -> Self {
        Self {
            beatmap_id: Some(beatmap_id.0.to_string()),
            score: Some(fields.score.to_string()),
            pp: Some(fields.pp.to_string()),
            enabled_mods: Some(fields.enabled_mods.to_string()),
            rank: Some(fields.rank.clone()),
            date: fields.score_time.to_api_string(),
        }
    }

    /// Parse a `get_user_best` response body.
    pub fn from_api_response(body: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn validate(&self) -> Result<ValidatedScore> {
        let beatmap_id = optional::<u32>(&self.beatmap_id, "beatmap_id")?.map(BeatmapId);
        let score = parse_count(&self.score, "score")?;
        let pp = match optional::<f64>(&self.pp, "pp")? {
            Some(pp) if !pp.is_finite() || pp < 0.0 => {
                return Err(TrackerError::validation(
                    "pp",
                    format!("must be a finite non-negative number, got {pp}"),
                ))
            }
            Some(pp) => pp,
            None => 0.0,
        };
        let enabled_mods = optional::<u32>(&self.enabled_mods, "enabled_mods")?.unwrap_or(0);

        let rank = match self.rank.as_deref() {
            None | Some("") => return Err(TrackerError::missing("rank")),
            Some(rank) => rank,
        };
        if rank.len() > 3 || !rank.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TrackerError::validation(
                "rank",
                format!("'{rank}' is not a grade code"),
            ));
        }

        let score_time = parse_date(&self.date, "date")?;

        Ok(ValidatedScore {
            beatmap_id,
            fields: ScoreFields {
                score,
                pp,
                enabled_mods,
                rank: rank.to_string(),
                score_time,
            },
        })
    }
}

/// One entry of a `get_beatmaps` response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBeatmap {
    #[serde(default, deserialize_with = "lenient")]
    pub beatmap_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub beatmapset_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub approved: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub approved_date: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_update: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub total_length: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub hit_length: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub artist: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub creator: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub bpm: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub source: Option<String>,
    #[serde(default, alias = "difficulty", deserialize_with = "lenient")]
    pub difficultyrating: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub diff_size: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub diff_overall: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub diff_approach: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub diff_drain: Option<String>,
}

impl RawBeatmap {
    /// Parse a `get_beatmaps` response body.
    pub fn from_api_response(body: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn validate(&self) -> Result<Beatmap> {
        let mode: Mode = present(&self.mode, "mode")?.parse()?;
        let approved_date = match self.approved_date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(_) => Some(parse_date(&self.approved_date, "approved_date")?),
        };

        Ok(Beatmap {
            beatmap_id: BeatmapId(parse_required(&self.beatmap_id, "beatmap_id")?),
            beatmapset_id: parse_required(&self.beatmapset_id, "beatmapset_id")?,
            mode,
            approved: parse_required(&self.approved, "approved")?,
            approved_date,
            last_update: parse_date(&self.last_update, "last_update")?,
            total_length: parse_required(&self.total_length, "total_length")?,
            hit_length: parse_required(&self.hit_length, "hit_length")?,
            version: text(&self.version),
            artist: text(&self.artist),
            title: text(&self.title),
            creator: text(&self.creator),
            bpm: parse_float(&self.bpm, "bpm")?,
            source: text(&self.source),
            difficulty: parse_float(&self.difficultyrating, "difficultyrating")?,
            diff_size: parse_float(&self.diff_size, "diff_size")?,
            diff_overall: parse_float(&self.diff_overall, "diff_overall")?,
            diff_approach: parse_float(&self.diff_approach, "diff_approach")?,
            diff_drain: parse_float(&self.diff_drain, "diff_drain")?,
        })
    }
}
