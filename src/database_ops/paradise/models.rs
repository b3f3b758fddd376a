use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::database_ops::upsert::{SqlValue, UpsertRow};

/// One entry of the `/roundlist` listing (same shape as `/metadata/{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundMetadata {
    pub round_id: i64,
    #[serde(default)]
    pub game_mode: Option<String>,
    #[serde(default)]
    pub game_mode_result: Option<String>,
    #[serde(default)]
    pub end_state: Option<String>,
    #[serde(default)]
    pub map_name: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub initialize_datetime: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub start_datetime: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub shutdown_datetime: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub end_datetime: Option<NaiveDateTime>,
    /// Listing fields we don't model explicitly; persisted as JSONB so nothing is lost.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RoundMetadata {
    pub fn new(round_id: i64) -> Self {
        Self {
            round_id,
            game_mode: None,
            game_mode_result: None,
            end_state: None,
            map_name: None,
            server_id: None,
            commit_hash: None,
            initialize_datetime: None,
            start_datetime: None,
            shutdown_datetime: None,
            end_datetime: None,
            extra: Map::new(),
        }
    }
}

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn lenient_datetime<'de, D>(de: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_datetime(s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognized datetime '{s}'"))),
    }
}

/// Occupancy at one point of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerCountSample {
    pub timestamp: String,
    pub count: i64,
}

/// Accepts `{timestamp: count}` objects, arrays of `{timestamp, count}` objects and
/// arrays of `[timestamp, count]` pairs. Output is ordered by timestamp.
pub fn parse_player_counts(payload: Value) -> Result<Vec<PlayerCountSample>, String> {
    let mut samples = match payload {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .into_iter()
            .map(|(timestamp, v)| Ok(PlayerCountSample { count: count_of(&v)?, timestamp }))
            .collect::<Result<Vec<_>, String>>()?,
        Value::Array(items) => items
            .into_iter()
            .map(sample_from_item)
            .collect::<Result<Vec<_>, String>>()?,
        other => return Err(format!("unexpected playercounts payload: {other}")),
    };
    // ISO-8601 strings sort chronologically.
    samples.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(samples)
}

fn sample_from_item(item: Value) -> Result<PlayerCountSample, String> {
    match item {
        Value::Object(mut obj) => {
            let timestamp = obj
                .remove("timestamp")
                .or_else(|| obj.remove("time"))
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| "playercount sample without timestamp".to_string())?;
            let count = obj
                .get("count")
                .or_else(|| obj.get("playercount"))
                .ok_or_else(|| format!("playercount sample at {timestamp} without count"))
                .and_then(count_of)?;
            Ok(PlayerCountSample { timestamp, count })
        }
        Value::Array(pair) if pair.len() == 2 => {
            let timestamp = pair[0]
                .as_str()
                .ok_or_else(|| format!("bad playercount timestamp: {}", pair[0]))?
                .to_string();
            Ok(PlayerCountSample { count: count_of(&pair[1])?, timestamp })
        }
        other => Err(format!("unexpected playercount sample: {other}")),
    }
}

fn count_of(v: &Value) -> Result<i64, String> {
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f.round() as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| format!("non-numeric playercount: {v}"))
}

/// Blackbox payloads arrive as a list of feedback entries; a lone object or null is
/// coerced into that shape.
pub fn blackbox_entries(payload: Value) -> Vec<Value> {
    match payload {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Structural cleanup applied after collection: `raw_data` fields holding JSON encoded
/// as a string are decoded in place. Entry order is untouched.
pub fn normalize_blackbox(entries: Vec<Value>) -> Vec<Value> {
    entries.into_iter().map(normalize_entry).collect()
}

fn normalize_entry(mut entry: Value) -> Value {
    if let Some(obj) = entry.as_object_mut() {
        if let Some(Value::String(raw)) = obj.get("raw_data") {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                obj.insert("raw_data".into(), parsed);
            }
        }
    }
    entry
}

/// Metadata plus the two per-round detail payloads; the detail-table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRoundRecord {
    pub metadata: RoundMetadata,
    pub player_counts: Vec<PlayerCountSample>,
    pub stats: Vec<Value>,
}

impl UnifiedRoundRecord {
    pub fn round_id(&self) -> i64 {
        self.metadata.round_id
    }
}

fn metadata_values(m: &RoundMetadata) -> Vec<(&'static str, SqlValue)> {
    vec![
        ("round_id", SqlValue::BigInt(Some(m.round_id))),
        ("game_mode", SqlValue::Text(m.game_mode.clone())),
        ("game_mode_result", SqlValue::Text(m.game_mode_result.clone())),
        ("end_state", SqlValue::Text(m.end_state.clone())),
        ("map_name", SqlValue::Text(m.map_name.clone())),
        ("server_id", SqlValue::Text(m.server_id.clone())),
        ("commit_hash", SqlValue::Text(m.commit_hash.clone())),
        ("initialize_datetime", SqlValue::Timestamp(m.initialize_datetime)),
        ("start_datetime", SqlValue::Timestamp(m.start_datetime)),
        ("shutdown_datetime", SqlValue::Timestamp(m.shutdown_datetime)),
        ("end_datetime", SqlValue::Timestamp(m.end_datetime)),
        ("extra", SqlValue::Json(Value::Object(m.extra.clone()))),
    ]
}

impl UpsertRow for RoundMetadata {
    fn round_id(&self) -> i64 {
        self.round_id
    }

    fn values(&self) -> Vec<(&'static str, SqlValue)> {
        metadata_values(self)
    }
}

impl UpsertRow for UnifiedRoundRecord {
    fn round_id(&self) -> i64 {
        self.metadata.round_id
    }

    fn values(&self) -> Vec<(&'static str, SqlValue)> {
        let mut out = metadata_values(&self.metadata);
        out.push((
            "player_counts",
            SqlValue::Json(serde_json::to_value(&self.player_counts).unwrap_or(Value::Null)),
        ));
        out.push(("stats", SqlValue::Json(Value::Array(self.stats.clone()))));
        out
    }
}
