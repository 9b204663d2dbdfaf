use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// How long after creation a URL-supplied [ParamSet] is still accepted.
///
/// Must cover the app-to-browser handoff and iframe bootstrap, while keeping captured
/// URLs from being replayed later.
pub const DEFAULT_MAX_AGE_SECS: i64 = 60;

/// The shared session configuration passed from the app to the landing page, and from
/// the page script to the iframe.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSet {
    /// Opaque bearer credential. `None` means no usable credential.
    pub tokens: Option<String>,
    /// ISO-8601 creation time. Absent for legacy producers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Forwarded to the server (platform, version, attempt count, referrer).
    pub metadata: Map<String, Value>,
    #[serde(deserialize_with = "deserialize_flag")]
    pub dev: bool,
    #[serde(deserialize_with = "deserialize_flag")]
    pub debug: bool,
}

impl ParamSet {
    pub fn with_tokens(tokens: impl Into<String>) -> Self {
        Self {
            tokens: Some(tokens.into()),
            ..Default::default()
        }
    }

    /// Sets the creation time, formatted the way the app formats it.
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
        self
    }

    pub fn has_tokens(&self) -> bool {
        self.tokens.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// The parsed creation time, `None` if absent.
    pub fn parsed_timestamp(&self) -> Option<Result<DateTime<Utc>>> {
        self.timestamp.as_deref().map(parse_timestamp)
    }

    /// The creation time used for ordering. Unparseable timestamps order like absent ones.
    fn order_key(&self) -> Option<DateTime<Utc>> {
        self.parsed_timestamp().and_then(|parsed| parsed.ok())
    }

    /// Rejects timestamped params that are unparseable, from the future, or too old.
    /// Params without a timestamp are always accepted.
    pub fn check_freshness(&self, now: DateTime<Utc>, freshness: &Freshness) -> Result<()> {
        let Some(parsed) = self.parsed_timestamp() else {
            return Ok(());
        };
        let timestamp = parsed?;
        if timestamp > now + freshness.max_future_skew {
            return Err(Error::FutureTimestamp(timestamp.to_rfc3339()));
        }
        if now - timestamp > freshness.max_age {
            return Err(Error::StaleTimestamp(timestamp.to_rfc3339()));
        }
        Ok(())
    }
}

/// Acceptance window for URL-supplied params.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Freshness {
    pub max_age: Duration,
    pub max_future_skew: Duration,
}

impl Default for Freshness {
    fn default() -> Self {
        Self {
            max_age: Duration::seconds(DEFAULT_MAX_AGE_SECS),
            max_future_skew: Duration::zero(),
        }
    }
}

/// Picks the more recent of two params.
///
/// A timestamped instance beats an untimestamped one regardless of argument order. When
/// both (or neither) are timestamped and they tie, `a` wins. Tokens are not compared, so
/// newer params without tokens still win.
pub fn newest(a: Option<ParamSet>, b: Option<ParamSet>) -> Option<ParamSet> {
    let (a, b) = match (a, b) {
        (None, b) => return b,
        (a, None) => return a,
        (Some(a), Some(b)) => (a, b),
    };
    match (a.order_key(), b.order_key()) {
        (Some(ta), Some(tb)) if tb > ta => Some(b),
        (None, Some(_)) => Some(b),
        _ => Some(a),
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Timestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Interprets a loosely-typed flag value. `""`, `"0"`, `"false"`, `0`, and `null` are false.
pub fn flag_from_str(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "False" | "FALSE")
}

fn flag_from_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => flag_from_str(s),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(flag_from_value(&value))
}
