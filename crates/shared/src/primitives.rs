use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Text layout of datetime columns. Fractional seconds keep same-second
/// writes ordered, and the layout compares lexicographically the same way it
/// compares chronologically, which the incremental version queries rely on.
const DATETIME_COLUMN_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Accepts the column layout above plus RFC3339 for values that arrive over
/// the wire instead of from a column.
fn parse_datetime(value: &str) -> Result<chrono::DateTime<chrono::Utc>, anyhow::Error> {
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, DATETIME_COLUMN_FORMAT) {
        return Ok(naive.and_utc());
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .map(chrono::DateTime::<chrono::Utc>::from)
        .map_err(|e| anyhow::anyhow!("unrecognized datetime {value:?}: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WrappedChronoDateTime(chrono::DateTime<chrono::Utc>);

impl WrappedChronoDateTime {
    pub fn get_inner(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }

    pub fn new(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    pub fn unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }
}

impl TryFrom<&str> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        parse_datetime(value).map(Self)
    }
}

impl TryFrom<String> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_datetime(&value).map(Self)
    }
}

impl fmt::Display for WrappedChronoDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for WrappedChronoDateTime {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }
}

impl From<WrappedChronoDateTime> for chrono::DateTime<chrono::Utc> {
    fn from(value: WrappedChronoDateTime) -> Self {
        value.0
    }
}

impl WrappedChronoDateTime {
    pub fn from_sql_value(val: libsql::Value) -> libsql::Result<Self> {
        match val {
            libsql::Value::Text(s) => {
                parse_datetime(&s).map(Self).map_err(|_e| libsql::Error::InvalidColumnType)
            }
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

impl From<WrappedChronoDateTime> for libsql::Value {
    fn from(value: WrappedChronoDateTime) -> Self {
        libsql::Value::Text(value.0.format(DATETIME_COLUMN_FORMAT).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WrappedJsonValue(serde_json::Value);

impl WrappedJsonValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn get_inner(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for WrappedJsonValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<WrappedJsonValue> for serde_json::Value {
    fn from(value: WrappedJsonValue) -> Self {
        value.0
    }
}

impl From<WrappedJsonValue> for libsql::Value {
    fn from(value: WrappedJsonValue) -> Self {
        libsql::Value::Text(serde_json::to_string(&value.0).unwrap_or_else(|_| "null".to_string()))
    }
}

impl WrappedJsonValue {
    pub fn from_sql_value(val: libsql::Value) -> libsql::Result<Self> {
        match val {
            libsql::Value::Text(s) => Ok(WrappedJsonValue::new(
                serde_json::from_str(&s).map_err(|_e| libsql::Error::InvalidColumnType)?,
            )),
            libsql::Value::Null => Ok(WrappedJsonValue::new(serde_json::Value::Null)),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}
