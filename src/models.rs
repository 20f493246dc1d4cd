use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signalflow::{decode_series_id, encode_series_id, SeriesId};

/// One incoming time-series query, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Correlation id echoed back in the matching [`QueryResult`].
    pub ref_id: String,
    pub program: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    /// Zero means "let the service pick its default resolution".
    pub interval: Duration,
    /// Display name template, e.g. `$metric on $host`.
    pub alias: Option<String>,
}

impl Target {
    pub fn new(
        ref_id: impl Into<String>,
        program: impl Into<String>,
        start_time: DateTime<Utc>,
        stop_time: DateTime<Utc>,
        interval: Duration,
    ) -> Self {
        Self {
            ref_id: ref_id.into(),
            program: program.into(),
            start_time,
            stop_time,
            interval,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(with = "series_id_text")]
    pub id: SeriesId,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub points: Vec<Point>,
}

/// The query model a host attaches to every query, as JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModel {
    #[serde(default)]
    pub ref_id: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Series ids travel as the base64 text the streaming service uses.
mod series_id_text {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{decode_series_id, encode_series_id, SeriesId};

    pub fn serialize<S: Serializer>(id: &SeriesId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_series_id(*id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SeriesId, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode_series_id(&text).ok_or_else(|| D::Error::custom(format!("invalid series id '{}'", text)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceRequest {
    pub datasource: DatasourceInfo,
    pub time_range: TimeRange,
    pub queries: Vec<Query>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceInfo {
    pub url: String,
    #[serde(default)]
    pub json_data: serde_json::Value,
    #[serde(default)]
    pub decrypted_secure_json_data: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub from_epoch_ms: i64,
    pub to_epoch_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub model: serde_json::Value,
    #[serde(default)]
    pub interval_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceResponse {
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub ref_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
}
