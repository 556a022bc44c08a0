//! Document-store contract + the journal join/shape pipeline.
//!
//! The aggregation pipeline built here is the only place that knows how the
//! three source collections relate; everything downstream sees flat projected
//! documents mapped once into typed rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jrex_core::{CellValue, RawRow, RecordId};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "jrex-source";

pub const JOURNALS_COLLECTION: &str = "journals";
pub const USERS_COLLECTION: &str = "userdetails";
pub const LOCATIONS_COLLECTION: &str = "locations";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("document store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("document store returned http {status}: {detail}")]
    HttpStatus { status: u16, detail: String },
}

/// Aggregation capability the pipeline consumes. Implementations only need to
/// run a pipeline over a named collection and answer a reachability probe;
/// join, projection, and sort semantics all live in the pipeline stages.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), SourceError>;

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, SourceError>;
}

/// Match filter for exportable journals: completed records only, optionally
/// restricted to identities past the watermark.
pub fn completed_filter(after: Option<&RecordId>) -> Value {
    let mut filter = json!({ "end_time": { "$ne": null } });
    if let Some(id) = after {
        filter["_id"] = json!({ "$gt": { "$oid": id.to_string() } });
    }
    filter
}

/// The join/shape contract over the journal collection: left-join users and
/// locations through fallibly-converted references (a bad reference becomes a
/// null join, never a failed row), derive coordinates from the flat fields
/// with the geo-point array as last resort, project the flat export shape
/// including the `LocCountry`/`Address` intermediates, and sort by the string
/// form of the identity for deterministic resumable iteration.
pub fn journal_pipeline(match_filter: Value) -> Vec<Value> {
    vec![
        json!({ "$match": match_filter }),
        json!({ "$addFields": {
            "uid_obj": { "$convert": { "input": "$uid", "to": "objectId", "onError": null, "onNull": null } },
            "loc_obj": { "$convert": { "input": "$locationId", "to": "objectId", "onError": null, "onNull": null } },
        }}),
        json!({ "$lookup": {
            "from": USERS_COLLECTION,
            "let": { "u": "$uid_obj" },
            "pipeline": [ { "$match": { "$expr": { "$eq": ["$_id", "$$u"] } } } ],
            "as": "u",
        }}),
        json!({ "$unwind": { "path": "$u", "preserveNullAndEmptyArrays": true } }),
        json!({ "$lookup": {
            "from": LOCATIONS_COLLECTION,
            "let": { "l": "$loc_obj" },
            "pipeline": [ { "$match": { "$expr": { "$eq": ["$_id", "$$l"] } } } ],
            "as": "loc",
        }}),
        json!({ "$unwind": { "path": "$loc", "preserveNullAndEmptyArrays": true } }),
        json!({ "$addFields": {
            "lng_from_geojson": { "$cond": [
                { "$eq": [{ "$type": "$loc.coordinates.coordinates" }, "array"] },
                { "$arrayElemAt": ["$loc.coordinates.coordinates", 0] },
                null,
            ]},
            "lat_from_geojson": { "$cond": [
                { "$eq": [{ "$type": "$loc.coordinates.coordinates" }, "array"] },
                { "$arrayElemAt": ["$loc.coordinates.coordinates", 1] },
                null,
            ]},
        }}),
        json!({ "$project": {
            "_id": 0,
            "journal_id": { "$toString": "$_id" },
            "Timestamp": "$start_time",
            "End Date Time": "$end_time",
            "User Name": { "$ifNull": ["$u.name", ""] },
            "User email": { "$ifNull": ["$u.email", ""] },
            "n_Name": { "$ifNull": ["$loc.name", ""] },
            "City": { "$ifNull": ["$loc.city", ""] },
            "State": { "$ifNull": ["$loc.stateInitials", { "$ifNull": ["$loc.state", ""] }] },
            "Zip": { "$ifNull": ["$loc.zip", ""] },
            "LocCountry": { "$ifNull": ["$loc.country", ""] },
            "Address": { "$ifNull": ["$loc.address", ""] },
            "n_Place": { "$concat": [
                { "$ifNull": ["$loc.name", ""] }, ", ",
                { "$ifNull": ["$loc.city", ""] }, " ",
                { "$ifNull": ["$loc.stateInitials", { "$ifNull": ["$loc.state", ""] }] },
            ]},
            "n_Lati": { "$ifNull": ["$loc.coordinates.lat", { "$ifNull": ["$loc.coordinates.latitude", "$lat_from_geojson"] }] },
            "n_Long": { "$ifNull": ["$loc.coordinates.lng", { "$ifNull": ["$loc.coordinates.longitude", "$lng_from_geojson"] }] },
            "n_park_nbr": { "$ifNull": ["$loc.parkNumber", { "$arrayElemAt": ["$loc.category", 0] }] },
        }}),
        json!({ "$sort": { "journal_id": 1 } }),
    ]
}

/// Map one projected document into a typed row. Total: absent or oddly-shaped
/// fields become empty strings or `Null`, a row is never rejected.
pub fn map_document(doc: &Value) -> RawRow {
    RawRow {
        journal_id: text_field(doc, "journal_id"),
        user_name: text_field(doc, "User Name"),
        user_email: text_field(doc, "User email"),
        timestamp: cell_field(doc, "Timestamp"),
        end_date_time: cell_field(doc, "End Date Time"),
        n_name: text_field(doc, "n_Name"),
        city: text_field(doc, "City"),
        state: text_field(doc, "State"),
        zip: text_field(doc, "Zip"),
        country: String::new(),
        n_place: text_field(doc, "n_Place"),
        n_lati: cell_field(doc, "n_Lati"),
        n_long: cell_field(doc, "n_Long"),
        n_park_nbr: text_field(doc, "n_park_nbr"),
        loc_country: text_field(doc, "LocCountry"),
        address: text_field(doc, "Address"),
    }
}

fn text_field(doc: &Value, key: &str) -> String {
    match doc.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn cell_field(doc: &Value, key: &str) -> CellValue {
    doc.get(key).map_or(CellValue::Null, value_to_cell)
}

fn value_to_cell(value: &Value) -> CellValue {
    match value {
        Value::Null | Value::Array(_) => CellValue::Null,
        Value::String(s) => CellValue::from_text(s.clone()),
        Value::Number(n) => n.as_f64().map_or(CellValue::Null, CellValue::Number),
        Value::Bool(b) => CellValue::Text(b.to_string()),
        Value::Object(map) => {
            if let Some(date) = map.get("$date") {
                parse_ejson_date(date)
            } else if let Some(text) = map.get("$numberDouble").or_else(|| map.get("$numberDecimal")) {
                numeric_string_to_cell(text)
            } else if let Some(text) = map.get("$numberLong").or_else(|| map.get("$numberInt")) {
                numeric_string_to_cell(text)
            } else {
                CellValue::Null
            }
        }
    }
}

fn numeric_string_to_cell(value: &Value) -> CellValue {
    match value {
        Value::String(s) => s.parse::<f64>().map_or(CellValue::Null, CellValue::Number),
        Value::Number(n) => n.as_f64().map_or(CellValue::Null, CellValue::Number),
        _ => CellValue::Null,
    }
}

fn parse_ejson_date(value: &Value) -> CellValue {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| CellValue::Timestamp(dt.with_timezone(&Utc)))
            .unwrap_or_else(|_| CellValue::from_text(s.clone())),
        Value::Object(map) => map
            .get("$numberLong")
            .and_then(|millis| match millis {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .and_then(DateTime::from_timestamp_millis)
            .map_or(CellValue::Null, CellValue::Timestamp),
        _ => CellValue::Null,
    }
}

#[derive(Debug, Clone)]
pub struct DataApiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub data_source: String,
    pub database: String,
    pub timeout: Duration,
}

/// HTTP client for a Data-API-style aggregation endpoint: one POST per
/// pipeline, extended-JSON documents back.
#[derive(Debug)]
pub struct DataApiStore {
    client: reqwest::Client,
    config: DataApiConfig,
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    documents: Vec<Value>,
}

impl DataApiStore {
    pub fn new(config: DataApiConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DocumentStore for DataApiStore {
    async fn ping(&self) -> Result<(), SourceError> {
        self.aggregate(JOURNALS_COLLECTION, &[json!({ "$limit": 1 })])
            .await
            .map(|_| ())
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, SourceError> {
        let url = format!(
            "{}/action/aggregate",
            self.config.endpoint.trim_end_matches('/')
        );
        let body = json!({
            "dataSource": self.config.data_source,
            "database": self.config.database,
            "collection": collection,
            "pipeline": pipeline,
        });

        tracing::debug!(collection, stages = pipeline.len(), "running aggregation");
        let response = self
            .client
            .post(&url)
            .header("api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                detail,
            });
        }

        let parsed: AggregateResponse = response.json().await?;
        Ok(parsed.documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_always_requires_completion() {
        let filter = completed_filter(None);
        assert_eq!(filter["end_time"], json!({ "$ne": null }));
        assert!(filter.get("_id").is_none());
    }

    #[test]
    fn filter_bounds_identity_when_watermark_present() {
        let id: RecordId = "65a1b2c3d4e5f60718293a4b".parse().expect("id");
        let filter = completed_filter(Some(&id));
        assert_eq!(
            filter["_id"],
            json!({ "$gt": { "$oid": "65a1b2c3d4e5f60718293a4b" } })
        );
    }

    #[test]
    fn pipeline_starts_with_match_and_ends_sorted() {
        let stages = journal_pipeline(completed_filter(None));
        assert_eq!(stages[0]["$match"]["end_time"], json!({ "$ne": null }));
        assert_eq!(
            stages.last().expect("stages")["$sort"],
            json!({ "journal_id": 1 })
        );
    }

    #[test]
    fn pipeline_converts_references_fallibly() {
        let stages = journal_pipeline(completed_filter(None));
        let convert = &stages[1]["$addFields"]["uid_obj"]["$convert"];
        assert_eq!(convert["onError"], Value::Null);
        assert_eq!(convert["onNull"], Value::Null);
    }

    #[test]
    fn pipeline_prefers_flat_coordinates_over_geo_array() {
        let stages = journal_pipeline(completed_filter(None));
        let project = stages
            .iter()
            .find_map(|s| s.get("$project"))
            .expect("project stage");
        assert_eq!(
            project["n_Lati"],
            json!({ "$ifNull": ["$loc.coordinates.lat", { "$ifNull": ["$loc.coordinates.latitude", "$lat_from_geojson"] }] })
        );
        assert_eq!(
            project["State"],
            json!({ "$ifNull": ["$loc.stateInitials", { "$ifNull": ["$loc.state", ""] }] })
        );
        assert_eq!(
            project["n_park_nbr"],
            json!({ "$ifNull": ["$loc.parkNumber", { "$arrayElemAt": ["$loc.category", 0] }] })
        );
    }

    #[test]
    fn geo_array_extraction_is_guarded_by_type_check() {
        let stages = journal_pipeline(completed_filter(None));
        let lng = &stages[6]["$addFields"]["lng_from_geojson"]["$cond"];
        assert_eq!(
            lng[0],
            json!({ "$eq": [{ "$type": "$loc.coordinates.coordinates" }, "array"] })
        );
        assert_eq!(lng[1], json!({ "$arrayElemAt": ["$loc.coordinates.coordinates", 0] }));
    }

    #[test]
    fn documents_map_to_rows_totally() {
        let doc = json!({
            "journal_id": "65a1b2c3d4e5f60718293a4b",
            "User Name": "A",
            "User email": "a@example.com",
            "Timestamp": { "$date": "2024-03-01T08:30:00Z" },
            "End Date Time": { "$date": { "$numberLong": "1709283000000" } },
            "n_Name": "Umstead",
            "City": "Raleigh",
            "State": "NC",
            "Zip": 27612,
            "LocCountry": "",
            "Address": "8801 Glenwood Ave",
            "n_Place": "Umstead, Raleigh NC",
            "n_Lati": { "$numberDouble": "35.890471" },
            "n_Long": -78.750465,
            "n_park_nbr": "P-17",
        });
        let row = map_document(&doc);
        assert_eq!(row.journal_id, "65a1b2c3d4e5f60718293a4b");
        assert_eq!(row.zip, "27612");
        assert_eq!(row.n_lati.as_f64(), Some(35.890471));
        assert_eq!(row.n_long.as_f64(), Some(-78.750465));
        assert_eq!(row.timestamp.to_text(), "2024-03-01T08:30:00+00:00");
        assert!(matches!(row.end_date_time, CellValue::Timestamp(_)));
        assert_eq!(row.country, "");
    }

    #[test]
    fn missing_joins_become_empty_strings() {
        let doc = json!({ "journal_id": "65a1b2c3d4e5f60718293a4b" });
        let row = map_document(&doc);
        assert_eq!(row.user_name, "");
        assert_eq!(row.user_email, "");
        assert_eq!(row.n_place, "");
        assert_eq!(row.n_lati, CellValue::Null);
        assert_eq!(row.timestamp, CellValue::Null);
    }

    #[test]
    fn malformed_cells_degrade_not_fail() {
        let doc = json!({
            "journal_id": "x",
            "n_Lati": "north-ish",
            "Timestamp": "yesterday morning",
            "n_Long": { "$numberDouble": "not-a-number" },
        });
        let row = map_document(&doc);
        assert_eq!(row.n_lati.as_f64(), None);
        assert_eq!(row.n_long, CellValue::Null);
        assert_eq!(row.timestamp.to_text(), "yesterday morning");
    }
}
