//! Fetch windows, raw pages, and enriched records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{INGESTION_TIMESTAMP_KEY, SOURCE_ARTIFACT_URI_KEY, SOURCE_SYSTEM_KEY};

/// Rendering of [`FetchWindow::Whole`] in addresses and reports.
const WHOLE_WINDOW: &str = "all";

/// Unit of time partitioning for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FetchWindow {
    /// The whole resource, for endpoints without a date dimension.
    Whole,
    /// One calendar day.
    Day(NaiveDate),
}

impl FetchWindow {
    /// The window's day, if it is a day window.
    #[must_use]
    pub const fn date(&self) -> Option<NaiveDate> {
        match self {
            Self::Whole => None,
            Self::Day(date) => Some(*date),
        }
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whole => f.write_str(WHOLE_WINDOW),
            Self::Day(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

impl FromStr for FetchWindow {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == WHOLE_WINDOW {
            return Ok(Self::Whole);
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map(Self::Day)
    }
}

impl From<FetchWindow> for String {
    fn from(window: FetchWindow) -> Self {
        window.to_string()
    }
}

impl TryFrom<String> for FetchWindow {
    type Error = chrono::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Storage address of one archived page.
#[must_use]
pub fn artifact_address(
    tenant_key: &str,
    endpoint: &str,
    window: &FetchWindow,
    page_number: u32,
) -> String {
    format!("{}page_{page_number}", window_prefix(tenant_key, endpoint, window))
}

/// Common prefix of every page archived for one window (with trailing `/`).
#[must_use]
pub fn window_prefix(tenant_key: &str, endpoint: &str, window: &FetchWindow) -> String {
    format!("tenant/{tenant_key}/{endpoint}/{window}/")
}

/// One page of records exactly as the external API returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPage {
    /// Tenant the page belongs to.
    pub tenant_key: String,
    /// Endpoint the page was fetched from.
    pub endpoint: String,
    /// Window the page was fetched for.
    pub window: FetchWindow,
    /// Zero-based page number.
    pub page_number: u32,
    /// Raw records in API order.
    pub records: Vec<Value>,
    /// When the page arrived.
    pub fetched_at: DateTime<Utc>,
}

impl RawPage {
    /// Deterministic archive address of this page.
    #[must_use]
    pub fn address(&self) -> String {
        artifact_address(&self.tenant_key, &self.endpoint, &self.window, self.page_number)
    }
}

/// A raw record plus provenance metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    /// The record as fetched.
    pub record: Value,
    /// When the record entered the pipeline.
    pub ingestion_timestamp: DateTime<Utc>,
    /// Archive artifact holding the record, once written.
    pub source_artifact_uri: Option<String>,
    /// Upstream system label.
    pub source_system: String,
}

impl EnrichedRecord {
    /// Wraps a raw record.
    #[must_use]
    pub fn new(record: Value, ingestion_timestamp: DateTime<Utc>, source_system: &str) -> Self {
        Self {
            record,
            ingestion_timestamp,
            source_artifact_uri: None,
            source_system: source_system.to_string(),
        }
    }

    /// Returns a copy that points at the artifact it was archived in.
    #[must_use]
    pub fn with_artifact_uri(self, uri: &str) -> Self {
        Self {
            source_artifact_uri: Some(uri.to_string()),
            ..self
        }
    }

    /// Looks up a top-level key of the raw record.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.record.get(key)
    }

    /// The record with its enrichment keys merged in.
    ///
    /// Non-object records cannot carry extra keys and are returned as-is.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let Value::Object(fields) = &self.record else {
            return self.record.clone();
        };
        let mut fields = fields.clone();
        fields.insert(
            INGESTION_TIMESTAMP_KEY.to_string(),
            Value::String(self.ingestion_timestamp.to_rfc3339()),
        );
        fields.insert(
            SOURCE_SYSTEM_KEY.to_string(),
            Value::String(self.source_system.clone()),
        );
        if let Some(uri) = &self.source_artifact_uri {
            fields.insert(SOURCE_ARTIFACT_URI_KEY.to_string(), Value::String(uri.clone()));
        }
        Value::Object(fields)
    }

    /// Splits a persisted record back into raw record and metadata.
    ///
    /// Missing metadata falls back to `fallback_timestamp` and
    /// `fallback_system`.
    #[must_use]
    pub fn from_json(
        value: Value,
        uri: &str,
        fallback_timestamp: DateTime<Utc>,
        fallback_system: &str,
    ) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::new(value, fallback_timestamp, fallback_system).with_artifact_uri(uri);
        };
        let ingestion_timestamp = fields
            .remove(INGESTION_TIMESTAMP_KEY)
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or(fallback_timestamp, |dt| dt.with_timezone(&Utc));
        let source_system = fields
            .remove(SOURCE_SYSTEM_KEY)
            .as_ref()
            .and_then(Value::as_str)
            .map_or_else(|| fallback_system.to_string(), str::to_string);
        fields.remove(SOURCE_ARTIFACT_URI_KEY);

        Self {
            record: Value::Object(fields),
            ingestion_timestamp,
            source_artifact_uri: Some(uri.to_string()),
            source_system,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn window_display_and_parse_agree() {
        let day = FetchWindow::Day(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        assert_eq!(day.to_string(), "2024-03-09");
        assert_eq!("2024-03-09".parse::<FetchWindow>().unwrap(), day);
        assert_eq!("all".parse::<FetchWindow>().unwrap(), FetchWindow::Whole);
        assert!("yesterday".parse::<FetchWindow>().is_err());
    }

    #[test]
    fn page_address_is_deterministic() {
        let page = RawPage {
            tenant_key: "12345678000190".to_string(),
            endpoint: "vendas".to_string(),
            window: FetchWindow::Day(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
            page_number: 3,
            records: vec![],
            fetched_at: Utc::now(),
        };
        assert_eq!(page.address(), "tenant/12345678000190/vendas/2024-01-15/page_3");
        assert_eq!(
            artifact_address("1", "clientes", &FetchWindow::Whole, 0),
            "tenant/1/clientes/all/page_0"
        );
    }

    #[test]
    fn enrichment_survives_persisted_form() {
        let now = DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = EnrichedRecord::new(json!({"cpf": "1"}), now, "vmhub");
        let persisted = record.to_json();
        assert_eq!(persisted["_source_system"], "vmhub");
        assert!(persisted.get("_source_artifact_uri").is_none());

        let restored = EnrichedRecord::from_json(persisted, "mem://a", Utc::now(), "other");
        assert_eq!(restored.record, json!({"cpf": "1"}));
        assert_eq!(restored.ingestion_timestamp, now);
        assert_eq!(restored.source_system, "vmhub");
        assert_eq!(restored.source_artifact_uri.as_deref(), Some("mem://a"));
    }

    #[test]
    fn non_object_records_pass_through_untouched() {
        let record = EnrichedRecord::new(json!(42), Utc::now(), "vmhub");
        assert_eq!(record.to_json(), json!(42));
    }
}
