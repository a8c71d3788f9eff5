//! Endpoint catalog entries and warehouse schema definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Column type in the warehouse schema dialect.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    /// UTF-8 text.
    #[serde(alias = "STR")]
    String,
    /// 64-bit signed integer.
    #[serde(alias = "INT64")]
    Integer,
    /// 64-bit float.
    #[serde(alias = "FLOAT64")]
    Float,
    /// Decimal number (stored as a float).
    Numeric,
    /// `true` / `false`.
    #[serde(alias = "BOOL")]
    Boolean,
    /// Instant, with or without an explicit offset.
    Timestamp,
    /// Civil date and time without an offset.
    Datetime,
    /// Calendar date.
    Date,
    /// Nested object described by [`SchemaField::fields`].
    #[serde(alias = "STRUCT")]
    Record,
}

/// Whether a field may be absent, must be present, or is an array.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldMode {
    /// May be absent or `null`.
    #[default]
    Nullable,
    /// Must be present and non-null.
    Required,
    /// Array of values of the field's type.
    Repeated,
}

/// One column of an endpoint's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Column (and JSON key) name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Nullability / repetition.
    #[serde(default)]
    pub mode: FieldMode,
    /// Child fields for `RECORD` columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Self>,
}

impl SchemaField {
    /// Whether the column is stored as nested JSON rather than a scalar.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.field_type == FieldType::Record || self.mode == FieldMode::Repeated
    }
}

/// Query parameter names carrying a day window's bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowParams {
    /// Parameter for the inclusive start of the day.
    pub start: String,
    /// Parameter for the inclusive end of the day.
    pub end: String,
}

/// One fetchable resource of the external API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Catalog name, also used in storage addresses.
    pub name: String,
    /// URL path relative to the API base URL.
    pub path: String,
    /// Whether the endpoint is fetched one day at a time.
    pub time_partitioned: bool,
    /// Records requested per page.
    pub page_size: u32,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
    /// Natural identifier used for deduplication.
    pub identifier_field: String,
    /// Target table name; `{endpoint}` and `{tenant_key}` are substituted.
    pub table_template: String,
    /// Name of the schema file the columns came from.
    pub schema_ref: String,
    /// Warehouse columns.
    pub schema: Vec<SchemaField>,
    /// Day-bound query parameters (partitioned endpoints only).
    pub window_params: Option<WindowParams>,
    /// Dot-separated path to the records array when the response body is
    /// a wrapping object instead of a bare array.
    pub records_path: Option<String>,
}

impl EndpointDescriptor {
    /// Renders the target table name for a tenant.
    #[must_use]
    pub fn table_name(&self, tenant_key: &str) -> String {
        self.table_template
            .replace("{endpoint}", &self.name)
            .replace("{tenant_key}", tenant_key)
    }

    /// Looks up the identifier column in the schema.
    #[must_use]
    pub fn identifier_column(&self) -> Option<&SchemaField> {
        self.schema
            .iter()
            .find(|field| field.name == self.identifier_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_warehouse_schema_json() {
        let json = r#"[
            {"name": "cpf", "type": "STRING", "mode": "REQUIRED"},
            {"name": "idade", "type": "INT64"},
            {"name": "enderecos", "type": "RECORD", "mode": "REPEATED", "fields": [
                {"name": "cidade", "type": "STRING"}
            ]}
        ]"#;
        let fields: Vec<SchemaField> = serde_json::from_str(json).unwrap();
        assert_eq!(fields[0].mode, FieldMode::Required);
        assert_eq!(fields[1].field_type, FieldType::Integer);
        assert_eq!(fields[1].mode, FieldMode::Nullable);
        assert!(fields[2].is_nested());
        assert_eq!(fields[2].fields.len(), 1);
    }

    #[test]
    fn renders_table_template() {
        let endpoint = EndpointDescriptor {
            name: "vendas".to_string(),
            path: "vendas".to_string(),
            time_partitioned: true,
            page_size: 10,
            page_delay: Duration::ZERO,
            identifier_field: "idVenda".to_string(),
            table_template: "{endpoint}_{tenant_key}".to_string(),
            schema_ref: "vendas.json".to_string(),
            schema: Vec::new(),
            window_params: None,
            records_path: None,
        };
        assert_eq!(endpoint.table_name("123"), "vendas_123");
        assert!(endpoint.identifier_column().is_none());
    }
}
