//! Endpoint catalog, loaded from embedded configs.
//!
//! Each `.toml` file in `packages/source/endpoints/` describes one API
//! resource and names a warehouse schema from `packages/source/schemas/`.
//! Both are baked into the binary at compile time via [`include_str!`];
//! adding an endpoint means adding the two files and listing them below.

use std::time::Duration;

use serde::Deserialize;
use vmhub_pipeline_models::{EndpointDescriptor, SchemaField, WindowParams};

/// Largest page size the VMHub API accepts.
pub const MAX_PAGE_SIZE: u32 = 10;

/// Endpoint configs embedded at compile time.
const ENDPOINT_TOMLS: &[(&str, &str)] = &[
    ("clientes", include_str!("../endpoints/clientes.toml")),
    ("vendas", include_str!("../endpoints/vendas.toml")),
];

/// Warehouse schemas embedded at compile time, keyed by file name.
const SCHEMA_JSONS: &[(&str, &str)] = &[
    ("clientes.json", include_str!("../schemas/clientes.json")),
    ("vendas.json", include_str!("../schemas/vendas.json")),
];

/// Total number of configured endpoints (used in tests).
#[cfg(test)]
const EXPECTED_ENDPOINT_COUNT: usize = 2;

/// Errors in an endpoint config.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The endpoint TOML is malformed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A schema file is malformed.
    #[error("schema {name} is invalid: {source}")]
    Schema {
        /// Schema file name.
        name: String,
        /// Underlying parse error.
        source: serde_json::Error,
    },

    /// The endpoint names a schema that is not embedded.
    #[error("endpoint {endpoint} references unknown schema {schema}")]
    UnknownSchema {
        /// Endpoint name.
        endpoint: String,
        /// Referenced schema file.
        schema: String,
    },

    /// The page size is outside what the API accepts.
    #[error("endpoint {endpoint}: page_size {page_size} must be between 1 and {MAX_PAGE_SIZE}")]
    InvalidPageSize {
        /// Endpoint name.
        endpoint: String,
        /// Configured page size.
        page_size: u32,
    },

    /// A time-partitioned endpoint has no day-bound parameters.
    #[error("endpoint {endpoint} is time partitioned but has no [window_params]")]
    MissingWindowParams {
        /// Endpoint name.
        endpoint: String,
    },

    /// The identifier field is not a top-level scalar column.
    #[error("endpoint {endpoint}: identifier {field} is not a scalar column of its schema")]
    InvalidIdentifier {
        /// Endpoint name.
        endpoint: String,
        /// Configured identifier field.
        field: String,
    },

    /// A requested endpoint is not in the catalog.
    #[error("unknown endpoint {name} (available: {available})")]
    UnknownEndpoint {
        /// Requested name.
        name: String,
        /// Comma-separated catalog names.
        available: String,
    },
}

/// On-disk shape of an endpoint config.
#[derive(Debug, Deserialize)]
struct EndpointToml {
    name: String,
    path: String,
    #[serde(default)]
    time_partitioned: bool,
    page_size: u32,
    #[serde(default)]
    page_delay_ms: u64,
    identifier_field: String,
    #[serde(default = "default_table")]
    table: String,
    schema: String,
    window_params: Option<WindowParams>,
    records_path: Option<String>,
}

fn default_table() -> String {
    "{endpoint}".to_string()
}

/// Parses one endpoint config, resolving its schema from `schemas`.
///
/// # Errors
///
/// Returns [`RegistryError`] if the config or its schema is invalid.
pub fn parse_endpoint_toml(
    toml_str: &str,
    schemas: &[(&str, &str)],
) -> Result<EndpointDescriptor, RegistryError> {
    let raw: EndpointToml = toml::from_str(toml_str)?;

    if raw.page_size == 0 || raw.page_size > MAX_PAGE_SIZE {
        return Err(RegistryError::InvalidPageSize {
            endpoint: raw.name,
            page_size: raw.page_size,
        });
    }

    if raw.time_partitioned && raw.window_params.is_none() {
        return Err(RegistryError::MissingWindowParams { endpoint: raw.name });
    }

    let (schema_name, schema_json) = schemas
        .iter()
        .find(|(name, _)| *name == raw.schema)
        .ok_or_else(|| RegistryError::UnknownSchema {
            endpoint: raw.name.clone(),
            schema: raw.schema.clone(),
        })?;
    let schema: Vec<SchemaField> =
        serde_json::from_str(schema_json).map_err(|source| RegistryError::Schema {
            name: (*schema_name).to_string(),
            source,
        })?;

    let identifier_ok = schema
        .iter()
        .any(|field| field.name == raw.identifier_field && !field.is_nested());
    if !identifier_ok {
        return Err(RegistryError::InvalidIdentifier {
            endpoint: raw.name,
            field: raw.identifier_field,
        });
    }

    Ok(EndpointDescriptor {
        name: raw.name,
        path: raw.path,
        time_partitioned: raw.time_partitioned,
        page_size: raw.page_size,
        page_delay: Duration::from_millis(raw.page_delay_ms),
        identifier_field: raw.identifier_field,
        table_template: raw.table,
        schema_ref: raw.schema,
        schema,
        window_params: raw.window_params,
        records_path: raw.records_path,
    })
}

/// Returns every configured endpoint, in catalog order.
///
/// # Panics
///
/// Panics if any embedded config is malformed (the configs are baked into
/// the binary, so this is caught by the tests below).
#[must_use]
pub fn all_endpoints() -> Vec<EndpointDescriptor> {
    ENDPOINT_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_endpoint_toml(toml, SCHEMA_JSONS)
                .unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Returns the endpoints named in `names` in catalog order, or the whole
/// catalog when `names` is empty.
///
/// # Errors
///
/// Returns [`RegistryError::UnknownEndpoint`] for a name not in the
/// catalog.
pub fn select_endpoints(names: &[String]) -> Result<Vec<EndpointDescriptor>, RegistryError> {
    let all = all_endpoints();

    if let Some(unknown) = names
        .iter()
        .find(|name| !all.iter().any(|e| &e.name == *name))
    {
        return Err(RegistryError::UnknownEndpoint {
            name: unknown.clone(),
            available: all
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }

    if names.is_empty() {
        return Ok(all);
    }

    Ok(all
        .into_iter()
        .filter(|e| names.contains(&e.name))
        .collect())
}

/// Looks up a single endpoint by name.
#[must_use]
pub fn find_endpoint(name: &str) -> Option<EndpointDescriptor> {
    all_endpoints().into_iter().find(|e| e.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_all_endpoints() {
        assert_eq!(all_endpoints().len(), EXPECTED_ENDPOINT_COUNT);
    }

    #[test]
    fn endpoint_names_are_unique() {
        let endpoints = all_endpoints();
        let mut names: Vec<&str> = endpoints.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EXPECTED_ENDPOINT_COUNT);
    }

    #[test]
    fn vendas_is_partitioned_by_day() {
        let vendas = find_endpoint("vendas").unwrap();
        assert!(vendas.time_partitioned);
        assert_eq!(vendas.window_params.unwrap().start, "dataInicio");
        assert_eq!(vendas.identifier_field, "idVenda");
        assert!(!find_endpoint("clientes").unwrap().time_partitioned);
    }

    #[test]
    fn rejects_page_size_above_api_cap() {
        let toml = r#"
            name = "big"
            path = "big"
            page_size = 50
            identifier_field = "cpf"
            schema = "clientes.json"
        "#;
        assert!(matches!(
            parse_endpoint_toml(toml, SCHEMA_JSONS),
            Err(RegistryError::InvalidPageSize { page_size: 50, .. })
        ));
    }

    #[test]
    fn rejects_partitioned_endpoint_without_window_params() {
        let toml = r#"
            name = "daily"
            path = "daily"
            time_partitioned = true
            page_size = 10
            identifier_field = "cpf"
            schema = "clientes.json"
        "#;
        assert!(matches!(
            parse_endpoint_toml(toml, SCHEMA_JSONS),
            Err(RegistryError::MissingWindowParams { .. })
        ));
    }

    #[test]
    fn rejects_identifier_outside_schema() {
        let toml = r#"
            name = "x"
            path = "x"
            page_size = 10
            identifier_field = "id"
            schema = "clientes.json"
        "#;
        assert!(matches!(
            parse_endpoint_toml(toml, SCHEMA_JSONS),
            Err(RegistryError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn selects_by_name_and_rejects_unknown() {
        let selected = select_endpoints(&["vendas".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "vendas");
        assert_eq!(select_endpoints(&[]).unwrap().len(), EXPECTED_ENDPOINT_COUNT);
        assert!(matches!(
            select_endpoints(&["produtos".to_string()]),
            Err(RegistryError::UnknownEndpoint { .. })
        ));
    }
}
