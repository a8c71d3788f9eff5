//! Per-tenant `DuckDB` datasets.
//!
//! Each tenant gets its own file at `{warehouse_dir}/CNPJ_{tenantKey}_RAW.duckdb`
//! with one table per endpoint. Every table carries the endpoint's schema
//! columns plus `_window`, `_ingestion_timestamp`, `_source_artifact_uri`,
//! `_source_system`, and `_raw` (the enriched record as JSON).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use duckdb::Connection;
use serde_json::Value;
use vmhub_pipeline_models::{EnrichedRecord, FetchWindow, SOURCE_SYSTEM, TenantConfig};

use crate::schema::{SqlValue, coerce, column_type, placeholder, quote_ident};
use crate::validate::identifier_key;
use crate::{TableSpec, WarehouseBackend, WarehouseError, WarehouseProvider};

/// Number of rows per INSERT chunk.
const CHUNK_SIZE: usize = 1_000;

/// Metadata columns appended after the schema columns, with their
/// placeholders.
const META_COLUMNS: &[(&str, &str, &str)] = &[
    ("_window", "VARCHAR NOT NULL", "?"),
    ("_ingestion_timestamp", "TIMESTAMP NOT NULL", "CAST(? AS TIMESTAMP)"),
    ("_source_artifact_uri", "VARCHAR", "?"),
    ("_source_system", "VARCHAR NOT NULL", "?"),
    ("_raw", "VARCHAR NOT NULL", "?"),
];

/// One tenant dataset backed by a `DuckDB` connection.
///
/// `duckdb::Connection` is `Send` but not `Sync`, so it is wrapped in a
/// `Mutex`.
pub struct DuckDbWarehouse {
    conn: Mutex<Connection>,
}

impl DuckDbWarehouse {
    /// Opens (or creates) the dataset file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the directory or connection cannot be
    /// created.
    pub fn open(path: &Path) -> Result<Self, WarehouseError> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a throwaway in-memory dataset.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the connection cannot be created.
    pub fn in_memory() -> Result<Self, WarehouseError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, WarehouseError> {
        self.conn.lock().map_err(|_| WarehouseError::Poisoned)
    }
}

#[async_trait]
impl WarehouseBackend for DuckDbWarehouse {
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?")?;
        let count: i64 = stmt.query_row([table], |row| row.get(0))?;
        Ok(count > 0)
    }

    async fn create_table(&self, spec: &TableSpec<'_>) -> Result<(), WarehouseError> {
        let sql = create_table_sql(spec)?;
        log::info!("Creating table {}", spec.name);
        self.lock()?.execute_batch(&sql)?;
        Ok(())
    }

    async fn upsert(
        &self,
        spec: &TableSpec<'_>,
        window: &FetchWindow,
        rows: &[EnrichedRecord],
    ) -> Result<u64, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let window = window.to_string();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut total = 0u64;

        for chunk in rows.chunks(CHUNK_SIZE) {
            let sql = upsert_sql(spec, chunk.len());
            let mut stmt = tx.prepare(&sql)?;
            let mut param_idx = 1usize;

            for row in chunk {
                for field in spec.schema {
                    // The key column holds the same canonical form dedup uses.
                    let key = if field.name == spec.identifier {
                        identifier_key(&row.record, spec.identifier).map(Value::String)
                    } else {
                        None
                    };
                    let raw = key.as_ref().or_else(|| row.get(&field.name));
                    let value = coerce(field, raw).map_err(|message| {
                        WarehouseError::InvalidValue {
                            table: spec.name.to_string(),
                            message,
                        }
                    })?;
                    bind(&mut stmt, param_idx, &value)?;
                    param_idx += 1;
                }

                stmt.raw_bind_parameter(param_idx, &window)?;
                stmt.raw_bind_parameter(
                    param_idx + 1,
                    row.ingestion_timestamp
                        .naive_utc()
                        .format("%Y-%m-%d %H:%M:%S%.f")
                        .to_string(),
                )?;
                stmt.raw_bind_parameter(param_idx + 2, row.source_artifact_uri.as_deref())?;
                stmt.raw_bind_parameter(param_idx + 3, &row.source_system)?;
                stmt.raw_bind_parameter(param_idx + 4, row.to_json().to_string())?;
                param_idx += META_COLUMNS.len();
            }

            let written = stmt.raw_execute()?;
            total += u64::try_from(written).unwrap_or(0);
        }

        tx.commit()?;
        Ok(total)
    }

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn fetch_records(&self, table: &str) -> Result<Vec<EnrichedRecord>, WarehouseError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT _raw, _source_artifact_uri FROM {} ORDER BY rowid",
            quote_ident(table)
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let fallback = Utc::now();
        let mut records = Vec::new();
        for row in rows {
            let (raw, uri) = row?;
            let value = serde_json::from_str(&raw)?;
            let mut record = EnrichedRecord::from_json(
                value,
                uri.as_deref().unwrap_or_default(),
                fallback,
                SOURCE_SYSTEM,
            );
            record.source_artifact_uri = uri;
            records.push(record);
        }
        Ok(records)
    }
}

/// Opens `DuckDB` datasets under a warehouse directory.
#[derive(Debug, Clone)]
pub struct DuckDbProvider {
    dir: PathBuf,
}

impl DuckDbProvider {
    /// Provider keeping dataset files under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of a tenant's dataset file.
    #[must_use]
    pub fn dataset_path(&self, tenant: &TenantConfig) -> PathBuf {
        self.dir.join(format!("{}.duckdb", tenant.dataset_name()))
    }
}

#[async_trait]
impl WarehouseProvider for DuckDbProvider {
    async fn open(
        &self,
        tenant: &TenantConfig,
    ) -> Result<Arc<dyn WarehouseBackend>, WarehouseError> {
        let path = self.dataset_path(tenant);
        log::info!("Opening dataset {}", path.display());
        Ok(Arc::new(DuckDbWarehouse::open(&path)?))
    }
}

/// Creates a directory and all parents if they don't exist.
fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

fn create_table_sql(spec: &TableSpec<'_>) -> Result<String, WarehouseError> {
    if !spec.schema.iter().any(|f| f.name == spec.identifier) {
        return Err(WarehouseError::UnknownIdentifier {
            table: spec.name.to_string(),
            identifier: spec.identifier.to_string(),
        });
    }

    let mut columns: Vec<String> = spec
        .schema
        .iter()
        .map(|field| {
            let mut column = format!("{} {}", quote_ident(&field.name), column_type(field));
            if field.name == spec.identifier {
                column.push_str(" NOT NULL PRIMARY KEY");
            }
            column
        })
        .collect();
    columns.extend(
        META_COLUMNS
            .iter()
            .map(|(name, ty, _)| format!("{name} {ty}")),
    );

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        quote_ident(spec.name),
        columns.join(",\n    ")
    ))
}

fn upsert_sql(spec: &TableSpec<'_>, rows: usize) -> String {
    let names: Vec<String> = spec
        .schema
        .iter()
        .map(|f| quote_ident(&f.name))
        .chain(META_COLUMNS.iter().map(|(name, _, _)| (*name).to_string()))
        .collect();
    let placeholders: Vec<String> = spec
        .schema
        .iter()
        .map(placeholder)
        .chain(META_COLUMNS.iter().map(|(_, _, p)| (*p).to_string()))
        .collect();
    let row = format!("({})", placeholders.join(", "));
    let updates: Vec<String> = names
        .iter()
        .filter(|name| **name != quote_ident(spec.identifier))
        .map(|name| format!("{name} = EXCLUDED.{name}"))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {}",
        quote_ident(spec.name),
        names.join(", "),
        vec![row; rows].join(", "),
        quote_ident(spec.identifier),
        updates.join(", ")
    )
}

fn bind(stmt: &mut duckdb::Statement<'_>, idx: usize, value: &SqlValue) -> duckdb::Result<()> {
    match value {
        SqlValue::Null => stmt.raw_bind_parameter(idx, Option::<&str>::None),
        SqlValue::Text(s) => stmt.raw_bind_parameter(idx, s),
        SqlValue::Integer(n) => stmt.raw_bind_parameter(idx, *n),
        SqlValue::Float(n) => stmt.raw_bind_parameter(idx, *n),
        SqlValue::Bool(b) => stmt.raw_bind_parameter(idx, *b),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use serde_json::{Value, json};
    use vmhub_pipeline_models::SchemaField;

    use super::*;

    fn vendas_schema() -> Vec<SchemaField> {
        serde_json::from_value(json!([
            {"name": "idVenda", "type": "INTEGER", "mode": "REQUIRED"},
            {"name": "data", "type": "TIMESTAMP", "mode": "REQUIRED"},
            {"name": "valorTotal", "type": "NUMERIC"},
            {"name": "pago", "type": "BOOLEAN"},
            {"name": "dia", "type": "DATE"},
            {"name": "itens", "type": "RECORD", "mode": "REPEATED", "fields": [
                {"name": "servico", "type": "STRING"}
            ]}
        ]))
        .unwrap()
    }

    fn record(id: i64, total: &str) -> EnrichedRecord {
        EnrichedRecord::new(
            json!({
                "idVenda": id,
                "data": "2024-01-15T10:00:00",
                "valorTotal": total,
                "pago": true,
                "dia": "2024-01-15",
                "itens": [{"servico": "Lavagem"}]
            }),
            Utc::now(),
            "vmhub",
        )
        .with_artifact_uri("memory://tenant/1/vendas/2024-01-15/page_0")
    }

    fn day() -> FetchWindow {
        FetchWindow::Day(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
    }

    #[tokio::test]
    async fn provisions_and_upserts_by_identifier() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let schema = vendas_schema();
        let spec = TableSpec {
            name: "vendas",
            schema: &schema,
            identifier: "idVenda",
        };

        assert!(!warehouse.table_exists("vendas").await.unwrap());
        warehouse.create_table(&spec).await.unwrap();
        assert!(warehouse.table_exists("vendas").await.unwrap());

        let written = warehouse
            .upsert(&spec, &day(), &[record(1, "10.00"), record(2, "20.00")])
            .await
            .unwrap();
        assert_eq!(written, 2);

        warehouse
            .upsert(&spec, &day(), &[record(2, "25.50")])
            .await
            .unwrap();
        assert_eq!(warehouse.row_count("vendas").await.unwrap(), 2);

        let stored = warehouse.fetch_records("vendas").await.unwrap();
        let total_of = |id: i64| {
            stored
                .iter()
                .find(|r| r.get("idVenda") == Some(&json!(id)))
                .and_then(|r| r.get("valorTotal"))
                .and_then(Value::as_str)
        };
        assert_eq!(total_of(1), Some("10.00"));
        assert_eq!(total_of(2), Some("25.50"));
        assert_eq!(stored[0].source_system, "vmhub");
        assert_eq!(
            stored[0].source_artifact_uri.as_deref(),
            Some("memory://tenant/1/vendas/2024-01-15/page_0")
        );
    }

    #[tokio::test]
    async fn failed_upsert_commits_nothing() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let schema = vendas_schema();
        let spec = TableSpec {
            name: "vendas",
            schema: &schema,
            identifier: "idVenda",
        };
        warehouse.create_table(&spec).await.unwrap();

        let result = warehouse
            .upsert(&spec, &day(), &[record(1, "10.00"), record(2, "not a number")])
            .await;
        assert!(matches!(result, Err(WarehouseError::InvalidValue { .. })));
        assert_eq!(warehouse.row_count("vendas").await.unwrap(), 0);
    }

    #[test]
    fn rejects_identifier_outside_schema() {
        let schema = vendas_schema();
        let spec = TableSpec {
            name: "vendas",
            schema: &schema,
            identifier: "cpf",
        };
        assert!(matches!(
            create_table_sql(&spec),
            Err(WarehouseError::UnknownIdentifier { .. })
        ));
    }

    #[test]
    fn upsert_updates_everything_but_the_key() {
        let schema = vendas_schema();
        let spec = TableSpec {
            name: "vendas",
            schema: &schema,
            identifier: "idVenda",
        };
        let sql = upsert_sql(&spec, 2);
        assert!(sql.contains("ON CONFLICT (\"idVenda\") DO UPDATE SET \"data\" = EXCLUDED.\"data\""));
        assert!(!sql.contains("\"idVenda\" = EXCLUDED"));
        assert!(sql.contains("_raw = EXCLUDED._raw"));
        assert_eq!(sql.matches("CAST(? AS TIMESTAMP)").count(), 4);
    }

    #[tokio::test]
    async fn provider_opens_one_file_per_tenant() {
        let dir = std::env::temp_dir().join(format!("vmhub_pipeline_wh_{}", std::process::id()));
        let provider = DuckDbProvider::new(&dir);
        let tenant = TenantConfig::new(
            "12.345.678/0001-90",
            "tok",
            vmhub_pipeline_models::TenantStatus::Active,
        );

        assert!(
            provider
                .dataset_path(&tenant)
                .ends_with("CNPJ_12345678000190_RAW.duckdb")
        );
        let warehouse = provider.open(&tenant).await.unwrap();
        assert!(!warehouse.table_exists("vendas").await.unwrap());
        drop(warehouse);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
