#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Warehouse side of a run: shape validation, deduplication, table
//! provisioning, and idempotent upserts.
//!
//! Each tenant owns one dataset (`CNPJ_{tenantKey}_RAW`) holding one table
//! per endpoint. Loads are keyed by the endpoint's natural identifier, so
//! loading the same window twice leaves the same rows behind.

pub mod loader;
pub mod schema;
pub mod tenant_db;
pub mod validate;

use std::sync::Arc;

use async_trait::async_trait;
use vmhub_pipeline_models::{EnrichedRecord, FetchWindow, SchemaField, TenantConfig};
use vmhub_pipeline_source::retry::Transient;

pub use loader::Loader;
pub use tenant_db::{DuckDbProvider, DuckDbWarehouse};
pub use validate::{dedup_last_wins, validate_record};

/// Errors that can occur during warehouse operations.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error preparing the warehouse directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error reading back stored records.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value could not be converted to its column type.
    #[error("Invalid value for {table}: {message}")]
    InvalidValue {
        /// Target table.
        table: String,
        /// Description of the offending value.
        message: String,
    },

    /// The identifier column is not part of the schema.
    #[error("Identifier column {identifier} is not in the schema of {table}")]
    UnknownIdentifier {
        /// Target table.
        table: String,
        /// Identifier column.
        identifier: String,
    },

    /// The connection mutex was poisoned by a panicking holder.
    #[error("Warehouse connection lock poisoned")]
    Poisoned,
}

impl Transient for WarehouseError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::DuckDb(_) | Self::Io(_))
    }
}

/// Name, columns, and key of one endpoint table.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec<'a> {
    /// Table name.
    pub name: &'a str,
    /// Payload columns.
    pub schema: &'a [SchemaField],
    /// Primary key column.
    pub identifier: &'a str,
}

/// One tenant's dataset.
#[async_trait]
pub trait WarehouseBackend: Send + Sync {
    /// Whether `table` exists.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the catalog query fails.
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError>;

    /// Creates the table for `spec` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the DDL fails.
    async fn create_table(&self, spec: &TableSpec<'_>) -> Result<(), WarehouseError>;

    /// Inserts or replaces `rows` by identifier in a single transaction.
    ///
    /// `rows` must already be unique by identifier. Returns the number of
    /// rows written.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if any write fails; nothing is committed
    /// in that case.
    async fn upsert(
        &self,
        spec: &TableSpec<'_>,
        window: &FetchWindow,
        rows: &[EnrichedRecord],
    ) -> Result<u64, WarehouseError>;

    /// Number of rows in `table`.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the query fails.
    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError>;

    /// Every stored record of `table`, with its enrichment metadata.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the query fails or a stored record is
    /// not valid JSON.
    async fn fetch_records(&self, table: &str) -> Result<Vec<EnrichedRecord>, WarehouseError>;
}

/// Opens tenant datasets.
#[async_trait]
pub trait WarehouseProvider: Send + Sync {
    /// Opens (creating if needed) the dataset of `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the dataset cannot be opened.
    async fn open(&self, tenant: &TenantConfig) -> Result<Arc<dyn WarehouseBackend>, WarehouseError>;
}
