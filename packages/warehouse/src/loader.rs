//! Validate, deduplicate, provision, and commit one window of records.

use vmhub_pipeline_models::{EndpointDescriptor, EnrichedRecord, FailureKind, FetchWindow, LoadOutcome};
use vmhub_pipeline_source::retry::RetryPolicy;

use crate::validate::{dedup_last_wins, identifier_key, validate_record};
use crate::{TableSpec, WarehouseBackend, WarehouseError};

/// Maximum violations quoted per rejected record in the log.
const MAX_LOGGED_VIOLATIONS: usize = 3;

/// Loads windows of enriched records into one tenant's dataset.
pub struct Loader<'a> {
    warehouse: &'a dyn WarehouseBackend,
    tenant_key: &'a str,
    policy: RetryPolicy,
}

impl<'a> Loader<'a> {
    /// Loader for one tenant's dataset.
    #[must_use]
    pub const fn new(
        warehouse: &'a dyn WarehouseBackend,
        tenant_key: &'a str,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            warehouse,
            tenant_key,
            policy,
        }
    }

    /// Loads `records` for one (endpoint, window).
    ///
    /// Never fails: rejected records are counted, and a provisioning or
    /// commit failure that survives the retry policy is recorded on the
    /// outcome as [`FailureKind::LoadCommitFailed`].
    pub async fn load(
        &self,
        endpoint: &EndpointDescriptor,
        window: &FetchWindow,
        records: Vec<EnrichedRecord>,
    ) -> LoadOutcome {
        let label = format!("[{}/{}/{window}]", self.tenant_key, endpoint.name);
        let mut outcome = LoadOutcome::new(&endpoint.name, *window);
        outcome.records_read = records.len() as u64;

        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            let violations =
                validate_record(&endpoint.schema, &endpoint.identifier_field, &record.record);
            if violations.is_empty() {
                valid.push(record);
                continue;
            }
            outcome.records_rejected += 1;
            let id = identifier_key(&record.record, &endpoint.identifier_field)
                .unwrap_or_else(|| "<none>".to_string());
            log::warn!(
                "{label} rejected record {id}: {}{}",
                violations
                    .iter()
                    .take(MAX_LOGGED_VIOLATIONS)
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("; "),
                if violations.len() > MAX_LOGGED_VIOLATIONS {
                    format!(" (+{} more)", violations.len() - MAX_LOGGED_VIOLATIONS)
                } else {
                    String::new()
                }
            );
        }

        let (rows, collapsed) = dedup_last_wins(valid, &endpoint.identifier_field);
        outcome.records_deduplicated = collapsed;

        if rows.is_empty() {
            log::info!("{label} nothing to load ({} rejected)", outcome.records_rejected);
            return outcome;
        }

        let table = endpoint.table_name(self.tenant_key);
        let spec = TableSpec {
            name: &table,
            schema: &endpoint.schema,
            identifier: &endpoint.identifier_field,
        };

        if let Err(e) = self
            .policy
            .run(&format!("{label} provision {table}"), |_| self.ensure_table(&spec))
            .await
        {
            outcome.push_failure(
                FailureKind::LoadCommitFailed,
                None,
                format!("provisioning {table} failed: {}", e.into_inner()),
            );
            return outcome;
        }

        match self
            .policy
            .run(&format!("{label} commit"), |_| {
                self.warehouse.upsert(&spec, window, &rows)
            })
            .await
        {
            Ok(written) => {
                outcome.records_loaded = rows.len() as u64;
                log::info!(
                    "{label} loaded {} rows into {table} ({written} written, {} rejected, {} duplicates)",
                    outcome.records_loaded,
                    outcome.records_rejected,
                    outcome.records_deduplicated,
                );
            }
            Err(e) => {
                let e = e.into_inner();
                log::error!("{label} commit to {table} failed: {e}");
                outcome.push_failure(FailureKind::LoadCommitFailed, None, e.to_string());
            }
        }

        outcome
    }

    async fn ensure_table(&self, spec: &TableSpec<'_>) -> Result<(), WarehouseError> {
        if !self.warehouse.table_exists(spec.name).await? {
            self.warehouse.create_table(spec).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use serde_json::{Value, json};

    use vmhub_pipeline_source::registry::find_endpoint;

    use super::*;
    use crate::DuckDbWarehouse;

    fn clientes() -> EndpointDescriptor {
        EndpointDescriptor {
            name: "clientes".to_string(),
            path: "clientes".to_string(),
            time_partitioned: false,
            page_size: 10,
            page_delay: std::time::Duration::ZERO,
            identifier_field: "cpf".to_string(),
            table_template: "{endpoint}".to_string(),
            schema_ref: "clientes.json".to_string(),
            schema: serde_json::from_value(json!([
                {"name": "cpf", "type": "STRING", "mode": "REQUIRED"},
                {"name": "nome", "type": "STRING"},
                {"name": "dataCadastro", "type": "TIMESTAMP"}
            ]))
            .unwrap(),
            window_params: None,
            records_path: None,
        }
    }

    fn enriched(record: Value) -> EnrichedRecord {
        EnrichedRecord::new(record, Utc::now(), "vmhub")
    }

    #[tokio::test]
    async fn rejected_records_do_not_block_the_batch() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let loader = Loader::new(&warehouse, "1", RetryPolicy::immediate(2));

        let outcome = loader
            .load(
                &clientes(),
                &FetchWindow::Whole,
                vec![
                    enriched(json!({"cpf": "A", "nome": "Ana"})),
                    enriched(json!({"cpf": "B", "dataCadastro": "yesterday"})),
                    enriched(json!({"nome": "no id"})),
                    enriched(json!({"cpf": "C", "dataCadastro": "2024-01-15T10:00:00"})),
                ],
            )
            .await;

        assert_eq!(outcome.records_read, 4);
        assert_eq!(outcome.records_rejected, 2);
        assert_eq!(outcome.records_loaded, 2);
        assert!(!outcome.is_degraded());
        assert_eq!(warehouse.row_count("clientes").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn loading_twice_is_idempotent() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let loader = Loader::new(&warehouse, "1", RetryPolicy::immediate(2));
        let batch = || {
            vec![
                enriched(json!({"cpf": "A", "nome": "old"})),
                enriched(json!({"cpf": "B"})),
                enriched(json!({"cpf": "A", "nome": "new"})),
            ]
        };

        let first = loader.load(&clientes(), &FetchWindow::Whole, batch()).await;
        let second = loader.load(&clientes(), &FetchWindow::Whole, batch()).await;

        assert_eq!(first.records_deduplicated, 1);
        assert_eq!(first.records_loaded, 2);
        assert_eq!(second.records_loaded, 2);
        assert_eq!(warehouse.row_count("clientes").await.unwrap(), 2);

        let stored = warehouse.fetch_records("clientes").await.unwrap();
        let a = stored.iter().find(|r| r.get("cpf") == Some(&json!("A"))).unwrap();
        assert_eq!(a.get("nome"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn padded_identifier_updates_the_same_row() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let loader = Loader::new(&warehouse, "1", RetryPolicy::immediate(2));

        let batch = |cpf: &str, nome: &str| vec![enriched(json!({"cpf": cpf, "nome": nome}))];

        loader.load(&clientes(), &FetchWindow::Whole, batch("A", "old")).await;
        let second = loader
            .load(&clientes(), &FetchWindow::Whole, batch("A ", "new"))
            .await;

        assert_eq!(second.records_loaded, 1);
        assert_eq!(warehouse.row_count("clientes").await.unwrap(), 1);
        let stored = warehouse.fetch_records("clientes").await.unwrap();
        assert_eq!(stored[0].get("nome"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn non_finite_decimal_is_rejected_not_committed() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let loader = Loader::new(&warehouse, "1", RetryPolicy::immediate(2));
        let vendas = find_endpoint("vendas").unwrap();
        let venda = |id: i64, valor: &str| {
            enriched(json!({"idVenda": id, "data": "2024-01-15T10:00:00", "valorTotal": valor}))
        };
        let window = FetchWindow::Day(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());

        let batch = vec![venda(1, "10.00"), venda(2, "NaN"), venda(3, "7.5")];

        let outcome = loader.load(&vendas, &window, batch).await;

        assert_eq!(outcome.records_rejected, 1);
        assert_eq!(outcome.records_loaded, 2);
        assert!(!outcome.is_degraded());
        assert_eq!(warehouse.row_count("vendas").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_batches_leave_no_table() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let loader = Loader::new(&warehouse, "1", RetryPolicy::immediate(2));
        let outcome = loader.load(&clientes(), &FetchWindow::Whole, Vec::new()).await;
        assert_eq!(outcome.records_loaded, 0);
        assert!(!warehouse.table_exists("clientes").await.unwrap());
    }

    /// Accepts DDL but fails every write.
    #[derive(Default)]
    struct BrokenWarehouse {
        upserts: AtomicU32,
    }

    #[async_trait]
    impl WarehouseBackend for BrokenWarehouse {
        async fn table_exists(&self, _table: &str) -> Result<bool, WarehouseError> {
            Ok(true)
        }

        async fn create_table(&self, _spec: &TableSpec<'_>) -> Result<(), WarehouseError> {
            Ok(())
        }

        async fn upsert(
            &self,
            _spec: &TableSpec<'_>,
            _window: &FetchWindow,
            _rows: &[EnrichedRecord],
        ) -> Result<u64, WarehouseError> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Err(WarehouseError::Io(std::io::Error::other("disk full")))
        }

        async fn row_count(&self, _table: &str) -> Result<u64, WarehouseError> {
            Ok(0)
        }

        async fn fetch_records(&self, _table: &str) -> Result<Vec<EnrichedRecord>, WarehouseError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn commit_failure_is_retried_once_then_recorded() {
        let warehouse = BrokenWarehouse::default();
        let loader = Loader::new(&warehouse, "1", RetryPolicy::immediate(2));
        let window = FetchWindow::Day(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());

        let outcome = loader
            .load(&clientes(), &window, vec![enriched(json!({"cpf": "A"}))])
            .await;

        assert_eq!(warehouse.upserts.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.records_loaded, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, FailureKind::LoadCommitFailed);
    }
}
