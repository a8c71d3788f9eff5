#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-tenant pipeline orchestration.
//!
//! A run resolves its tenant once, then walks every endpoint and every
//! window strictly in sequence:
//!
//! ```text
//! Resolving -> (per endpoint: Planning -> Fetching -> Archiving -> Loading) -> Reporting -> Done
//! ```
//!
//! Window-scoped failures (exhausted fetches, archive writes, warehouse
//! commits) are recorded on that window's [`LoadOutcome`] and the run moves
//! on. Only tenant resolution and credential rejection stop a run early.

pub mod report;
pub mod settings;

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use strum_macros::{AsRefStr, Display};
use vmhub_pipeline_archive::{ArchiveError, ArchiveWriter, ObjectStore};
use vmhub_pipeline_models::{
    EndpointDescriptor, EnrichedRecord, FailureKind, FetchWindow, LoadOutcome, RunReport,
    RunStatus, SOURCE_SYSTEM, TenantConfig, WindowFailure,
};
use vmhub_pipeline_source::fetcher::PageCursor;
use vmhub_pipeline_source::retry::RetryPolicy;
use vmhub_pipeline_source::tenant::{ResolveError, TenantDirectory, resolve};
use vmhub_pipeline_source::window::{InvalidWindowRange, plan};
use vmhub_pipeline_source::{FetchError, PageSource};
use vmhub_pipeline_warehouse::{Loader, WarehouseBackend, WarehouseError, WarehouseProvider};

pub use report::ReportBuilder;

/// Stage of a run, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum Phase {
    Resolving,
    Planning,
    Fetching,
    Archiving,
    Loading,
    Reporting,
    Done,
}

/// Run-fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The tenant could not be resolved.
    #[error("tenant resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// The date range is reversed.
    #[error(transparent)]
    InvalidRange(#[from] InvalidWindowRange),

    /// The tenant's dataset could not be opened.
    #[error("warehouse unavailable: {0}")]
    Warehouse(#[from] WarehouseError),

    /// The external API rejected the tenant's credentials.
    #[error("[{endpoint}/{window}] {source}")]
    Unauthorized {
        /// Endpoint being fetched when the rejection arrived.
        endpoint: String,
        /// Window being fetched when the rejection arrived.
        window: FetchWindow,
        /// The rejection.
        source: FetchError,
    },

    /// A replay named an endpoint outside the run's catalog.
    #[error("unknown endpoint: {name}")]
    UnknownEndpoint {
        /// Requested endpoint name.
        name: String,
    },
}

impl PipelineError {
    /// Run status this error terminates a run with.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        match self {
            Self::Resolve(e) if e.is_tenant_invalid() => RunStatus::AbortedTenantInvalid,
            Self::Unauthorized { .. } => RunStatus::AbortedUnauthorized,
            Self::Resolve(_)
            | Self::InvalidRange(_)
            | Self::Warehouse(_)
            | Self::UnknownEndpoint { .. } => RunStatus::Failed,
        }
    }
}

/// Knobs of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// First day fetched for partitioned endpoints.
    pub since: NaiveDate,
    /// Last day fetched for partitioned endpoints (inclusive).
    pub until: NaiveDate,
    /// Retry policy for page requests.
    pub fetch_policy: RetryPolicy,
    /// Retry policy for archive writes.
    pub archive_policy: RetryPolicy,
    /// Retry policy for warehouse commits.
    pub commit_policy: RetryPolicy,
    /// Value stamped into `_source_system`.
    pub source_system: String,
}

impl RunOptions {
    /// Options with the production retry policies.
    #[must_use]
    pub fn new(since: NaiveDate, until: NaiveDate) -> Self {
        Self {
            since,
            until,
            fetch_policy: RetryPolicy::FETCH,
            archive_policy: RetryPolicy::ARCHIVE,
            commit_policy: RetryPolicy::COMMIT,
            source_system: SOURCE_SYSTEM.to_string(),
        }
    }
}

/// One tenant pipeline wired to its collaborators.
pub struct Pipeline<'a> {
    directory: &'a dyn TenantDirectory,
    source: &'a dyn PageSource,
    store: &'a dyn ObjectStore,
    warehouses: &'a dyn WarehouseProvider,
    endpoints: Vec<EndpointDescriptor>,
    options: RunOptions,
}

impl<'a> Pipeline<'a> {
    /// Wires a pipeline to its collaborators and endpoint catalog.
    #[must_use]
    pub const fn new(
        directory: &'a dyn TenantDirectory,
        source: &'a dyn PageSource,
        store: &'a dyn ObjectStore,
        warehouses: &'a dyn WarehouseProvider,
        endpoints: Vec<EndpointDescriptor>,
        options: RunOptions,
    ) -> Self {
        Self {
            directory,
            source,
            store,
            warehouses,
            endpoints,
            options,
        }
    }

    /// Runs every endpoint for the tenant behind `run_id`.
    ///
    /// Always returns a report; run-fatal conditions are expressed by its
    /// status and `fatal_error`.
    pub async fn run(&self, run_id: &str) -> RunReport {
        let mut report = ReportBuilder::new(run_id);

        let (tenant, warehouse) = match self.prepare(run_id, &mut report).await {
            Ok(prepared) => prepared,
            Err(e) => return report.abort(&e),
        };

        for endpoint in &self.endpoints {
            if let Err(e) = self
                .run_endpoint(&tenant, endpoint, warehouse.as_ref(), &mut report)
                .await
            {
                return report.abort(&e);
            }
        }

        log_phase(&tenant.tenant_key, Phase::Reporting);
        let report = report.finish();
        log::info!(
            "[{}] {}: {} rows loaded across {} windows ({} degraded)",
            tenant.tenant_key,
            report.overall_status,
            report.total_loaded(),
            report.per_endpoint.len(),
            report.degraded().count(),
        );
        log_phase(&tenant.tenant_key, Phase::Done);
        report
    }

    /// Reloads archived pages of `endpoint` for exactly `windows`, without
    /// contacting the external API.
    pub async fn replay(&self, run_id: &str, endpoint: &str, windows: &[FetchWindow]) -> RunReport {
        let mut report = ReportBuilder::new(run_id);

        let Some(endpoint) = self.endpoints.iter().find(|e| e.name == endpoint) else {
            return report.abort(&PipelineError::UnknownEndpoint {
                name: endpoint.to_string(),
            });
        };

        let (tenant, warehouse) = match self.prepare(run_id, &mut report).await {
            Ok(prepared) => prepared,
            Err(e) => return report.abort(&e),
        };

        let writer = ArchiveWriter::new(
            self.store,
            self.options.archive_policy,
            &self.options.source_system,
        );
        let loader = Loader::new(
            warehouse.as_ref(),
            &tenant.tenant_key,
            self.options.commit_policy,
        );

        for window in windows {
            let label = format!("[{}/{}/{window}]", tenant.tenant_key, endpoint.name);
            let mut failures = Vec::new();
            let mut records = Vec::new();
            let mut pages = 0u32;

            match writer
                .list_pages(&tenant.tenant_key, &endpoint.name, window)
                .await
            {
                Ok(keys) => {
                    if keys.is_empty() {
                        log::warn!("{label} nothing archived");
                    }
                    for key in keys {
                        match writer.read_page(&key).await {
                            Ok(page) => {
                                pages += 1;
                                records.extend(page.records);
                            }
                            Err(e) => failures.push(archive_read_failure(&key, &e)),
                        }
                    }
                }
                Err(e) => failures.push(WindowFailure {
                    kind: FailureKind::ArchiveReadFailed,
                    page: None,
                    message: e.to_string(),
                }),
            }

            log::info!("{label} replaying {} records from {pages} pages", records.len());
            let outcome = loader.load(endpoint, window, records).await;
            report.push(merge_outcome(outcome, pages, failures));
        }

        report.finish()
    }

    /// Resolves the tenant and opens its dataset.
    async fn prepare(
        &self,
        run_id: &str,
        report: &mut ReportBuilder,
    ) -> Result<(TenantConfig, Arc<dyn WarehouseBackend>), PipelineError> {
        log_phase(run_id, Phase::Resolving);
        let tenant = resolve(self.directory, run_id).await?;
        report.tenant(&tenant.tenant_key);
        log::info!("Run {run_id} resolved to tenant {}", tenant.tenant_key);

        let warehouse = self.warehouses.open(&tenant).await?;
        Ok((tenant, warehouse))
    }

    async fn run_endpoint(
        &self,
        tenant: &TenantConfig,
        endpoint: &EndpointDescriptor,
        warehouse: &dyn WarehouseBackend,
        report: &mut ReportBuilder,
    ) -> Result<(), PipelineError> {
        let scope = format!("{}/{}", tenant.tenant_key, endpoint.name);
        log_phase(&scope, Phase::Planning);
        let windows = plan(endpoint, self.options.since, self.options.until)?;
        log::info!("[{scope}] {} windows planned", windows.len());

        for window in windows {
            let outcome = self.run_window(tenant, endpoint, &window, warehouse).await?;
            report.push(outcome);
        }

        Ok(())
    }

    /// Fetches, archives, and loads one window.
    ///
    /// Only a credential rejection is returned as an error; everything else
    /// lands on the outcome.
    async fn run_window(
        &self,
        tenant: &TenantConfig,
        endpoint: &EndpointDescriptor,
        window: &FetchWindow,
        warehouse: &dyn WarehouseBackend,
    ) -> Result<LoadOutcome, PipelineError> {
        let scope = format!("{}/{}/{window}", tenant.tenant_key, endpoint.name);
        let writer = ArchiveWriter::new(
            self.store,
            self.options.archive_policy,
            &self.options.source_system,
        );
        let mut cursor = PageCursor::new(
            self.source,
            tenant,
            endpoint,
            *window,
            self.options.fetch_policy,
        );

        log_phase(&scope, Phase::Fetching);
        let mut records: Vec<EnrichedRecord> = Vec::new();
        let mut failures = Vec::new();
        let mut pages = 0u32;

        while let Some(page) = cursor.next_page().await {
            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_auth() => {
                    return Err(PipelineError::Unauthorized {
                        endpoint: endpoint.name.clone(),
                        window: *window,
                        source: e,
                    });
                }
                Err(e) => {
                    let page = cursor.pages_requested().saturating_sub(1);
                    log::error!("[{scope}] page {page}: {e}");
                    failures.push(fetch_failure(page, &e));
                    break;
                }
            };
            pages += 1;

            log_phase(&scope, Phase::Archiving);
            match writer.archive(&page).await {
                Ok(archived) => records.extend(archived.records),
                Err(e) => {
                    log::error!("[{scope}] {e}");
                    failures.push(WindowFailure {
                        kind: FailureKind::ArchiveWriteFailed,
                        page: Some(page.page_number),
                        message: e.to_string(),
                    });
                    records.extend(writer.enrich(&page, Utc::now()));
                }
            }
        }

        log_phase(&scope, Phase::Loading);
        let loader = Loader::new(warehouse, &tenant.tenant_key, self.options.commit_policy);
        let outcome = loader.load(endpoint, window, records).await;
        Ok(merge_outcome(outcome, pages, failures))
    }
}

/// Puts fetch and archive failures ahead of the loader's own.
fn merge_outcome(
    mut outcome: LoadOutcome,
    pages: u32,
    mut failures: Vec<WindowFailure>,
) -> LoadOutcome {
    outcome.pages_fetched = pages;
    failures.append(&mut outcome.errors);
    outcome.errors = failures;
    outcome
}

fn fetch_failure(page: u32, error: &FetchError) -> WindowFailure {
    match error {
        FetchError::Exhausted { page, .. } => WindowFailure {
            kind: FailureKind::FetchExhausted,
            page: Some(*page),
            message: error.to_string(),
        },
        _ => WindowFailure {
            kind: FailureKind::FetchRejected,
            page: Some(page),
            message: error.to_string(),
        },
    }
}

fn archive_read_failure(key: &str, error: &ArchiveError) -> WindowFailure {
    let page = key
        .rsplit('/')
        .next()
        .and_then(|name| name.strip_prefix("page_"))
        .and_then(|n| n.parse().ok());
    WindowFailure {
        kind: FailureKind::ArchiveReadFailed,
        page,
        message: error.to_string(),
    }
}

fn log_phase(scope: &str, phase: Phase) {
    log::info!("[{scope}] {phase}");
}
