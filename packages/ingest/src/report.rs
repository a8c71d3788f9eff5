//! Accumulates window outcomes into the run report.

use chrono::{DateTime, Utc};
use vmhub_pipeline_models::{LoadOutcome, RunReport, RunStatus};

use crate::PipelineError;

/// Builds a [`RunReport`] as windows complete.
#[derive(Debug)]
pub struct ReportBuilder {
    run_id: String,
    tenant_key: Option<String>,
    outcomes: Vec<LoadOutcome>,
    started_at: DateTime<Utc>,
}

impl ReportBuilder {
    /// Starts a report for `run_id`, stamped with the current time.
    #[must_use]
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            tenant_key: None,
            outcomes: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Records the resolved tenant.
    pub fn tenant(&mut self, tenant_key: &str) {
        self.tenant_key = Some(tenant_key.to_string());
    }

    /// Appends one (endpoint, window) outcome.
    pub fn push(&mut self, outcome: LoadOutcome) {
        self.outcomes.push(outcome);
    }

    /// Report for a run that processed every endpoint.
    #[must_use]
    pub fn finish(self) -> RunReport {
        let status = RunStatus::from_outcomes(&self.outcomes);
        self.build(status, None)
    }

    /// Report for a run stopped by a run-fatal error. Outcomes recorded
    /// before the error are kept.
    #[must_use]
    pub fn abort(self, error: &PipelineError) -> RunReport {
        log::error!("Run {} aborted: {error}", self.run_id);
        self.build(error.status(), Some(error.to_string()))
    }

    fn build(self, overall_status: RunStatus, fatal_error: Option<String>) -> RunReport {
        RunReport {
            run_id: self.run_id,
            tenant_key: self.tenant_key,
            per_endpoint: self.outcomes,
            started_at: self.started_at,
            finished_at: Utc::now(),
            overall_status,
            fatal_error,
        }
    }
}
