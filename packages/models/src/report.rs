//! Per-window load outcomes and the run report returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::page::FetchWindow;

/// Window-scoped failure categories.
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
pub enum FailureKind {
    /// A page kept failing transiently until the retry ceiling.
    FetchExhausted,
    /// A page failed with a non-retryable, non-auth error.
    FetchRejected,
    /// A page could not be written to the archive.
    ArchiveWriteFailed,
    /// The warehouse commit failed after its retry.
    LoadCommitFailed,
    /// An archived page could not be read back during replay.
    ArchiveReadFailed,
}

/// One failure inside a window, with enough scope to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// Page the failure is scoped to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Human-readable detail.
    pub message: String,
}

/// Result of processing one (endpoint, window).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    /// Endpoint name.
    pub endpoint: String,
    /// Window processed.
    pub window: FetchWindow,
    /// Pages fetched (and offered to the archive).
    pub pages_fetched: u32,
    /// Records received from the API.
    pub records_read: u64,
    /// Rows written to the warehouse.
    pub records_loaded: u64,
    /// Records that failed shape validation.
    pub records_rejected: u64,
    /// Records collapsed onto a later record with the same identifier.
    pub records_deduplicated: u64,
    /// Window-scoped failures.
    pub errors: Vec<WindowFailure>,
}

impl LoadOutcome {
    /// An empty outcome for a window about to be processed.
    #[must_use]
    pub fn new(endpoint: &str, window: FetchWindow) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            window,
            pages_fetched: 0,
            records_read: 0,
            records_loaded: 0,
            records_rejected: 0,
            records_deduplicated: 0,
            errors: Vec::new(),
        }
    }

    /// Records a window-scoped failure.
    pub fn push_failure(&mut self, kind: FailureKind, page: Option<u32>, message: String) {
        self.errors.push(WindowFailure {
            kind,
            page,
            message,
        });
    }

    /// Whether a system error degraded this window. Schema rejections do
    /// not count.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Terminal status of a run.
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
pub enum RunStatus {
    /// Every window of every endpoint loaded without system errors.
    Success,
    /// Some windows degraded; the rest loaded.
    PartialSuccess,
    /// A run-fatal condition other than tenant or auth problems.
    Failed,
    /// The external API rejected the tenant's credentials.
    AbortedUnauthorized,
    /// The tenant could not be resolved or is not eligible.
    AbortedTenantInvalid,
}

impl RunStatus {
    /// Status of a run that completed every endpoint.
    #[must_use]
    pub fn from_outcomes(outcomes: &[LoadOutcome]) -> Self {
        if outcomes.iter().any(LoadOutcome::is_degraded) {
            Self::PartialSuccess
        } else {
            Self::Success
        }
    }

    /// Process exit status for this run status.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success | Self::PartialSuccess => 0,
            Self::Failed | Self::AbortedUnauthorized | Self::AbortedTenantInvalid => 1,
        }
    }
}

/// Everything a caller learns about a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Directory run identifier the run was started with.
    pub run_id: String,
    /// Resolved tenant, if resolution succeeded.
    pub tenant_key: Option<String>,
    /// One outcome per processed (endpoint, window), in processing order.
    pub per_endpoint: Vec<LoadOutcome>,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Aggregated status.
    pub overall_status: RunStatus,
    /// Cause of a run-fatal condition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl RunReport {
    /// Sum of rows loaded across all windows.
    #[must_use]
    pub fn total_loaded(&self) -> u64 {
        self.per_endpoint.iter().map(|o| o.records_loaded).sum()
    }

    /// Outcomes that carry window-scoped failures.
    pub fn degraded(&self) -> impl Iterator<Item = &LoadOutcome> {
        self.per_endpoint.iter().filter(|o| o.is_degraded())
    }
}
