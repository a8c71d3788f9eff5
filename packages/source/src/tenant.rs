//! Tenant resolution from the directory service.
//!
//! Each run is started with an opaque run identifier. The directory maps
//! it to the tenant's access token and tax identifier; [`resolve`] turns
//! that record into the run-scoped [`TenantConfig`] exactly once, before
//! any endpoint is touched.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use vmhub_pipeline_models::{TenantConfig, TenantStatus};

use crate::retry::{RetryPolicy, Transient};

/// Default Firestore REST API root.
const FIRESTORE_API: &str = "https://firestore.googleapis.com/v1";

/// Errors from the directory backend itself.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The directory answered with an unexpected status.
    #[error("directory returned HTTP {status}")]
    Status {
        /// Response status code.
        status: u16,
    },

    /// The directory document could not be decoded.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A tenants file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A tenants file is not valid TOML.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Transient for DirectoryError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Self::Status { status } => *status == 429 || *status >= 500,
            Self::Json(_) | Self::Io(_) | Self::Toml(_) => false,
        }
    }
}

/// Why a run identifier could not be turned into a usable tenant.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No directory record exists for the run identifier.
    #[error("no tenant record for run {run_id}")]
    TenantNotFound {
        /// Run identifier that was looked up.
        run_id: String,
    },

    /// The record lacks a token or tax identifier.
    #[error("tenant record for run {run_id} is missing: {missing}")]
    TenantConfigIncomplete {
        /// Run identifier that was looked up.
        run_id: String,
        /// Comma-separated names of the missing fields.
        missing: String,
    },

    /// The record's status marks the tenant ineligible.
    #[error("tenant for run {run_id} is not ready (status: {status})")]
    TenantNotReady {
        /// Run identifier that was looked up.
        run_id: String,
        /// Status as stored in the directory.
        status: String,
    },

    /// The directory could not be read.
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

impl ResolveError {
    /// Whether the tenant itself is at fault (as opposed to the directory
    /// being unreachable).
    #[must_use]
    pub const fn is_tenant_invalid(&self) -> bool {
        !matches!(self, Self::Directory(_))
    }
}

/// A tenant's directory record, fields as optional as the backend allows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TenantRecord {
    /// Access token for the external API.
    pub token: Option<String>,
    /// Tax identifier (CNPJ), formatted or not.
    pub cnpj: Option<String>,
    /// Provisioning status. Absent means active.
    pub status: Option<String>,
}

/// Read-only access to tenant records.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Looks up the record for a run identifier, `None` if it does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the backend cannot be read.
    async fn get_tenant_record(&self, run_id: &str) -> Result<Option<TenantRecord>, DirectoryError>;
}

/// Resolves a run identifier into the run's tenant configuration.
///
/// # Errors
///
/// Returns [`ResolveError::TenantNotFound`] if the record does not exist,
/// [`ResolveError::TenantConfigIncomplete`] if the token or tax identifier
/// is blank, [`ResolveError::TenantNotReady`] if the status is not
/// eligible, and [`ResolveError::Directory`] if the lookup itself fails.
pub async fn resolve(
    directory: &dyn TenantDirectory,
    run_id: &str,
) -> Result<TenantConfig, ResolveError> {
    let record = directory
        .get_tenant_record(run_id)
        .await?
        .ok_or_else(|| ResolveError::TenantNotFound {
            run_id: run_id.to_string(),
        })?;

    let token = record.token.as_deref().map(str::trim).unwrap_or_default();
    let cnpj = record.cnpj.as_deref().map(str::trim).unwrap_or_default();

    let mut missing = Vec::new();
    if token.is_empty() {
        missing.push("vmhubToken");
    }
    if vmhub_pipeline_models::tenant::normalize_tax_id(cnpj).is_empty() {
        missing.push("cnpj");
    }
    if !missing.is_empty() {
        return Err(ResolveError::TenantConfigIncomplete {
            run_id: run_id.to_string(),
            missing: missing.join(", "),
        });
    }

    let status = match record.status.as_deref().map(str::trim) {
        None | Some("") => TenantStatus::Active,
        Some(raw) => match raw.parse::<TenantStatus>() {
            Ok(status) if status.is_eligible() => status,
            _ => {
                return Err(ResolveError::TenantNotReady {
                    run_id: run_id.to_string(),
                    status: raw.to_string(),
                });
            }
        },
    };

    let config = TenantConfig::new(cnpj, token, status);
    if config.tenant_key.len() != 14 || !config.tenant_key.chars().all(|c| c.is_ascii_digit()) {
        log::warn!(
            "Tenant key {} for run {run_id} does not look like a CNPJ",
            config.tenant_key
        );
    }
    log::info!("Resolved run {run_id} to tenant {}", config.tenant_key);

    Ok(config)
}

// ── Firestore ────────────────────────────────────────────────────────────

/// Reads tenant records from `users/{run_id}/config/settings` documents
/// through the Firestore REST API.
pub struct FirestoreDirectory {
    client: reqwest::Client,
    api_root: String,
    project_id: String,
    access_token: String,
    policy: RetryPolicy,
}

impl FirestoreDirectory {
    /// Creates a directory client for a Google Cloud project.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Http`] if the HTTP client cannot be built.
    pub fn new(project_id: &str, access_token: &str) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .user_agent("vmhub-pipeline/1.0")
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_root: FIRESTORE_API.to_string(),
            project_id: project_id.to_string(),
            access_token: access_token.to_string(),
            policy: RetryPolicy::FETCH,
        })
    }

    /// Points the client at a different API root (e.g. the Firestore
    /// emulator).
    #[must_use]
    pub fn with_api_root(mut self, api_root: &str) -> Self {
        self.api_root = api_root.trim_end_matches('/').to_string();
        self
    }

    fn document_url(&self, run_id: &str) -> String {
        format!(
            "{}/projects/{}/databases/(default)/documents/users/{run_id}/config/settings",
            self.api_root, self.project_id
        )
    }

    async fn get_once(&self, url: &str) -> Result<Option<TenantRecord>, DirectoryError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DirectoryError::Status {
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        let document: serde_json::Value = serde_json::from_str(&text)?;
        Ok(Some(record_from_document(&document)))
    }
}

#[async_trait]
impl TenantDirectory for FirestoreDirectory {
    async fn get_tenant_record(&self, run_id: &str) -> Result<Option<TenantRecord>, DirectoryError> {
        let url = self.document_url(run_id);
        self.policy
            .run(&format!("directory lookup for {run_id}"), |_| self.get_once(&url))
            .await
            .map_err(crate::retry::RetryError::into_inner)
    }
}

/// Extracts a tenant record from a Firestore document's typed `fields`.
fn record_from_document(document: &serde_json::Value) -> TenantRecord {
    let field = |name: &str| {
        document
            .get("fields")
            .and_then(|fields| fields.get(name))
            .and_then(|value| value.get("stringValue"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };
    TenantRecord {
        token: field("vmhubToken"),
        cnpj: field("cnpj"),
        status: field("status"),
    }
}

// ── Static ───────────────────────────────────────────────────────────────

/// Tenants file layout: `[tenants.<run_id>]` tables.
#[derive(Debug, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    tenants: BTreeMap<String, TenantRecord>,
}

/// In-process directory, for local runs and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    records: BTreeMap<String, TenantRecord>,
}

impl StaticDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a record.
    #[must_use]
    pub fn with_record(mut self, run_id: &str, record: TenantRecord) -> Self {
        self.records.insert(run_id.to_string(), record);
        self
    }

    /// Parses a tenants TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Toml`] if the document is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self, DirectoryError> {
        let file: TenantsFile = toml::from_str(toml_str)?;
        Ok(Self {
            records: file.tenants,
        })
    }

    /// Reads a tenants TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn get_tenant_record(&self, run_id: &str) -> Result<Option<TenantRecord>, DirectoryError> {
        Ok(self.records.get(run_id).cloned())
    }
}
