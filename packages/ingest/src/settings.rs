//! Runtime configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `VMHUB_BASE_URL` | Yes | Base URL of the VMHub API |
//! | `VMHUB_AUTH_SCHEME` | No | `bearer` (default) or `api-key` |
//! | `VMHUB_ENDPOINTS` | No | Comma-separated endpoint filter |
//! | `TENANTS_FILE` | No | TOML tenant directory; replaces Firestore |
//! | `FIRESTORE_PROJECT_ID` | Without `TENANTS_FILE` | Project holding tenant records |
//! | `FIRESTORE_ACCESS_TOKEN` | Without `TENANTS_FILE` | OAuth token for the Firestore REST API |
//! | `ARCHIVE_LOCAL_DIR` | No | Archive to a local directory instead of a bucket |
//! | `ARCHIVE_BUCKET` and `ARCHIVE_*` | Without `ARCHIVE_LOCAL_DIR` | See [`vmhub_pipeline_archive::s3`] |
//! | `WAREHOUSE_DIR` | No | Directory of tenant `DuckDB` files, defaults to `data/warehouse` |

use std::path::PathBuf;

use vmhub_pipeline_archive::{LocalStore, ObjectStore, S3Store};
use vmhub_pipeline_source::client::AuthScheme;
use vmhub_pipeline_source::tenant::{FirestoreDirectory, StaticDirectory, TenantDirectory};

/// Default directory for tenant datasets.
const DEFAULT_WAREHOUSE_DIR: &str = "data/warehouse";

/// Errors that can occur while reading settings or building backends.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// An environment variable holds an unusable value.
    #[error("Invalid value for {name}: {message}")]
    InvalidValue {
        /// Name of the environment variable.
        name: String,
        /// Description of what went wrong.
        message: String,
    },

    /// The tenant directory backend could not be built.
    #[error(transparent)]
    Directory(#[from] vmhub_pipeline_source::tenant::DirectoryError),

    /// The archive backend could not be built.
    #[error(transparent)]
    Store(#[from] vmhub_pipeline_archive::StoreError),
}

/// Where tenant records come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectorySettings {
    /// Firestore REST API.
    Firestore {
        /// Project identifier.
        project_id: String,
        /// OAuth access token.
        access_token: String,
    },
    /// TOML file read once at startup.
    File(PathBuf),
}

/// Where raw pages are archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSettings {
    /// S3-compatible bucket configured by `ARCHIVE_*` variables.
    Bucket,
    /// Local directory tree.
    Local(PathBuf),
}

/// Everything a run needs besides its run identifier and date range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Base URL of the external API.
    pub base_url: String,
    /// How the tenant token is presented.
    pub auth_scheme: AuthScheme,
    /// Tenant directory backend.
    pub directory: DirectorySettings,
    /// Archive backend.
    pub archive: ArchiveSettings,
    /// Directory of tenant datasets.
    pub warehouse_dir: PathBuf,
}

impl Settings {
    /// Reads settings from the environment. `base_url` overrides
    /// `VMHUB_BASE_URL` when given.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::MissingEnv`] if a required variable is
    /// unset and [`SettingsError::InvalidValue`] if one cannot be parsed.
    pub fn from_env(base_url: Option<String>) -> Result<Self, SettingsError> {
        let base_url = match base_url {
            Some(url) => url,
            None => require_env("VMHUB_BASE_URL")?,
        };

        let auth_scheme = match optional_env("VMHUB_AUTH_SCHEME") {
            Some(value) => value
                .parse::<AuthScheme>()
                .map_err(|message| SettingsError::InvalidValue {
                    name: "VMHUB_AUTH_SCHEME".to_string(),
                    message,
                })?,
            None => AuthScheme::default(),
        };

        let directory = match optional_env("TENANTS_FILE") {
            Some(path) => DirectorySettings::File(PathBuf::from(path)),
            None => DirectorySettings::Firestore {
                project_id: require_env("FIRESTORE_PROJECT_ID")?,
                access_token: require_env("FIRESTORE_ACCESS_TOKEN")?,
            },
        };

        let archive = optional_env("ARCHIVE_LOCAL_DIR")
            .map_or(ArchiveSettings::Bucket, |dir| {
                ArchiveSettings::Local(PathBuf::from(dir))
            });

        let warehouse_dir = PathBuf::from(
            optional_env("WAREHOUSE_DIR").unwrap_or_else(|| DEFAULT_WAREHOUSE_DIR.to_string()),
        );

        Ok(Self {
            base_url,
            auth_scheme,
            directory,
            archive,
            warehouse_dir,
        })
    }

    /// Builds the configured tenant directory.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Directory`] if the file cannot be read or
    /// the HTTP client cannot be built.
    pub fn tenant_directory(&self) -> Result<Box<dyn TenantDirectory>, SettingsError> {
        Ok(match &self.directory {
            DirectorySettings::Firestore {
                project_id,
                access_token,
            } => Box::new(FirestoreDirectory::new(project_id, access_token)?),
            DirectorySettings::File(path) => Box::new(StaticDirectory::from_file(path)?),
        })
    }

    /// Builds the configured archive store.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Store`] if bucket credentials are missing.
    pub fn object_store(&self) -> Result<Box<dyn ObjectStore>, SettingsError> {
        Ok(match &self.archive {
            ArchiveSettings::Bucket => Box::new(S3Store::from_env()?),
            ArchiveSettings::Local(dir) => Box::new(LocalStore::new(dir)),
        })
    }
}

/// Parses an endpoint filter, from the CLI flag or the `VMHUB_ENDPOINTS`
/// environment variable. No filter selects every endpoint.
#[must_use]
pub fn endpoint_filter(cli_filter: Option<String>) -> Vec<String> {
    cli_filter
        .or_else(|| optional_env("VMHUB_ENDPOINTS"))
        .map(|filter| {
            filter
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Reads a required environment variable.
fn require_env(name: &str) -> Result<String, SettingsError> {
    optional_env(name).ok_or_else(|| SettingsError::MissingEnv {
        name: name.to_string(),
    })
}

/// Reads an environment variable, treating blank values as unset.
fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
