#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the VMHub tenant pipeline.
//!
//! A run resolves one [`TenantConfig`], walks every [`EndpointDescriptor`]
//! window by window, turns each fetched [`RawPage`] into
//! [`EnrichedRecord`]s, and accumulates one [`LoadOutcome`] per window
//! into the final [`RunReport`].

pub mod endpoint;
pub mod page;
pub mod report;
pub mod tenant;

pub use endpoint::{EndpointDescriptor, FieldMode, FieldType, SchemaField, WindowParams};
pub use page::{EnrichedRecord, FetchWindow, RawPage};
pub use report::{FailureKind, LoadOutcome, RunReport, RunStatus, WindowFailure};
pub use tenant::{TenantConfig, TenantStatus};

/// Label stamped on every archived and loaded record.
pub const SOURCE_SYSTEM: &str = "vmhub";

/// Key of the ingestion timestamp added to persisted records.
pub const INGESTION_TIMESTAMP_KEY: &str = "_ingestion_timestamp";

/// Key of the artifact URI added to persisted records.
pub const SOURCE_ARTIFACT_URI_KEY: &str = "_source_artifact_uri";

/// Key of the source system label added to persisted records.
pub const SOURCE_SYSTEM_KEY: &str = "_source_system";
