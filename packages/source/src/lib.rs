#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Everything on the upstream side of a run: resolving the tenant,
//! the endpoint catalog, planning day windows, and paging through the
//! VMHub API.
//!
//! The external API is reached through the [`PageSource`] trait so the
//! page cursor, and everything downstream of it, can run against a
//! scripted source in tests.

pub mod client;
pub mod fetcher;
pub mod registry;
pub mod retry;
pub mod tenant;
pub mod window;

use async_trait::async_trait;
use vmhub_pipeline_models::{EndpointDescriptor, FetchWindow, TenantConfig};

use crate::retry::Transient;

/// Errors that can occur while fetching a page.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The API refused the tenant's credentials (HTTP 401/403).
    #[error("authentication rejected (HTTP {status})")]
    AuthRejected {
        /// Response status code.
        status: u16,
    },

    /// HTTP transport failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status other than 401/403.
    #[error("HTTP {status}")]
    Status {
        /// Response status code.
        status: u16,
    },

    /// The body was not valid JSON (truncated or garbled).
    #[error("JSON parse error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The body was JSON but not the expected shape.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Description of what went wrong.
        message: String,
    },

    /// A page kept failing transiently until the retry ceiling.
    #[error("page {page} failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Page number that failed.
        page: u32,
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether this error invalidates the tenant's credentials for every
    /// endpoint.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
            }
            Self::Status { status } => *status == 429 || *status >= 500,
            Self::Decode(_) => true,
            Self::AuthRejected { .. } | Self::InvalidResponse { .. } | Self::Exhausted { .. } => {
                false
            }
        }
    }
}

/// Everything needed to request one page.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    /// Tenant whose credentials and tax identifier are sent.
    pub tenant: &'a TenantConfig,
    /// Endpoint being paged.
    pub endpoint: &'a EndpointDescriptor,
    /// Window being paged.
    pub window: &'a FetchWindow,
    /// Zero-based page number.
    pub page_number: u32,
}

/// A single-attempt page fetch against the external API.
///
/// Retries, pacing, and end-of-stream detection live in
/// [`fetcher::PageCursor`]; implementations only perform one request.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches one page of raw records.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the request fails or the response cannot
    /// be interpreted.
    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
    ) -> Result<Vec<serde_json::Value>, FetchError>;
}
