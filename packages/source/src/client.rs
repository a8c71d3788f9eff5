//! HTTP client for the VMHub API.
//!
//! Performs exactly one request per [`PageSource::fetch_page`] call and
//! classifies the outcome; [`crate::fetcher::PageCursor`] decides whether
//! to retry.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use vmhub_pipeline_models::FetchWindow;

use crate::{FetchError, PageRequest, PageSource};

/// Per-request transport timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum length of the response body preview included in error logs.
const BODY_PREVIEW_LEN: usize = 500;

/// How the tenant's token is presented to the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`.
    #[default]
    Bearer,
    /// `x-api-key: <token>`.
    ApiKey,
}

impl std::str::FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bearer" => Ok(Self::Bearer),
            "api-key" | "api_key" | "apikey" => Ok(Self::ApiKey),
            other => Err(format!("unknown auth scheme: {other} (expected bearer or api-key)")),
        }
    }
}

/// Client for the VMHub REST API.
pub struct VmHubClient {
    http: reqwest::Client,
    base_url: String,
    auth: AuthScheme,
}

impl VmHubClient {
    /// Creates a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, auth: AuthScheme) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent("vmhub-pipeline/1.0")
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    /// Builds the query string for a page request.
    fn query(request: &PageRequest<'_>) -> Vec<(String, String)> {
        let mut query = vec![
            ("CNPJ".to_string(), request.tenant.tax_id.clone()),
            ("pagina".to_string(), request.page_number.to_string()),
            ("quantidade".to_string(), request.endpoint.page_size.to_string()),
        ];

        if let (FetchWindow::Day(day), Some(params)) =
            (request.window, &request.endpoint.window_params)
        {
            let day = day.format("%Y-%m-%d");
            query.push((params.start.clone(), format!("{day}T00:00:00")));
            query.push((params.end.clone(), format!("{day}T23:59:59")));
        }

        query
    }
}

#[async_trait]
impl PageSource for VmHubClient {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Vec<Value>, FetchError> {
        let url = format!("{}/{}", self.base_url, request.endpoint.path);
        let mut builder = self
            .http
            .get(&url)
            .query(&Self::query(request))
            .header(reqwest::header::ACCEPT, "application/json");
        builder = match self.auth {
            AuthScheme::Bearer => builder.bearer_auth(&request.tenant.access_token),
            AuthScheme::ApiKey => builder.header("x-api-key", &request.tenant.access_token),
        };

        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(FetchError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            let preview: String = text.chars().take(BODY_PREVIEW_LEN).collect();
            log::warn!(
                "[{}] page {} body is not JSON ({e}), {} bytes received: {preview}",
                request.endpoint.name,
                request.page_number,
                text.len()
            );
            e
        })?;

        extract_records(body, request.endpoint.records_path.as_deref())
    }
}

/// Pulls the records array out of a response body.
///
/// Without `records_path` the body must be a bare array; with it, the
/// array is looked up by dot-separated path inside the body object.
///
/// # Errors
///
/// Returns [`FetchError::InvalidResponse`] if no array is found.
pub fn extract_records(body: Value, records_path: Option<&str>) -> Result<Vec<Value>, FetchError> {
    let target = match records_path {
        None => body,
        Some(path) => path
            .split('.')
            .try_fold(body, |value, key| match value {
                Value::Object(mut fields) => fields.remove(key),
                _ => None,
            })
            .ok_or_else(|| FetchError::InvalidResponse {
                message: format!("no value at records path {path:?}"),
            })?,
    };

    match target {
        Value::Array(records) => Ok(records),
        other => Err(FetchError::InvalidResponse {
            message: format!("expected a JSON array of records, got {}", type_name(&other)),
        }),
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
