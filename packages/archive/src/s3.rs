//! S3-compatible object storage.
//!
//! Works against AWS S3, Cloudflare R2, and Google Cloud Storage through its
//! S3 interoperability endpoint (HMAC keys).
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `ARCHIVE_BUCKET` | Yes | Bucket holding the archive |
//! | `ARCHIVE_ACCESS_KEY_ID` | Yes | S3-compatible access key |
//! | `ARCHIVE_SECRET_ACCESS_KEY` | Yes | S3-compatible secret key |
//! | `ARCHIVE_ENDPOINT_URL` | No | Custom endpoint (R2, GCS interop, `MinIO`) |
//! | `ARCHIVE_REGION` | No | Region, defaults to `auto` |

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};

use crate::store::{ObjectStore, StoreError};

/// Host of the Google Cloud Storage S3 interoperability API.
const GCS_INTEROP_HOST: &str = "storage.googleapis.com";

/// Object store backed by an S3-compatible bucket.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    scheme: &'static str,
}

impl S3Store {
    /// Creates a store from `ARCHIVE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingEnv`] if any required variable is unset.
    pub fn from_env() -> Result<Self, StoreError> {
        let bucket = require_env("ARCHIVE_BUCKET")?;
        let access_key = require_env("ARCHIVE_ACCESS_KEY_ID")?;
        let secret_key = require_env("ARCHIVE_SECRET_ACCESS_KEY")?;
        let endpoint = std::env::var("ARCHIVE_ENDPOINT_URL").ok();
        let region = std::env::var("ARCHIVE_REGION").unwrap_or_else(|_| "auto".to_string());

        Ok(Self::new(
            &bucket,
            &access_key,
            &secret_key,
            endpoint.as_deref(),
            &region,
        ))
    }

    /// Creates a store for `bucket` with static credentials.
    #[must_use]
    pub fn new(
        bucket: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<&str>,
        region: &str,
    ) -> Self {
        let creds = Credentials::new(access_key, secret_key, None, None, "archive-env");

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(region.to_string()))
            .credentials_provider(creds)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled());
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let scheme = if endpoint.is_some_and(|e| e.contains(GCS_INTEROP_HOST)) {
            "gs"
        } else {
            "s3"
        };

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            scheme,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let uri = self.uri(key);
        log::debug!("Pushing {uri} ({} bytes)", body.len());

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StoreError::Put {
                location: uri.clone(),
                source: Box::new(e),
            })?;

        Ok(uri)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key)
                {
                    return Ok(None);
                }
                return Err(StoreError::Get {
                    location: self.uri(key),
                    source: Box::new(err),
                });
            }
        };

        let bytes = output.body.collect().await.map_err(|e| StoreError::Get {
            location: self.uri(key),
            source: Box::new(e),
        })?;

        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(|e| StoreError::List {
                location: self.uri(prefix),
                source: Box::new(e),
            })?;

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn uri(&self, key: &str) -> String {
        format!("{}://{}/{key}", self.scheme, self.bucket)
    }
}

/// Reads a required environment variable.
fn require_env(name: &str) -> Result<String, StoreError> {
    std::env::var(name).map_err(|_| StoreError::MissingEnv {
        name: name.to_string(),
    })
}
