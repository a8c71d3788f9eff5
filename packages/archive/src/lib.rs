#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Raw archive of fetched pages.
//!
//! Every page is written exactly as received, one NDJSON object per record
//! with `_ingestion_timestamp` and `_source_system` merged in, at the
//! deterministic address `tenant/{tenantKey}/{endpoint}/{window}/page_{n}`.
//! Re-archiving a page overwrites the same object, so reruns never
//! duplicate artifacts.

pub mod s3;
pub mod store;

use chrono::{DateTime, Utc};
use vmhub_pipeline_models::page::window_prefix;
use vmhub_pipeline_models::{EnrichedRecord, FetchWindow, RawPage};
use vmhub_pipeline_source::retry::{RetryError, RetryPolicy};

pub use s3::S3Store;
pub use store::{LocalStore, MemoryStore, ObjectStore, StoreError};

/// Content type of archived pages.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Errors that can occur while archiving or reading back pages.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Writing a page kept failing until the retry ceiling, or failed
    /// permanently.
    #[error("Failed to archive {key} after {attempts} attempts: {source}")]
    WriteFailed {
        /// Artifact address.
        key: String,
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        source: StoreError,
    },

    /// Store failure while reading or listing.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The requested artifact does not exist.
    #[error("No archived page at {key}")]
    NotFound {
        /// Artifact address.
        key: String,
    },

    /// A line of an artifact is not valid JSON.
    #[error("Corrupt artifact {key} at line {line}: {source}")]
    Corrupt {
        /// Artifact address.
        key: String,
        /// One-based line number.
        line: usize,
        /// Parse error.
        source: serde_json::Error,
    },

    /// Serializing a record failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A page that now exists in the archive.
#[derive(Debug, Clone)]
pub struct ArchivedPage {
    /// Artifact address (object key).
    pub address: String,
    /// Full URI of the artifact.
    pub uri: String,
    /// Page records, each pointing back at the artifact.
    pub records: Vec<EnrichedRecord>,
}

/// Writes pages to an [`ObjectStore`] and reads them back for replay.
pub struct ArchiveWriter<'a> {
    store: &'a dyn ObjectStore,
    policy: RetryPolicy,
    source_system: String,
}

impl<'a> ArchiveWriter<'a> {
    /// Writer stamping records with `source_system`.
    #[must_use]
    pub fn new(store: &'a dyn ObjectStore, policy: RetryPolicy, source_system: &str) -> Self {
        Self {
            store,
            policy,
            source_system: source_system.to_string(),
        }
    }

    /// Stamps every record of `page` with ingestion metadata.
    ///
    /// The returned records carry no artifact URI; [`Self::archive`] sets
    /// it once the page is stored.
    #[must_use]
    pub fn enrich(&self, page: &RawPage, ingested_at: DateTime<Utc>) -> Vec<EnrichedRecord> {
        page.records
            .iter()
            .map(|record| EnrichedRecord::new(record.clone(), ingested_at, &self.source_system))
            .collect()
    }

    /// Archives `page` at its deterministic address.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::WriteFailed`] if the store rejects the write
    /// permanently or keeps failing past the retry ceiling, and
    /// [`ArchiveError::Json`] if a record cannot be serialized.
    pub async fn archive(&self, page: &RawPage) -> Result<ArchivedPage, ArchiveError> {
        let records = self.enrich(page, Utc::now());
        let body = encode_ndjson(&records)?;
        let key = page.address();
        let store = self.store;

        let uri = self
            .policy
            .run(&format!("archive {key}"), |_attempt| {
                store.put(&key, body.clone(), NDJSON_CONTENT_TYPE)
            })
            .await
            .map_err(|e| {
                let (attempts, source) = match e {
                    RetryError::Exhausted { attempts, last } => (attempts, last),
                    RetryError::Permanent(e) => (1, e),
                };
                ArchiveError::WriteFailed {
                    key: key.clone(),
                    attempts,
                    source,
                }
            })?;

        log::debug!("archived {} records at {uri}", records.len());

        Ok(ArchivedPage {
            records: records
                .into_iter()
                .map(|record| record.with_artifact_uri(&uri))
                .collect(),
            address: key,
            uri,
        })
    }

    /// Lists the archived pages of one window in page-number order.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Store`] if the listing fails.
    pub async fn list_pages(
        &self,
        tenant_key: &str,
        endpoint: &str,
        window: &FetchWindow,
    ) -> Result<Vec<String>, ArchiveError> {
        let prefix = window_prefix(tenant_key, endpoint, window);
        let mut pages: Vec<(u32, String)> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                let number = key
                    .strip_prefix(&prefix)?
                    .strip_prefix("page_")?
                    .parse()
                    .ok()?;
                Some((number, key))
            })
            .collect();
        pages.sort_unstable_by_key(|(number, _)| *number);
        Ok(pages.into_iter().map(|(_, key)| key).collect())
    }

    /// Reads an archived page back into enriched records.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotFound`] if no artifact exists at `key` and
    /// [`ArchiveError::Corrupt`] if a line fails to parse.
    pub async fn read_page(&self, key: &str) -> Result<ArchivedPage, ArchiveError> {
        let body = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| ArchiveError::NotFound {
                key: key.to_string(),
            })?;
        let uri = self.store.uri(key);
        let records = decode_ndjson(key, &body, &uri, &self.source_system)?;

        Ok(ArchivedPage {
            address: key.to_string(),
            uri,
            records,
        })
    }
}

/// Serializes records as newline-delimited JSON.
///
/// # Errors
///
/// Returns [`serde_json::Error`] if a record fails to serialize.
pub fn encode_ndjson(records: &[EnrichedRecord]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    for record in records {
        serde_json::to_writer(&mut body, &record.to_json())?;
        body.push(b'\n');
    }
    Ok(body)
}

fn decode_ndjson(
    key: &str,
    body: &[u8],
    uri: &str,
    source_system: &str,
) -> Result<Vec<EnrichedRecord>, ArchiveError> {
    let fallback = Utc::now();
    body.split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .map(|(index, line)| {
            let value = serde_json::from_slice(line).map_err(|source| ArchiveError::Corrupt {
                key: key.to_string(),
                line: index + 1,
                source,
            })?;
            Ok(EnrichedRecord::from_json(value, uri, fallback, source_system))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn page(number: u32, records: Vec<serde_json::Value>) -> RawPage {
        RawPage {
            tenant_key: "12345678000190".to_string(),
            endpoint: "vendas".to_string(),
            window: FetchWindow::Day(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
            page_number: number,
            records,
            fetched_at: Utc::now(),
        }
    }

    /// Fails the first `failures` writes with a transient error.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            content_type: &str,
        ) -> Result<String, StoreError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Put {
                    location: key.to_string(),
                    source: "503 slow down".into(),
                });
            }
            self.inner.put(key, body, content_type).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }

        fn uri(&self, key: &str) -> String {
            self.inner.uri(key)
        }
    }

    #[tokio::test]
    async fn archives_enriched_ndjson_at_page_address() {
        let store = MemoryStore::new();
        let writer = ArchiveWriter::new(&store, RetryPolicy::immediate(1), "vmhub");

        let archived = writer
            .archive(&page(0, vec![json!({"idVenda": 1}), json!({"idVenda": 2})]))
            .await
            .unwrap();

        assert_eq!(archived.address, "tenant/12345678000190/vendas/2024-01-15/page_0");
        assert_eq!(archived.uri, "memory://tenant/12345678000190/vendas/2024-01-15/page_0");
        assert!(
            archived
                .records
                .iter()
                .all(|r| r.source_artifact_uri.as_deref() == Some(archived.uri.as_str()))
        );

        let body = store.get(&archived.address).await.unwrap().unwrap();
        let lines: Vec<serde_json::Value> = body
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["idVenda"], 2);
        assert_eq!(lines[1]["_source_system"], "vmhub");
        assert!(lines[1]["_ingestion_timestamp"].is_string());
    }

    #[tokio::test]
    async fn archiving_twice_keeps_one_object() {
        let store = MemoryStore::new();
        let writer = ArchiveWriter::new(&store, RetryPolicy::immediate(1), "vmhub");
        let page = page(0, vec![json!({"idVenda": 1})]);

        writer.archive(&page).await.unwrap();
        writer.archive(&page).await.unwrap();

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn retries_transient_write_failures() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        };
        let writer = ArchiveWriter::new(&store, RetryPolicy::immediate(4), "vmhub");

        assert!(writer.archive(&page(0, vec![json!({"idVenda": 1})])).await.is_ok());
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn reports_exhausted_writes() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(10),
        };
        let writer = ArchiveWriter::new(&store, RetryPolicy::immediate(3), "vmhub");

        let err = writer
            .archive(&page(0, vec![json!({"idVenda": 1})]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::WriteFailed { attempts: 3, .. }));
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn lists_and_reads_pages_in_numeric_order() {
        let store = MemoryStore::new();
        let writer = ArchiveWriter::new(&store, RetryPolicy::immediate(1), "vmhub");
        for number in [10, 2, 0] {
            writer
                .archive(&page(number, vec![json!({"idVenda": number})]))
                .await
                .unwrap();
        }

        let window = FetchWindow::Day(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let keys = writer
            .list_pages("12345678000190", "vendas", &window)
            .await
            .unwrap();
        let numbers: Vec<&str> = keys.iter().filter_map(|k| k.rsplit('/').next()).collect();
        assert_eq!(numbers, vec!["page_0", "page_2", "page_10"]);

        let page = writer.read_page(&keys[2]).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].record, json!({"idVenda": 10}));
        assert_eq!(page.records[0].source_system, "vmhub");
        assert_eq!(page.records[0].source_artifact_uri.as_deref(), Some(page.uri.as_str()));
    }

    #[tokio::test]
    async fn reading_missing_or_corrupt_pages_fails() {
        let store = MemoryStore::new();
        store
            .put("tenant/1/vendas/all/page_0", b"{\"a\":1}\nnot json\n".to_vec(), NDJSON_CONTENT_TYPE)
            .await
            .unwrap();
        let writer = ArchiveWriter::new(&store, RetryPolicy::immediate(1), "vmhub");

        assert!(matches!(
            writer.read_page("tenant/1/vendas/all/page_0").await,
            Err(ArchiveError::Corrupt { line: 2, .. })
        ));
        assert!(matches!(
            writer.read_page("tenant/1/vendas/all/page_1").await,
            Err(ArchiveError::NotFound { .. })
        ));
    }
}
