//! Lazy page sequence for one (tenant, endpoint, window).

use chrono::Utc;
use vmhub_pipeline_models::{EndpointDescriptor, FetchWindow, RawPage, TenantConfig};

use crate::retry::{RetryError, RetryPolicy};
use crate::{FetchError, PageRequest, PageSource};

/// Walks the pages of one window, starting at page 0.
///
/// The stream ends at the first page shorter than the endpoint's page
/// size. Empty pages are never yielded. An error is terminal: after
/// [`PageCursor::next_page`] returns `Some(Err(_))` every further call
/// returns `None`.
pub struct PageCursor<'a> {
    source: &'a dyn PageSource,
    tenant: &'a TenantConfig,
    endpoint: &'a EndpointDescriptor,
    window: FetchWindow,
    policy: RetryPolicy,
    next_page: u32,
    finished: bool,
}

impl<'a> PageCursor<'a> {
    /// Cursor positioned before page 0 of `window`.
    #[must_use]
    pub const fn new(
        source: &'a dyn PageSource,
        tenant: &'a TenantConfig,
        endpoint: &'a EndpointDescriptor,
        window: FetchWindow,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            tenant,
            endpoint,
            window,
            policy,
            next_page: 0,
            finished: false,
        }
    }

    /// Number of pages requested so far.
    #[must_use]
    pub const fn pages_requested(&self) -> u32 {
        self.next_page
    }

    /// Fetches the next page.
    ///
    /// Returns `None` once the stream is exhausted or after an error.
    pub async fn next_page(&mut self) -> Option<Result<RawPage, FetchError>> {
        if self.finished {
            return None;
        }

        let page_number = self.next_page;
        if page_number > 0 && !self.endpoint.page_delay.is_zero() {
            tokio::time::sleep(self.endpoint.page_delay).await;
        }
        self.next_page += 1;

        let request = PageRequest {
            tenant: self.tenant,
            endpoint: self.endpoint,
            window: &self.window,
            page_number,
        };
        let label = format!(
            "[{}/{}/{}] page {page_number}",
            self.tenant.tenant_key, self.endpoint.name, self.window
        );
        let source = self.source;
        let request = &request;

        let records = match self
            .policy
            .run(&label, |_attempt| source.fetch_page(request))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                self.finished = true;
                return Some(Err(match e {
                    RetryError::Permanent(e) => e,
                    RetryError::Exhausted { attempts, last } => FetchError::Exhausted {
                        page: page_number,
                        attempts,
                        last: Box::new(last),
                    },
                }));
            }
        };

        let page_size = usize::try_from(self.endpoint.page_size).unwrap_or(usize::MAX);
        if records.len() < page_size {
            self.finished = true;
        }
        if records.is_empty() {
            log::debug!("{label}: empty, end of stream");
            return None;
        }

        log::info!("{label}: {} records", records.len());

        Some(Ok(RawPage {
            tenant_key: self.tenant.tenant_key.clone(),
            endpoint: self.endpoint.name.clone(),
            window: self.window,
            page_number,
            records,
            fetched_at: Utc::now(),
        }))
    }
}
