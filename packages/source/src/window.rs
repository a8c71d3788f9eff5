//! Expands a historical date range into fetch windows.

use chrono::{Days, NaiveDate};
use vmhub_pipeline_models::{EndpointDescriptor, FetchWindow};

/// The range's start is after its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid window range: {since} is after {until}")]
pub struct InvalidWindowRange {
    /// Requested start.
    pub since: NaiveDate,
    /// Requested end.
    pub until: NaiveDate,
}

/// Ordered, restartable sequence of windows for one endpoint.
///
/// Cloning a plan (or planning again with the same bounds) yields the same
/// windows; nothing here reads the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    next: Option<FetchWindow>,
    until: NaiveDate,
}

impl Iterator for WindowPlan {
    type Item = FetchWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        if let FetchWindow::Day(day) = current
            && day < self.until
        {
            self.next = day.checked_add_days(Days::new(1)).map(FetchWindow::Day);
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match self.next {
            None => 0,
            Some(FetchWindow::Whole) => 1,
            Some(FetchWindow::Day(day)) => {
                usize::try_from((self.until - day).num_days() + 1).unwrap_or(0)
            }
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WindowPlan {}

/// Plans the windows of `endpoint` for `[since, until]`.
///
/// Non-partitioned endpoints get a single [`FetchWindow::Whole`];
/// partitioned ones get one [`FetchWindow::Day`] per calendar day,
/// oldest first, so an interrupted run leaves a contiguous prefix of
/// history behind it.
///
/// # Errors
///
/// Returns [`InvalidWindowRange`] if `since` is after `until`, for any
/// endpoint.
pub fn plan(
    endpoint: &EndpointDescriptor,
    since: NaiveDate,
    until: NaiveDate,
) -> Result<WindowPlan, InvalidWindowRange> {
    if since > until {
        return Err(InvalidWindowRange { since, until });
    }

    let first = if endpoint.time_partitioned {
        FetchWindow::Day(since)
    } else {
        FetchWindow::Whole
    };

    Ok(WindowPlan {
        next: Some(first),
        until,
    })
}

/// Default range when none is configured: the `days` days ending
/// yesterday, relative to `today`.
#[must_use]
pub fn default_range(today: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
    let until = today.pred_opt().unwrap_or(today);
    let since = until
        .checked_sub_days(Days::new(u64::from(days.max(1) - 1)))
        .unwrap_or(until);
    (since, until)
}
