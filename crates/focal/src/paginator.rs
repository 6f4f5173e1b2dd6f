//! Rate-limited pagination over any paged endpoint.
//!
//! The [`Paginator`] is a stepper: callers pull one page at a time with
//! [`Paginator::next_page`], handing it a closure that issues the request for a
//! given next-page token. Rate limits suspend and retry the same page,
//! transient failures retry with exponential backoff up to a bound, and the
//! stop signal is honoured between pages.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult, CollectorError, CollectorResult};
use crate::twitter::types::{CountPage, TweetPage};
use crate::window::TimeWindow;

/// Lifecycle of a paginated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    /// More pages may follow.
    Active,
    /// Endpoint exhausted or ceiling reached.
    Complete,
    /// Stop signal observed; resumable from `next_token`.
    Cancelled,
    /// Gave up; resumable from `next_token`.
    Failed,
}

/// Position of a paginated call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Token for the next page, if any.
    pub next_token: Option<String>,
    /// Primary results consumed so far.
    pub collected: u64,
    /// Maximum primary results for the call.
    pub ceiling: Option<u64>,
    /// Part of the requested window not yet covered (results arrive newest first).
    pub window: Option<TimeWindow>,
    /// Pages fetched.
    pub pages: u32,
    pub state: CursorState,
}

impl Cursor {
    #[must_use]
    pub fn new(ceiling: Option<u64>, window: Option<TimeWindow>) -> Self {
        Self {
            next_token: None,
            collected: 0,
            ceiling,
            window,
            pages: 0,
            state: CursorState::Active,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == CursorState::Complete
    }

    fn remaining(&self) -> Option<u64> {
        self.ceiling.map(|c| c.saturating_sub(self.collected))
    }
}

/// A response the paginator can step through.
pub trait Paged {
    /// Number of primary results on the page.
    fn result_count(&self) -> usize;

    /// Token for the following page.
    fn next_token(&self) -> Option<&str>;

    /// Drop primary results beyond `keep`.
    fn truncate(&mut self, keep: usize);

    /// Creation time of the oldest primary result, when known.
    fn oldest_time(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Paged for TweetPage {
    fn result_count(&self) -> usize {
        self.data.len()
    }

    fn next_token(&self) -> Option<&str> {
        self.meta.next_token.as_deref()
    }

    fn truncate(&mut self, keep: usize) {
        self.data.truncate(keep);
    }

    fn oldest_time(&self) -> Option<DateTime<Utc>> {
        self.data.iter().filter_map(|t| t.created_at).min()
    }
}

impl Paged for CountPage {
    fn result_count(&self) -> usize {
        self.data.len()
    }

    fn next_token(&self) -> Option<&str> {
        self.meta.next_token.as_deref()
    }

    fn truncate(&mut self, keep: usize) {
        self.data.truncate(keep);
    }
}

/// Retry and pacing policy.
#[derive(Debug, Clone)]
pub struct PaginatorConfig {
    /// Attempts per page before a transient failure is surfaced.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Suspension when a rate limit carries no reset hint.
    pub rate_limit_fallback: Duration,
    /// Minimum spacing between consecutive requests.
    pub min_request_interval: Duration,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            rate_limit_fallback: Duration::from_secs(15 * 60),
            min_request_interval: Duration::ZERO,
        }
    }
}

/// Drives one paginated call.
#[derive(Debug)]
pub struct Paginator {
    config: PaginatorConfig,
    cancel: CancellationToken,
    cursor: Cursor,
    last_request: Option<Instant>,
}

impl Paginator {
    #[must_use]
    pub fn new(
        config: PaginatorConfig,
        cancel: CancellationToken,
        ceiling: Option<u64>,
        window: Option<TimeWindow>,
    ) -> Self {
        Self::resume(config, cancel, Cursor::new(ceiling, window))
    }

    /// Continue a call from a cursor returned by an earlier run.
    #[must_use]
    pub fn resume(config: PaginatorConfig, cancel: CancellationToken, mut cursor: Cursor) -> Self {
        if matches!(cursor.state, CursorState::Cancelled | CursorState::Failed) {
            cursor.state = CursorState::Active;
        }
        Self {
            config,
            cancel,
            cursor,
            last_request: None,
        }
    }

    #[must_use]
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    #[must_use]
    pub fn into_cursor(self) -> Cursor {
        self.cursor
    }

    /// Fetch the next page.
    ///
    /// Returns `Ok(None)` once the call is complete or the stop signal was
    /// observed; check [`Paginator::cursor`] to tell which.
    pub async fn next_page<P, F, Fut>(&mut self, mut fetch: F) -> CollectorResult<Option<P>>
    where
        P: Paged,
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = ApiResult<P>>,
    {
        if self.cursor.state != CursorState::Active {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.cursor.state = CursorState::Cancelled;
            return Ok(None);
        }
        if self.cursor.remaining() == Some(0) {
            self.cursor.state = CursorState::Complete;
            return Ok(None);
        }

        let mut attempt = 0;
        let mut backoff = self.config.initial_backoff;

        loop {
            self.pace().await;
            self.last_request = Some(Instant::now());

            match fetch(self.cursor.next_token.clone()).await {
                Ok(page) => return Ok(Some(self.advance(page))),
                Err(ApiError::RateLimited { retry_after }) => {
                    let wait = retry_after.unwrap_or(self.config.rate_limit_fallback);
                    warn!(
                        wait_secs = wait.as_secs(),
                        pages = self.cursor.pages,
                        "Rate limited, suspending"
                    );
                    if !self.sleep_or_cancel(wait).await {
                        return Ok(None);
                    }
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        self.cursor.state = CursorState::Failed;
                        return Err(CollectorError::TransientNetworkFailure {
                            cursor: self.cursor.clone(),
                            source: e,
                        });
                    }
                    warn!(
                        attempt,
                        delay_ms = backoff.as_millis(),
                        error = %e,
                        "Retrying page after transient failure"
                    );
                    if !self.sleep_or_cancel(backoff).await {
                        return Ok(None);
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
                Err(e) => {
                    self.cursor.state = CursorState::Failed;
                    return Err(CollectorError::Fatal {
                        cursor: Some(self.cursor.clone()),
                        source: e,
                    });
                }
            }
        }
    }

    fn advance<P: Paged>(&mut self, mut page: P) -> P {
        if let Some(remaining) = self.cursor.remaining() {
            let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
            if page.result_count() > remaining {
                page.truncate(remaining);
            }
        }

        let kept = page.result_count() as u64;
        self.cursor.collected += kept;
        self.cursor.pages += 1;
        self.cursor.next_token = page.next_token().map(ToString::to_string);

        if let (Some(window), Some(oldest)) = (self.cursor.window, page.oldest_time()) {
            // Keep the oldest second: ties at the boundary may not all be collected yet.
            let end = (oldest + chrono::Duration::seconds(1)).min(window.end);
            if end > window.start {
                self.cursor.window = Some(TimeWindow { start: window.start, end });
            }
        }

        if self.cursor.next_token.is_none() || self.cursor.remaining() == Some(0) {
            self.cursor.state = CursorState::Complete;
        }

        debug!(
            page = self.cursor.pages,
            results = kept,
            collected = self.cursor.collected,
            more = self.cursor.state == CursorState::Active,
            "Fetched page"
        );
        page
    }

    async fn pace(&self) {
        if let Some(last) = self.last_request {
            let due = last + self.config.min_request_interval;
            if due > Instant::now() {
                tokio::time::sleep_until(due).await;
            }
        }
    }

    /// Sleep for `wait`, returning `false` if the stop signal fired first.
    async fn sleep_or_cancel(&mut self, wait: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => {
                self.cursor.state = CursorState::Cancelled;
                false
            }
            () = tokio::time::sleep(wait) => true,
        }
    }
}
