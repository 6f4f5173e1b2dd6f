//! Search and archive collection.
//!
//! A [`SearchJob`] is one query over one time window. The collector splits
//! the window only when the endpoint cannot serve it in one piece (recent
//! search only reaches back a week; either endpoint may be configured with a
//! maximum window), then pages through the sub-ranges newest first and merges
//! everything it finds.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueryConfig;
use crate::error::{CollectorResult, ConfigError};
use crate::merge::{MergeOutcome, MergeStage};
use crate::paginator::{Cursor, CursorState, Paginator, PaginatorConfig};
use crate::records::{extract_records, SourceMethod};
use crate::twitter::types::CountBucket;
use crate::twitter::{CountRequest, EndpointKind, Granularity, SearchApi, SearchRequest};
use crate::window::{start_of_day, EventSpan, TimeAnchor, TimeWindow};

/// Distance kept from "now": the API rejects end times that are too recent
/// and start times right at the edge of the recent-search lookback.
const NOW_MARGIN_SECS: i64 = 30;

/// Default reach of full-archive search when no start is given.
const ARCHIVE_DEFAULT_DAYS: i64 = 30;

/// What one endpoint can serve in a single paginated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    pub endpoint: EndpointKind,
    /// How far back the endpoint reaches, if bounded.
    pub lookback: Option<Duration>,
    /// Longest window for one paginated call, if bounded.
    pub max_window: Option<Duration>,
}

impl SearchLimits {
    #[must_use]
    pub fn recent() -> Self {
        Self {
            endpoint: EndpointKind::Recent,
            lookback: Some(Duration::days(7)),
            max_window: None,
        }
    }

    #[must_use]
    pub fn full_archive() -> Self {
        Self {
            endpoint: EndpointKind::FullArchive,
            lookback: None,
            max_window: None,
        }
    }

    /// Window used when a query gives no bounds.
    #[must_use]
    pub fn default_window(&self, now: DateTime<Utc>) -> TimeWindow {
        let reach = self.lookback.unwrap_or(Duration::days(ARCHIVE_DEFAULT_DAYS));
        TimeWindow {
            start: now - reach,
            end: now,
        }
    }

    /// Clip a window to what the endpoint can serve at `now`.
    #[must_use]
    pub fn clamp(&self, window: TimeWindow, now: DateTime<Utc>) -> Option<TimeWindow> {
        let margin = Duration::seconds(NOW_MARGIN_SECS);
        let mut start = window.start;
        if let Some(lookback) = self.lookback {
            start = start.max(now - lookback + margin);
        }
        let end = window.end.min(now - margin);
        (start < end).then_some(TimeWindow { start, end })
    }

    /// Sub-ranges of `window`, newest first.
    #[must_use]
    pub fn split(&self, window: TimeWindow) -> Vec<TimeWindow> {
        window.chunks_newest_first(self.max_window)
    }
}

/// One query over one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchJob {
    pub query: String,
    pub window: TimeWindow,
    /// Cap on primary results across the whole window.
    pub ceiling: Option<u64>,
    /// Provenance the results are tagged with.
    pub source: SourceMethod,
}

/// Tallies of one search job.
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub query: String,
    pub window: TimeWindow,
    /// Part of `window` searched to the end, if any. Narrower than `window`
    /// when the endpoint could not reach all of it, the ceiling was hit or
    /// the job was interrupted.
    pub covered: Option<TimeWindow>,
    pub sub_windows: usize,
    pub pages: u32,
    /// Primary results returned by the endpoint.
    pub primary: u64,
    /// Records merged (primary plus referenced).
    pub records: u64,
    pub inserted: u64,
    /// Stop signal observed before the job finished.
    pub cancelled: bool,
    /// Cursor of the sub-range the job stopped in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl SearchReport {
    fn new(job: &SearchJob) -> Self {
        Self {
            query: job.query.clone(),
            window: job.window,
            covered: None,
            sub_windows: 0,
            pages: 0,
            primary: 0,
            records: 0,
            inserted: 0,
            cancelled: false,
            cursor: None,
        }
    }
}

/// Tallies primary results per wall-clock interval, for quota auditing.
#[derive(Debug)]
pub struct CountSink {
    interval: Duration,
    buckets: Mutex<BTreeMap<DateTime<Utc>, u64>>,
}

impl CountSink {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Count `n` results pulled now.
    pub async fn observe(&self, n: u64) {
        self.observe_at(Utc::now(), n).await;
    }

    pub async fn observe_at(&self, at: DateTime<Utc>, n: u64) {
        let bucket = at.duration_trunc(self.interval).unwrap_or(at);
        *self.buckets.lock().await.entry(bucket).or_default() += n;
    }

    /// `(interval start, results)` pairs, oldest first.
    pub async fn snapshot(&self) -> Vec<(DateTime<Utc>, u64)> {
        self.buckets
            .lock()
            .await
            .iter()
            .map(|(at, n)| (*at, *n))
            .collect()
    }

    pub async fn total(&self) -> u64 {
        self.buckets.lock().await.values().sum()
    }
}

/// Result of a counts-endpoint run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CountReport {
    pub total: u64,
    pub buckets: Vec<CountBucket>,
}

/// Runs search jobs against one endpoint.
pub struct SearchCollector {
    api: Arc<dyn SearchApi>,
    merge: Arc<MergeStage>,
    limits: SearchLimits,
    paginator: PaginatorConfig,
    page_size: u32,
    cancel: CancellationToken,
    count_sink: Option<Arc<CountSink>>,
}

impl SearchCollector {
    #[must_use]
    pub fn new(
        api: Arc<dyn SearchApi>,
        merge: Arc<MergeStage>,
        limits: SearchLimits,
        paginator: PaginatorConfig,
        page_size: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            merge,
            limits,
            paginator,
            page_size,
            cancel,
            count_sink: None,
        }
    }

    #[must_use]
    pub fn with_count_sink(mut self, sink: Arc<CountSink>) -> Self {
        self.count_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn limits(&self) -> &SearchLimits {
        &self.limits
    }

    #[must_use]
    pub fn merge_stage(&self) -> &Arc<MergeStage> {
        &self.merge
    }

    /// Whether the stop signal has been raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one job to completion, cancellation or failure.
    pub async fn run(&self, job: &SearchJob) -> CollectorResult<SearchReport> {
        self.run_from(job, None).await
    }

    /// Continue `job` from the cursor an earlier run stopped with.
    ///
    /// Page tokens are bound to the request that issued them, so the part of
    /// the cursor's sub-range not yet covered is searched afresh, followed by
    /// the older sub-ranges the earlier run never reached. Results the cursor
    /// already consumed still count against the ceiling.
    pub async fn resume(&self, job: &SearchJob, cursor: Cursor) -> CollectorResult<SearchReport> {
        if cursor.is_complete() || cursor.window.is_none() {
            return self.run(job).await;
        }
        self.run_from(job, Some(cursor)).await
    }

    async fn run_from(&self, job: &SearchJob, resume: Option<Cursor>) -> CollectorResult<SearchReport> {
        let mut report = SearchReport::new(job);
        let now = Utc::now();
        let Some(window) = self.limits.clamp(job.window, now) else {
            warn!(query = %job.query, window = %job.window, endpoint = %self.limits.endpoint, "Window outside endpoint reach, skipping");
            return Ok(report);
        };

        let (budget, plan) = match resume {
            None => (
                job.ceiling,
                self.limits.split(window).into_iter().map(|w| (w, None)).collect::<Vec<_>>(),
            ),
            Some(mut cursor) => {
                let budget = cursor.ceiling.map(|c| c.saturating_sub(cursor.collected));
                let mut plan = Vec::new();
                if let Some(rest) = cursor.window.and_then(|w| self.limits.clamp(w, now)) {
                    cursor.next_token = None;
                    cursor.ceiling = budget;
                    cursor.collected = 0;
                    cursor.window = Some(rest);
                    plan.push((rest, Some(cursor)));
                    if let Ok(older) = TimeWindow::new(window.start, rest.start.min(window.end)) {
                        plan.extend(self.limits.split(older).into_iter().map(|w| (w, None)));
                    }
                }
                (budget, plan)
            }
        };
        report.sub_windows = plan.len();
        info!(
            query = %job.query,
            window = %window,
            endpoint = %self.limits.endpoint,
            sub_windows = plan.len(),
            resumed = plan.first().is_some_and(|(_, c)| c.is_some()),
            "Starting search"
        );

        let mut contiguous = true;
        for (sub, resumed) in plan {
            let remaining = budget.map(|c| c.saturating_sub(report.primary));
            if remaining == Some(0) {
                break;
            }
            let paginator = match resumed {
                Some(cursor) => Paginator::resume(self.paginator.clone(), self.cancel.clone(), cursor),
                None => Paginator::new(self.paginator.clone(), self.cancel.clone(), remaining, Some(sub)),
            };
            let cursor = self.run_window(job, sub, paginator, &mut report).await?;

            let hit_ceiling = budget.is_some_and(|c| report.primary >= c);
            if contiguous && cursor.is_complete() && !hit_ceiling {
                report.covered = Some(match report.covered {
                    Some(covered) => TimeWindow {
                        start: sub.start,
                        end: covered.end,
                    },
                    None => sub,
                });
            } else {
                contiguous = false;
            }

            let cancelled = cursor.state == CursorState::Cancelled;
            report.cursor = Some(cursor);
            if cancelled {
                report.cancelled = true;
                break;
            }
        }

        info!(
            query = %job.query,
            pages = report.pages,
            primary = report.primary,
            inserted = report.inserted,
            cancelled = report.cancelled,
            "Search finished"
        );
        Ok(report)
    }

    async fn run_window(
        &self,
        job: &SearchJob,
        window: TimeWindow,
        mut paginator: Paginator,
        report: &mut SearchReport,
    ) -> CollectorResult<Cursor> {
        let endpoint = self.limits.endpoint;

        loop {
            let page = match paginator
                .next_page(|token| {
                    let request = SearchRequest {
                        query: job.query.clone(),
                        window: Some(window),
                        max_results: self.page_size,
                        next_token: token,
                    };
                    let api = Arc::clone(&self.api);
                    async move { api.search(endpoint, &request).await }
                })
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    // Pages merged before the failure are kept.
                    self.merge.store().flush().await?;
                    return Err(e);
                }
            };
            let Some(page) = page else { break };

            let primary = page.data.len() as u64;
            if let Some(sink) = &self.count_sink {
                sink.observe(primary).await;
            }
            report.pages += 1;
            report.primary += primary;

            for raw in extract_records(&page.data, &page.includes, job.source) {
                report.records += 1;
                if self.merge.merge(raw).await? == MergeOutcome::Inserted {
                    report.inserted += 1;
                }
            }
            debug!(window = %window, primary, total = report.primary, "Merged page");
        }

        self.merge.store().flush().await?;
        Ok(paginator.into_cursor())
    }

    /// Page through the counts endpoint; nothing is stored.
    pub async fn counts(
        &self,
        query: &str,
        window: TimeWindow,
        granularity: Granularity,
    ) -> CollectorResult<CountReport> {
        let endpoint = self.limits.endpoint;
        let window = self.limits.clamp(window, Utc::now()).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "window {window} is outside the reach of the {endpoint} endpoint"
            ))
        })?;

        let mut report = CountReport::default();
        let mut paginator =
            Paginator::new(self.paginator.clone(), self.cancel.clone(), None, Some(window));
        while let Some(page) = paginator
            .next_page(|token| {
                let request = CountRequest {
                    query: query.to_string(),
                    window: Some(window),
                    granularity,
                    next_token: token,
                };
                let api = Arc::clone(&self.api);
                async move { api.count(endpoint, &request).await }
            })
            .await?
        {
            report.total += page
                .meta
                .total_tweet_count
                .unwrap_or_else(|| page.data.iter().map(|b| b.tweet_count).sum());
            report.buckets.extend(page.data);
        }
        report.buckets.sort_by_key(|b| b.start);
        info!(query, total = report.total, buckets = report.buckets.len(), "Counted tweets");
        Ok(report)
    }
}

/// How a configured query's window is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// The query's own bounds; missing ones default to the endpoint's reach.
    #[default]
    Standard,
    /// From the latest collected tweet up to now.
    Update,
    /// From midnight of the earliest collected tweet's day up to that tweet.
    Backfill,
}

/// Window for one configured query.
pub fn query_window(
    query: &QueryConfig,
    mode: SearchMode,
    span: Option<EventSpan>,
    limits: &SearchLimits,
    now: DateTime<Utc>,
) -> Result<TimeWindow, ConfigError> {
    let (start, end) = match mode {
        SearchMode::Standard => {
            let (start, end) = query.resolve_bounds(span, now)?;
            let reach = limits.default_window(now);
            (start.unwrap_or(reach.start), end.unwrap_or(now))
        }
        SearchMode::Update => (TimeAnchor::LastTime.resolve(span, now)?, now),
        SearchMode::Backfill => {
            let first = TimeAnchor::FirstTime.resolve(span, now)?;
            (start_of_day(first), first)
        }
    };
    TimeWindow::new(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 8, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_recent_clamp() {
        let now = at(20, 0);
        let limits = SearchLimits::recent();
        let clamped = limits
            .clamp(TimeWindow::new(at(1, 0), at(25, 0)).unwrap(), now)
            .unwrap();
        assert!(clamped.start > at(13, 0));
        assert!(clamped.end < now);

        assert!(limits
            .clamp(TimeWindow::new(at(1, 0), at(2, 0)).unwrap(), now)
            .is_none());
    }

    #[test]
    fn test_archive_split_newest_first() {
        let limits = SearchLimits {
            max_window: Some(Duration::days(1)),
            ..SearchLimits::full_archive()
        };
        let parts = limits.split(TimeWindow::new(at(1, 0), at(4, 0)).unwrap());
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].end, at(4, 0));
        assert_eq!(parts[2].start, at(1, 0));

        let whole = SearchLimits::full_archive().split(TimeWindow::new(at(1, 0), at(4, 0)).unwrap());
        assert_eq!(whole.len(), 1);
    }

    #[tokio::test]
    async fn test_count_sink_buckets() {
        let sink = CountSink::new(Duration::hours(1));
        sink.observe_at(at(1, 10) + Duration::minutes(5), 100).await;
        sink.observe_at(at(1, 10) + Duration::minutes(50), 20).await;
        sink.observe_at(at(1, 11), 7).await;
        assert_eq!(sink.snapshot().await, vec![(at(1, 10), 120), (at(1, 11), 7)]);
        assert_eq!(sink.total().await, 127);
    }

    fn query(raw: &str) -> QueryConfig {
        serde_yaml::from_str(raw).unwrap()
    }

    #[test]
    fn test_query_window_modes() {
        let span = Some(EventSpan {
            first: at(2, 15),
            last: at(3, 9),
        });
        let now = at(10, 0);
        let limits = SearchLimits::full_archive();

        let bounded = query("query: x\nstart_time: 2021-08-01T00:00:00Z\nend_time: 2021-08-02T00:00:00Z\n");
        assert_eq!(
            query_window(&bounded, SearchMode::Standard, None, &limits, now).unwrap(),
            TimeWindow::new(at(1, 0), at(2, 0)).unwrap()
        );

        let open = query("query: x\n");
        assert_eq!(
            query_window(&open, SearchMode::Update, span, &limits, now).unwrap(),
            TimeWindow::new(at(3, 9), now).unwrap()
        );
        assert_eq!(
            query_window(&open, SearchMode::Backfill, span, &limits, now).unwrap(),
            TimeWindow::new(at(2, 0), at(2, 15)).unwrap()
        );
        assert!(query_window(&open, SearchMode::Update, None, &limits, now).is_err());

        let relative = query("query: x\nstart_time: first_time\nn_days_back: 1\n");
        let window = query_window(&relative, SearchMode::Standard, span, &limits, now).unwrap();
        assert_eq!(window.start, at(1, 15));
        assert_eq!(window.end, now);
    }
}
