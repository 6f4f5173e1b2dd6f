//! Backfill orchestration.
//!
//! A requested range is reduced to the gaps no complete window covers yet,
//! each gap is cut into chunks, every chunk is recorded as pending, and the
//! chunks are searched one at a time. Only the part of a chunk its search
//! covered to the end becomes complete; the rest stays pending for the next
//! run.

use std::fmt;

use chrono::Duration;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{CollectorError, CollectorResult};
use crate::records::SourceMethod;
use crate::search::{SearchCollector, SearchJob};
use crate::store::WindowStatus;
use crate::window::TimeWindow;

/// Order in which chunks are searched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl fmt::Display for BackfillOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OldestFirst => "oldest_first",
            Self::NewestFirst => "newest_first",
        })
    }
}

/// A chunk that failed and stays pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowFailure {
    pub window: TimeWindow,
    pub reason: String,
}

impl From<WindowFailure> for CollectorError {
    fn from(f: WindowFailure) -> Self {
        CollectorError::BackfillWindowFailure {
            window: f.window,
            reason: f.reason,
        }
    }
}

/// Outcome of one backfill run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    /// Chunks searched this run, in issue order.
    pub issued: Vec<TimeWindow>,
    pub completed: Vec<TimeWindow>,
    /// Windows still pending for the event after this run.
    pub pending: Vec<TimeWindow>,
    pub failures: Vec<WindowFailure>,
    pub primary: u64,
    pub inserted: u64,
    pub cancelled: bool,
}

impl BackfillReport {
    /// Whether the requested range is now fully covered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.failures.is_empty() && !self.cancelled
    }
}

/// Fills the uncovered parts of a historical range for one query.
pub struct BackfillOrchestrator<'a> {
    search: &'a SearchCollector,
    chunk: Duration,
    order: BackfillOrder,
}

impl<'a> BackfillOrchestrator<'a> {
    #[must_use]
    pub fn new(search: &'a SearchCollector, chunk: Duration, order: BackfillOrder) -> Self {
        Self {
            search,
            chunk,
            order,
        }
    }

    /// Chunks of `requested` not yet covered by `complete`, in issue order.
    #[must_use]
    pub fn plan(&self, requested: TimeWindow, complete: &[TimeWindow]) -> Vec<TimeWindow> {
        let mut chunks: Vec<TimeWindow> = requested
            .subtract(complete)
            .iter()
            .flat_map(|gap| gap.chunks(Some(self.chunk)))
            .collect();
        if self.order == BackfillOrder::NewestFirst {
            chunks.reverse();
        }
        chunks
    }

    /// Search every uncovered chunk of `requested` for `query`.
    ///
    /// Transient failures are recorded and the remaining chunks still run.
    /// Fatal failures and store errors abort the run; the chunk stays pending.
    pub async fn run(
        &self,
        query: &str,
        requested: TimeWindow,
        ceiling: Option<u64>,
    ) -> CollectorResult<BackfillReport> {
        let store = self.search.merge_stage().store();
        let event = self.search.merge_stage().event();

        let complete: Vec<TimeWindow> = store
            .get_windows(event)
            .await?
            .into_iter()
            .filter(|w| w.status == WindowStatus::Complete)
            .map(|w| w.window)
            .collect();
        let chunks = self.plan(requested, &complete);
        info!(
            event,
            requested = %requested,
            chunks = chunks.len(),
            order = %self.order,
            "Starting backfill"
        );

        for chunk in &chunks {
            store.mark_window_pending(event, *chunk).await?;
        }

        let mut report = BackfillReport::default();
        for chunk in chunks {
            if self.search.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.issued.push(chunk);
            let job = SearchJob {
                query: query.to_string(),
                window: chunk,
                ceiling,
                source: SourceMethod::Search,
            };

            match self.search.run(&job).await {
                Ok(result) => {
                    report.primary += result.primary;
                    report.inserted += result.inserted;
                    if result.cancelled {
                        warn!(window = %chunk, "Backfill interrupted, window stays pending");
                        report.cancelled = true;
                        break;
                    }
                    match result.covered {
                        Some(covered) => {
                            store.mark_window_complete(event, covered).await?;
                            report.completed.push(covered);
                            if covered != chunk {
                                warn!(window = %chunk, covered = %covered, "Backfill window only partly searched");
                                report.failures.push(WindowFailure {
                                    window: chunk,
                                    reason: format!("only {covered} was searched"),
                                });
                            }
                        }
                        None => {
                            warn!(window = %chunk, "Backfill window not searched, stays pending");
                            report.failures.push(WindowFailure {
                                window: chunk,
                                reason: format!(
                                    "window is outside the reach of the {} endpoint",
                                    self.search.limits().endpoint
                                ),
                            });
                        }
                    }
                }
                Err(e) if e.is_resumable() => {
                    warn!(window = %chunk, error = %e, "Backfill window failed, continuing");
                    report.failures.push(WindowFailure {
                        window: chunk,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(window = %chunk, error = %e, "Backfill aborted");
                    store.flush().await?;
                    return Err(e);
                }
            }
        }

        store.flush().await?;
        report.pending = store
            .get_windows(event)
            .await?
            .into_iter()
            .filter(|w| w.status == WindowStatus::Pending && w.window.overlaps(&requested))
            .map(|w| w.window)
            .collect();
        info!(
            event,
            completed = report.completed.len(),
            pending = report.pending.len(),
            failed = report.failures.len(),
            inserted = report.inserted,
            "Backfill finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use crate::error::ApiResult;
    use crate::merge::MergeStage;
    use crate::paginator::PaginatorConfig;
    use crate::search::SearchLimits;
    use crate::store::MemoryStore;
    use crate::twitter::types::{CountPage, TweetPage};
    use crate::twitter::{CountRequest, EndpointKind, SearchApi, SearchRequest};

    struct Empty;

    #[async_trait::async_trait]
    impl SearchApi for Empty {
        async fn search(&self, _: EndpointKind, _: &SearchRequest) -> ApiResult<TweetPage> {
            Ok(TweetPage::default())
        }
        async fn count(&self, _: EndpointKind, _: &CountRequest) -> ApiResult<CountPage> {
            Ok(CountPage::default())
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 8, day, hour, 0, 0).unwrap()
    }

    fn collector() -> SearchCollector {
        let merge = Arc::new(MergeStage::new(Arc::new(MemoryStore::new()), "evt"));
        SearchCollector::new(
            Arc::new(Empty),
            merge,
            SearchLimits::full_archive(),
            PaginatorConfig::default(),
            500,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_plan_skips_complete_and_orders() {
        let search = collector();
        let requested = TimeWindow::new(at(1, 0), at(4, 0)).unwrap();
        let done = [TimeWindow::new(at(2, 0), at(3, 0)).unwrap()];

        let oldest = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::OldestFirst)
            .plan(requested, &done);
        assert_eq!(
            oldest,
            vec![
                TimeWindow::new(at(1, 0), at(2, 0)).unwrap(),
                TimeWindow::new(at(3, 0), at(4, 0)).unwrap(),
            ]
        );

        let newest = BackfillOrchestrator::new(&search, Duration::hours(12), BackfillOrder::NewestFirst)
            .plan(requested, &done);
        assert_eq!(newest.len(), 4);
        assert_eq!(newest[0].end, at(4, 0));
    }

    #[tokio::test]
    async fn test_run_marks_windows_complete() {
        let search = collector();
        let requested = TimeWindow::new(at(1, 0), at(3, 0)).unwrap();
        let orchestrator = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::OldestFirst);

        let report = orchestrator.run("q", requested, None).await.unwrap();
        assert_eq!(report.completed.len(), 2);
        assert!(report.is_complete());

        let again = orchestrator.run("q", requested, None).await.unwrap();
        assert!(again.issued.is_empty());
    }
}
