//! Backfill resumption across runs.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use common::{archive_collector, fast_paginator, memory_merge, page_of, FakeSearch};
use focal::backfill::{BackfillOrchestrator, BackfillOrder};
use focal::error::ApiError;
use focal::merge::MergeStage;
use focal::search::{SearchCollector, SearchLimits};
use focal::store::{JsonFileStore, Store, WindowStatus};
use focal::window::TimeWindow;

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 8, d, 0, 0, 0).unwrap()
}

fn window(a: u32, b: u32) -> TimeWindow {
    TimeWindow::new(day(a), day(b)).unwrap()
}

fn issued_windows(api: &FakeSearch) -> Vec<TimeWindow> {
    let mut windows: Vec<TimeWindow> = api.requests().into_iter().filter_map(|r| r.window).collect();
    windows.dedup();
    windows
}

#[tokio::test]
async fn test_interrupted_backfill_resumes_with_remaining_windows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("focal-data.json");
    let requested = window(1, 4);

    // First run: the stop signal arrives while the first window finishes.
    {
        let store: Arc<dyn Store> = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let merge = Arc::new(MergeStage::new(store, "evt"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let api = Arc::new(FakeSearch::new(move |_| {
            trigger.cancel();
            Ok(page_of(0..3, None))
        }));
        let search = archive_collector(Arc::clone(&api), Arc::clone(&merge), cancel);
        let orchestrator = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::OldestFirst);

        let report = orchestrator.run("event_x", requested, None).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.completed, vec![window(1, 2)]);
        assert_eq!(report.pending, vec![window(2, 3), window(3, 4)]);
        assert_eq!(issued_windows(&api), vec![window(1, 2)]);
    }

    // Second run on the reopened store only touches what is left.
    let store: Arc<dyn Store> = Arc::new(JsonFileStore::open(&path).await.unwrap());
    let merge = Arc::new(MergeStage::new(Arc::clone(&store), "evt"));
    let api = Arc::new(FakeSearch::new(|_| Ok(page_of(0..3, None))));
    let search = archive_collector(Arc::clone(&api), merge, CancellationToken::new());
    let orchestrator = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::OldestFirst);

    let report = orchestrator.run("event_x", requested, None).await.unwrap();

    assert_eq!(issued_windows(&api), vec![window(2, 3), window(3, 4)]);
    assert!(report.is_complete());

    let windows = store.get_windows("evt").await.unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].window, requested);
    assert_eq!(windows[0].status, WindowStatus::Complete);
    assert_eq!(store.list("evt").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_failed_window_stays_pending_while_siblings_complete() {
    let merge = memory_merge("evt");
    let requested = window(1, 4);
    let flaky = Arc::new(FakeSearch::new(|request| {
        if request.window.is_some_and(|w| w.start == day(2)) {
            Err(ApiError::Unavailable {
                status: 503,
                message: "over capacity".into(),
            })
        } else {
            Ok(page_of(0..2, None))
        }
    }));
    let search = archive_collector(Arc::clone(&flaky), Arc::clone(&merge), CancellationToken::new());
    let report = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::NewestFirst)
        .run("event_x", requested, None)
        .await
        .unwrap();

    assert_eq!(report.issued, vec![window(3, 4), window(2, 3), window(1, 2)]);
    assert_eq!(report.completed, vec![window(3, 4), window(1, 2)]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].window, window(2, 3));
    assert_eq!(report.pending, vec![window(2, 3)]);
    assert!(!report.is_complete());

    let healthy = Arc::new(FakeSearch::new(|_| Ok(page_of(0..2, None))));
    let search = archive_collector(Arc::clone(&healthy), merge, CancellationToken::new());
    let retry = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::NewestFirst)
        .run("event_x", requested, None)
        .await
        .unwrap();

    assert_eq!(issued_windows(&healthy), vec![window(2, 3)]);
    assert!(retry.is_complete());
}

#[tokio::test]
async fn test_fatal_error_aborts_backfill() {
    let merge = memory_merge("evt");
    let api = Arc::new(FakeSearch::new(|_| {
        Err(ApiError::Api {
            status: 400,
            message: "invalid query".into(),
        })
    }));
    let search = archive_collector(Arc::clone(&api), Arc::clone(&merge), CancellationToken::new());

    let err = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::OldestFirst)
        .run("(", window(1, 3), None)
        .await
        .unwrap_err();

    assert!(!err.is_resumable());
    assert_eq!(api.requests().len(), 1);
    let windows = merge.store().get_windows("evt").await.unwrap();
    assert!(windows.iter().all(|w| w.status == WindowStatus::Pending));
}

#[tokio::test]
async fn test_windows_beyond_endpoint_reach_stay_pending() {
    let merge = memory_merge("evt");
    let api = Arc::new(FakeSearch::new(|_| Ok(page_of(0..2, None))));
    let search = SearchCollector::new(
        Arc::clone(&api) as Arc<dyn focal::twitter::SearchApi>,
        Arc::clone(&merge),
        SearchLimits::recent(),
        fast_paginator(),
        100,
        CancellationToken::new(),
    );

    let report = BackfillOrchestrator::new(&search, Duration::days(1), BackfillOrder::OldestFirst)
        .run("event_x", window(1, 3), None)
        .await
        .unwrap();

    assert!(api.requests().is_empty());
    assert!(report.completed.is_empty());
    assert_eq!(report.failures.len(), 2);
    assert_eq!(report.pending, vec![window(1, 2), window(2, 3)]);
    assert!(!report.is_complete());
    let windows = merge.store().get_windows("evt").await.unwrap();
    assert!(windows.iter().all(|w| w.status == WindowStatus::Pending));
}

#[tokio::test]
async fn test_partly_reachable_window_completes_only_the_searched_part() {
    let merge = memory_merge("evt");
    let api = Arc::new(FakeSearch::new(|_| Ok(page_of(0..2, None))));
    let search = SearchCollector::new(
        Arc::clone(&api) as Arc<dyn focal::twitter::SearchApi>,
        Arc::clone(&merge),
        SearchLimits::recent(),
        fast_paginator(),
        100,
        CancellationToken::new(),
    );
    let now = Utc::now();
    let requested = TimeWindow::new(now - Duration::days(9), now - Duration::days(5)).unwrap();

    let report = BackfillOrchestrator::new(&search, Duration::days(4), BackfillOrder::OldestFirst)
        .run("event_x", requested, None)
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 1);
    let covered = report.completed[0];
    assert!(covered.start > requested.start);
    assert_eq!(covered.end, requested.end);
    assert_eq!(report.failures.len(), 1);

    let windows = merge.store().get_windows("evt").await.unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].status, WindowStatus::Pending);
    assert_eq!(windows[0].window.start, requested.start);
    assert_eq!(windows[0].window.end, covered.start);
    assert_eq!(windows[1].status, WindowStatus::Complete);
}
