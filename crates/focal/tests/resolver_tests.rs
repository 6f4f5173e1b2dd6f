//! Conversation, quote and timeline resolution around collected tweets.

mod common;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::{archive_collector, fast_paginator, memory_merge, page, page_of, tweet, user, FakeSearch, FakeTimeline};
use focal::error::ApiError;
use focal::merge::MergeStage;
use focal::records::{extract_records, SourceMethod};
use focal::resolvers::{
    self, ConversationResolver, QuoteResolver, ResolveMode, Target, TimelineResolver,
};
use focal::store::{JsonFileStore, Store};
use focal::twitter::types::TweetPage;
use focal::window::{TimeAnchor, TimeWindow};

fn with(mut tweet: Value, field: &str, value: Value) -> Value {
    tweet[field] = value;
    tweet
}

fn metrics(quotes: u64) -> Value {
    json!({"retweet_count": 0, "reply_count": 0, "like_count": 0, "quote_count": quotes})
}

async fn seed(merge: &MergeStage, page: &TweetPage, source: SourceMethod) {
    merge
        .merge_all(extract_records(&page.data, &page.includes, source))
        .await
        .unwrap();
}

fn event_day() -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2021, 8, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2021, 8, 2, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_conversations_are_batched_and_tagged() {
    let merge = memory_merge("evt");
    let seeded = page(
        vec![
            with(tweet("1", "u1"), "conversation_id", json!("c1")),
            with(tweet("2", "u2"), "conversation_id", json!("c2")),
        ],
        vec![],
        vec![user("u1", "alice"), user("u2", "bob")],
        None,
    );
    seed(&merge, &seeded, SourceMethod::Search).await;

    let api = Arc::new(FakeSearch::new(|_| {
        Ok(page(
            vec![with(tweet("3", "u3"), "conversation_id", json!("c1"))],
            vec![],
            vec![user("u3", "carol")],
            None,
        ))
    }));
    let search = archive_collector(Arc::clone(&api), Arc::clone(&merge), CancellationToken::new());

    let targets = resolvers::conversation_targets(merge.store().as_ref(), "evt")
        .await
        .unwrap();
    assert_eq!(
        targets.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
        vec!["c1", "c2"]
    );

    let report = ConversationResolver::new(&search)
        .run(&targets, event_day(), ResolveMode::Standard)
        .await
        .unwrap();

    assert_eq!(report.queries, 1);
    assert_eq!(api.queries(), vec!["conversation_id:c1 OR conversation_id:c2"]);
    let reply = merge.store().get("evt", "3").await.unwrap().unwrap();
    assert!(reply.flags.directly_from_convo_search);
    assert!(!reply.flags.from_search);
}

#[tokio::test]
async fn test_conversation_update_runs_per_id_from_latest_tweet() {
    let merge = memory_merge("evt");
    let seeded = page(
        vec![
            with(tweet("1", "u1"), "conversation_id", json!("c1")),
            with(
                with(tweet("2", "u1"), "conversation_id", json!("c2")),
                "created_at",
                json!("2021-08-01T18:00:00Z"),
            ),
        ],
        vec![],
        vec![user("u1", "alice")],
        None,
    );
    seed(&merge, &seeded, SourceMethod::Search).await;

    let api = Arc::new(FakeSearch::empty());
    let search = archive_collector(Arc::clone(&api), Arc::clone(&merge), CancellationToken::new());
    let targets = resolvers::conversation_targets(merge.store().as_ref(), "evt")
        .await
        .unwrap();

    ConversationResolver::new(&search)
        .run(&targets, event_day(), ResolveMode::Update)
        .await
        .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].query, "conversation_id:c1");
    assert_eq!(
        requests[0].window.unwrap().start,
        Utc.with_ymd_and_hms(2021, 8, 1, 12, 0, 0).unwrap()
    );
    assert_eq!(
        requests[1].window.unwrap().start,
        Utc.with_ymd_and_hms(2021, 8, 1, 18, 0, 0).unwrap()
    );
}

fn quote_api() -> FakeSearch {
    FakeSearch::new(|request| {
        let page = if request.query.contains("alice/status/1") {
            page(
                vec![with(
                    with(tweet("2", "u2"), "referenced_tweets", json!([{"type": "quoted", "id": "1"}])),
                    "public_metrics",
                    metrics(1),
                )],
                vec![],
                vec![user("u2", "bob")],
                None,
            )
        } else if request.query.contains("bob/status/2") {
            page(
                vec![with(tweet("3", "u3"), "referenced_tweets", json!([{"type": "quoted", "id": "2"}]))],
                vec![],
                vec![user("u3", "carol")],
                None,
            )
        } else {
            TweetPage::default()
        };
        Ok(page)
    })
}

async fn quote_seeded() -> Arc<MergeStage> {
    let merge = memory_merge("evt");
    let seeded = page(
        vec![with(tweet("1", "u1"), "public_metrics", metrics(2))],
        vec![],
        vec![user("u1", "alice")],
        None,
    );
    seed(&merge, &seeded, SourceMethod::Search).await;
    merge
}

#[tokio::test]
async fn test_quotes_follow_breadth_first_to_depth() {
    let merge = quote_seeded().await;
    let api = Arc::new(quote_api());
    let search = archive_collector(Arc::clone(&api), Arc::clone(&merge), CancellationToken::new());

    let seeds = resolvers::quote_targets(merge.store().as_ref(), "evt").await.unwrap();
    assert_eq!(seeds.len(), 1);

    let report = QuoteResolver::new(&search, 3).run(&seeds, event_day()).await.unwrap();

    assert_eq!(report.depth, Some(2));
    assert_eq!(
        api.queries(),
        vec![
            r#"url:"https://twitter.com/alice/status/1""#,
            r#"url:"https://twitter.com/bob/status/2""#,
        ]
    );
    for id in ["2", "3"] {
        let row = merge.store().get("evt", id).await.unwrap().unwrap();
        assert!(row.flags.directly_from_quote_search, "tweet {id}");
    }
}

#[tokio::test]
async fn test_quote_depth_cap_is_respected() {
    let merge = quote_seeded().await;
    let api = Arc::new(quote_api());
    let search = archive_collector(Arc::clone(&api), Arc::clone(&merge), CancellationToken::new());
    let seeds = resolvers::quote_targets(merge.store().as_ref(), "evt").await.unwrap();

    let report = QuoteResolver::new(&search, 1).run(&seeds, event_day()).await.unwrap();

    assert_eq!(report.depth, Some(1));
    assert_eq!(api.queries().len(), 1);
    assert!(merge.store().get("evt", "3").await.unwrap().is_none());
}

#[tokio::test]
async fn test_timelines_page_with_their_own_token() {
    let merge = memory_merge("evt");
    seed(&merge, &page_of([1], None), SourceMethod::Stream).await;

    let api = Arc::new(FakeTimeline::new(|request| {
        Ok(match request.pagination_token.as_deref() {
            None => page_of([10, 11], Some("n2")),
            Some(_) => page_of([12], None),
        })
    }));
    let targets = resolvers::timeline_targets(merge.store().as_ref(), "evt").await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].id, "u1");

    let resolver = TimelineResolver::new(
        api.clone(),
        Arc::clone(&merge),
        fast_paginator(),
        100,
        CancellationToken::new(),
    );
    let report = resolver.run(&targets, None, ResolveMode::Standard).await.unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.inserted, 3);
    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.user_id == "u1" && r.window.is_none()));
    assert_eq!(requests[1].pagination_token.as_deref(), Some("n2"));

    let row = merge.store().get("evt", "12").await.unwrap().unwrap();
    assert!(row.flags.directly_from_timeline_search);
}

#[tokio::test]
async fn test_anchored_window_spans_collected_tweets() {
    let merge = memory_merge("evt");
    seed(&merge, &page_of([1], None), SourceMethod::Search).await;
    let now = Utc::now();
    let store = merge.store().as_ref();

    let window = resolvers::anchored_window(store, "evt", TimeAnchor::FirstTime, TimeAnchor::LastTime, 14, now)
        .await
        .unwrap();
    let created = Utc.with_ymd_and_hms(2021, 8, 1, 12, 0, 0).unwrap();
    assert_eq!(window.start, created - Duration::days(14));
    assert_eq!(window.end, created + Duration::seconds(1));

    let empty = memory_merge("other");
    assert!(resolvers::anchored_window(empty.store().as_ref(), "other", TimeAnchor::FirstTime, TimeAnchor::Now, 0, now)
        .await
        .is_err());
}

#[tokio::test]
async fn test_failed_timeline_keeps_pages_already_pulled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("focal.json");
    let store: Arc<dyn Store> = Arc::new(JsonFileStore::open(&path).await.unwrap());
    let merge = Arc::new(MergeStage::new(store, "evt"));
    let api = Arc::new(FakeTimeline::new(|request| match request.pagination_token.as_deref() {
        None => Ok(page_of([10, 11], Some("n2"))),
        Some(_) => Err(ApiError::Unavailable {
            status: 503,
            message: "over capacity".into(),
        }),
    }));
    let targets = [Target {
        id: "u1".into(),
        handle: None,
        first: None,
        last: None,
    }];

    let resolver = TimelineResolver::new(api, merge, fast_paginator(), 100, CancellationToken::new());
    let err = resolver.run(&targets, None, ResolveMode::Standard).await.unwrap_err();
    assert!(err.is_resumable());

    let reopened = JsonFileStore::open(&path).await.unwrap();
    assert_eq!(reopened.list("evt").await.unwrap().len(), 2);
}
