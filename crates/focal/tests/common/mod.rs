//! In-process fakes for the API seams, shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use focal::error::{ApiError, ApiResult};
use focal::merge::MergeStage;
use focal::paginator::PaginatorConfig;
use focal::search::{SearchCollector, SearchLimits};
use focal::store::{MemoryStore, Store};
use focal::twitter::types::{ApiRule, ApiErrorObject, CountPage, RulesResponse, TweetPage};
use focal::twitter::{
    CountRequest, EndpointKind, LineStream, RulesApi, SearchApi, SearchRequest, StreamSource,
    TimelineApi, TimelineRequest,
};

// =============================================================================
// Payload builders
// =============================================================================

/// Tweet JSON with an author, a timestamp and zeroed metrics.
pub fn tweet(id: &str, author: &str) -> Value {
    json!({
        "id": id,
        "text": format!("tweet {id}"),
        "author_id": author,
        "created_at": "2021-08-01T12:00:00Z",
        "conversation_id": id,
        "public_metrics": {"retweet_count": 0, "reply_count": 0, "like_count": 0, "quote_count": 0}
    })
}

pub fn user(id: &str, username: &str) -> Value {
    json!({"id": id, "username": username, "public_metrics": {"followers_count": 10}})
}

/// Page of tweets `ids` by author `u1`, with an optional next token.
pub fn page_of(ids: impl IntoIterator<Item = u64>, next: Option<&str>) -> TweetPage {
    let data: Vec<Value> = ids.into_iter().map(|i| tweet(&i.to_string(), "u1")).collect();
    page(data, vec![], vec![user("u1", "alice")], next)
}

pub fn page(data: Vec<Value>, tweets: Vec<Value>, users: Vec<Value>, next: Option<&str>) -> TweetPage {
    let count = data.len();
    serde_json::from_value(json!({
        "data": data,
        "includes": {"tweets": tweets, "users": users},
        "meta": {"result_count": count, "next_token": next}
    }))
    .unwrap()
}

pub fn fast_paginator() -> PaginatorConfig {
    PaginatorConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        rate_limit_fallback: Duration::from_millis(5),
        min_request_interval: Duration::ZERO,
    }
}

// =============================================================================
// Search
// =============================================================================

type SearchHandler = dyn Fn(&SearchRequest) -> ApiResult<TweetPage> + Send + Sync;

/// Search endpoint answering from a closure and recording every request.
pub struct FakeSearch {
    handler: Box<SearchHandler>,
    pub requests: Mutex<Vec<SearchRequest>>,
}

impl FakeSearch {
    pub fn new(handler: impl Fn(&SearchRequest) -> ApiResult<TweetPage> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always returns one empty, final page.
    pub fn empty() -> Self {
        Self::new(|_| Ok(TweetPage::default()))
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.query).collect()
    }
}

#[async_trait]
impl SearchApi for FakeSearch {
    async fn search(&self, _endpoint: EndpointKind, request: &SearchRequest) -> ApiResult<TweetPage> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }

    async fn count(&self, _endpoint: EndpointKind, _request: &CountRequest) -> ApiResult<CountPage> {
        Ok(CountPage::default())
    }
}

pub fn memory_merge(event: &str) -> Arc<MergeStage> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Arc::new(MergeStage::new(store, event))
}

pub fn archive_collector(
    api: Arc<FakeSearch>,
    merge: Arc<MergeStage>,
    cancel: CancellationToken,
) -> SearchCollector {
    SearchCollector::new(
        api,
        merge,
        SearchLimits::full_archive(),
        fast_paginator(),
        500,
        cancel,
    )
}

// =============================================================================
// Timelines
// =============================================================================

type TimelineHandler = dyn Fn(&TimelineRequest) -> ApiResult<TweetPage> + Send + Sync;

pub struct FakeTimeline {
    handler: Box<TimelineHandler>,
    pub requests: Mutex<Vec<TimelineRequest>>,
}

impl FakeTimeline {
    pub fn new(handler: impl Fn(&TimelineRequest) -> ApiResult<TweetPage> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<TimelineRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TimelineApi for FakeTimeline {
    async fn user_tweets(&self, request: &TimelineRequest) -> ApiResult<TweetPage> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Rule registry that validates like the real endpoint: rejected values and
/// values already registered come back as errors.
#[derive(Default)]
pub struct FakeRules {
    pub rules: Mutex<Vec<ApiRule>>,
    pub rejected_values: HashSet<String>,
    next_id: AtomicU64,
    /// Mutating calls, in order: `add:<tag>` / `delete:<id>`.
    pub log: Mutex<Vec<String>>,
}

impl FakeRules {
    pub fn with_rules(rules: &[(&str, &str)]) -> Self {
        let fake = Self::default();
        for (tag, value) in rules {
            fake.insert(tag, value);
        }
        fake
    }

    fn insert(&self, tag: &str, value: &str) -> ApiRule {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let rule = ApiRule {
            id: Some(id.to_string()),
            value: value.to_string(),
            tag: Some(tag.to_string()),
        };
        self.rules.lock().unwrap().push(rule.clone());
        rule
    }

    /// Registered rules as sorted `(tag, value)` pairs.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.tag.clone().unwrap_or_default(), r.value.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl RulesApi for FakeRules {
    async fn list_rules(&self) -> ApiResult<Vec<ApiRule>> {
        Ok(self.rules.lock().unwrap().clone())
    }

    async fn add_rules(&self, rules: &[ApiRule], dry_run: bool) -> ApiResult<RulesResponse> {
        let mut response = RulesResponse::default();
        for rule in rules {
            let duplicate = self
                .rules
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.value == rule.value);
            if self.rejected_values.contains(&rule.value) || duplicate {
                response.errors.push(ApiErrorObject {
                    title: Some(if duplicate { "DuplicateRule" } else { "Invalid Rule" }.into()),
                    detail: None,
                    details: vec!["rejected".into()],
                    value: Some(rule.value.clone()),
                    id: None,
                });
                continue;
            }
            if !dry_run {
                let tag = rule.tag.clone().unwrap_or_default();
                self.log.lock().unwrap().push(format!("add:{tag}"));
                response.data.push(self.insert(&tag, &rule.value));
            }
        }
        Ok(response)
    }

    async fn delete_rules(&self, ids: &[String]) -> ApiResult<()> {
        let mut rules = self.rules.lock().unwrap();
        for id in ids {
            self.log.lock().unwrap().push(format!("delete:{id}"));
            rules.retain(|r| r.id.as_deref() != Some(id.as_str()));
        }
        Ok(())
    }
}

// =============================================================================
// Stream
// =============================================================================

/// One scripted connection attempt.
pub enum Connection {
    /// Connect fails with this error.
    Refused(ApiError),
    /// Deliver these lines, then close.
    Lines(Vec<String>),
    /// Deliver these lines, then stay open without sending anything.
    Hold(Vec<String>),
}

/// Stream source replaying scripted connections; refuses once the script runs out.
pub struct FakeStream {
    script: Mutex<VecDeque<Connection>>,
    pub connects: AtomicU64,
}

impl FakeStream {
    pub fn new(script: Vec<Connection>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            connects: AtomicU64::new(0),
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for FakeStream {
    async fn connect(&self) -> ApiResult<LineStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            None => Err(ApiError::Unavailable {
                status: 503,
                message: "stream unavailable".into(),
            }),
            Some(Connection::Refused(e)) => Err(e),
            Some(Connection::Lines(lines)) => {
                Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
            }
            Some(Connection::Hold(lines)) => Ok(futures::stream::iter(lines.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
        }
    }
}
