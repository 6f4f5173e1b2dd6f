//! Conversation, quote and timeline resolvers.
//!
//! Each resolver starts from identifiers already collected for the event (or
//! supplied in a file) and pulls the related tweets, tagging them with the
//! relation that found them. Conversation and quote lookups are search
//! queries; timelines use the user-tweets endpoint and its own cursor.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CollectorResult, ConfigError, StoreResult};
use crate::merge::{MergeOutcome, MergeStage};
use crate::paginator::{CursorState, Paginator, PaginatorConfig};
use crate::records::{extract_records, SourceMethod};
use crate::search::{SearchCollector, SearchJob};
use crate::store::{Store, StoredTweet};
use crate::twitter::{TimelineApi, TimelineRequest};
use crate::window::{TimeAnchor, TimeWindow};

/// Longest query the search endpoints accept.
pub const MAX_QUERY_LEN: usize = 1024;

const OR: &str = " OR ";

/// How resolver windows relate to what is already collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// One shared window for every id; ids are OR-batched.
    #[default]
    Standard,
    /// Per id, from its latest known tweet to the window end.
    Update,
    /// Per id, from the window start to its earliest known tweet.
    Backfill,
}

/// One id to resolve, with the span of tweets already known for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    /// Author handle (quotes are looked up by status URL).
    pub handle: Option<String>,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl Target {
    #[must_use]
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handle: None,
            first: None,
            last: None,
        }
    }

    /// Window for this id under `mode`, or `None` if nothing is left to fetch.
    #[must_use]
    pub fn window(&self, shared: TimeWindow, mode: ResolveMode) -> Option<TimeWindow> {
        let window = match mode {
            ResolveMode::Standard => shared,
            ResolveMode::Update => TimeWindow {
                start: self.last.map_or(shared.start, |l| l.max(shared.start)),
                end: shared.end,
            },
            ResolveMode::Backfill => TimeWindow {
                start: shared.start,
                end: self.first.map_or(shared.end, |f| f.min(shared.end)),
            },
        };
        (!window.is_empty()).then_some(window)
    }
}

/// Tallies of one resolver run.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverReport {
    pub relation: SourceMethod,
    pub targets: usize,
    pub queries: usize,
    pub pages: u32,
    pub primary: u64,
    pub records: u64,
    pub inserted: u64,
    /// Quote depth reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    pub cancelled: bool,
}

impl ResolverReport {
    fn new(relation: SourceMethod, targets: usize) -> Self {
        Self {
            relation,
            targets,
            queries: 0,
            pages: 0,
            primary: 0,
            records: 0,
            inserted: 0,
            depth: None,
            cancelled: false,
        }
    }
}

/// OR-join `terms` into queries no longer than `limit` characters.
///
/// A single term longer than the limit still gets its own query.
#[must_use]
pub fn batch_queries(terms: &[String], limit: usize) -> Vec<String> {
    let mut queries = Vec::new();
    let mut current = String::new();
    for term in terms {
        if !current.is_empty() && current.len() + OR.len() + term.len() > limit {
            queries.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(OR);
        }
        current.push_str(term);
    }
    if !current.is_empty() {
        queries.push(current);
    }
    queries
}

/// Plan search jobs for `targets`: batched in standard mode, one per id otherwise.
#[must_use]
pub fn plan_jobs(
    targets: &[Target],
    term: impl Fn(&Target) -> Option<String>,
    shared: TimeWindow,
    mode: ResolveMode,
    source: SourceMethod,
) -> Vec<SearchJob> {
    if mode == ResolveMode::Standard {
        let terms: Vec<String> = targets.iter().filter_map(&term).collect();
        return batch_queries(&terms, MAX_QUERY_LEN)
            .into_iter()
            .map(|query| SearchJob {
                query,
                window: shared,
                ceiling: None,
                source,
            })
            .collect();
    }
    targets
        .iter()
        .filter_map(|t| {
            let window = t.window(shared, mode)?;
            Some(SearchJob {
                query: term(t)?,
                window,
                ceiling: None,
                source,
            })
        })
        .collect()
}

/// Read newline-delimited ids, skipping blank lines.
pub async fn read_ids(path: &Path) -> Result<Vec<Target>, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(Target::bare)
        .collect())
}

/// Resolve the shared window from anchors against the event's collected span.
///
/// A `last_time` end is pushed one second forward so the latest tweet itself
/// is inside the half-open window.
pub async fn anchored_window(
    store: &dyn Store,
    event: &str,
    start: TimeAnchor,
    end: TimeAnchor,
    days_back: i64,
    now: DateTime<Utc>,
) -> CollectorResult<TimeWindow> {
    let span = store
        .span(event, &[SourceMethod::Search, SourceMethod::Stream])
        .await?;
    let start = start.resolve(span, now)? - Duration::days(days_back);
    let mut resolved_end = end.resolve(span, now)?;
    if end == TimeAnchor::LastTime {
        resolved_end += Duration::seconds(1);
    }
    Ok(TimeWindow::new(start, resolved_end)?)
}

fn group_by<F>(rows: &[StoredTweet], include: impl Fn(&StoredTweet) -> bool, key: F) -> Vec<Target>
where
    F: Fn(&StoredTweet) -> Option<String>,
{
    let mut groups: BTreeMap<String, Target> = BTreeMap::new();
    for row in rows.iter().filter(|r| include(r)) {
        let Some(id) = key(row) else { continue };
        let target = groups.entry(id.clone()).or_insert_with(|| Target::bare(id));
        if let Some(at) = row.record.created_at {
            target.first = Some(target.first.map_or(at, |f| f.min(at)));
            target.last = Some(target.last.map_or(at, |l| l.max(at)));
        }
    }
    groups.into_values().collect()
}

fn primary_event_tweet(row: &StoredTweet) -> bool {
    row.flags.has_direct(SourceMethod::Search) || row.flags.has_direct(SourceMethod::Stream)
}

/// Conversations of the event's primary tweets. Conversation results extend
/// each thread's known span.
pub async fn conversation_targets(store: &dyn Store, event: &str) -> StoreResult<Vec<Target>> {
    let rows = store.list(event).await?;
    let roots: HashSet<String> = rows
        .iter()
        .filter(|r| primary_event_tweet(r))
        .filter_map(|r| r.record.conversation_id.clone())
        .collect();
    Ok(group_by(
        &rows,
        |r| {
            primary_event_tweet(r)
                || (r.flags.has_direct(SourceMethod::ConvoSearch)
                    && r.record.conversation_id.as_ref().is_some_and(|c| roots.contains(c)))
        },
        |r| r.record.conversation_id.clone(),
    ))
}

/// Authors of the event's primary tweets. Timeline results extend each
/// author's known span.
pub async fn timeline_targets(store: &dyn Store, event: &str) -> StoreResult<Vec<Target>> {
    let rows = store.list(event).await?;
    let authors: HashSet<String> = rows
        .iter()
        .filter(|r| primary_event_tweet(r))
        .filter_map(|r| r.record.author_id.clone())
        .collect();
    Ok(group_by(
        &rows,
        |r| {
            primary_event_tweet(r)
                || (r.flags.has_direct(SourceMethod::TimelineSearch)
                    && r.record.author_id.as_ref().is_some_and(|a| authors.contains(a)))
        },
        |r| r.record.author_id.clone(),
    ))
}

/// Whether a row can have quotes worth fetching.
fn quotable(row: &StoredTweet) -> bool {
    !row.record.is_retweet() && row.record.quote_count() > 0 && row.record.author_handle.is_some()
}

fn quote_target(row: &StoredTweet) -> Target {
    Target {
        id: row.record.id.clone(),
        handle: row.record.author_handle.clone(),
        first: row.record.created_at,
        last: row.record.created_at,
    }
}

/// Quotable primary tweets of the event.
pub async fn quote_targets(store: &dyn Store, event: &str) -> StoreResult<Vec<Target>> {
    Ok(store
        .list(event)
        .await?
        .iter()
        .filter(|r| primary_event_tweet(r) && quotable(r))
        .map(quote_target)
        .collect())
}

fn conversation_term(target: &Target) -> Option<String> {
    Some(format!("conversation_id:{}", target.id))
}

fn quote_term(target: &Target) -> Option<String> {
    let handle = target.handle.as_deref()?;
    Some(format!(
        "url:\"https://twitter.com/{handle}/status/{}\"",
        target.id
    ))
}

async fn run_jobs(
    search: &SearchCollector,
    jobs: &[SearchJob],
    report: &mut ResolverReport,
) -> CollectorResult<()> {
    for job in jobs {
        let result = search.run(job).await?;
        report.queries += 1;
        report.pages += result.pages;
        report.primary += result.primary;
        report.records += result.records;
        report.inserted += result.inserted;
        if result.cancelled {
            report.cancelled = true;
            break;
        }
    }
    Ok(())
}

/// Pulls whole reply threads.
pub struct ConversationResolver<'a> {
    search: &'a SearchCollector,
}

impl<'a> ConversationResolver<'a> {
    #[must_use]
    pub fn new(search: &'a SearchCollector) -> Self {
        Self { search }
    }

    pub async fn run(
        &self,
        targets: &[Target],
        window: TimeWindow,
        mode: ResolveMode,
    ) -> CollectorResult<ResolverReport> {
        let jobs = plan_jobs(
            targets,
            conversation_term,
            window,
            mode,
            SourceMethod::ConvoSearch,
        );
        info!(targets = targets.len(), queries = jobs.len(), ?mode, "Resolving conversations");
        let mut report = ResolverReport::new(SourceMethod::ConvoSearch, targets.len());
        run_jobs(self.search, &jobs, &mut report).await?;
        Ok(report)
    }
}

/// Follows quote tweets breadth first, up to a depth cap.
pub struct QuoteResolver<'a> {
    search: &'a SearchCollector,
    max_depth: u32,
}

impl<'a> QuoteResolver<'a> {
    #[must_use]
    pub fn new(search: &'a SearchCollector, max_depth: u32) -> Self {
        Self {
            search,
            max_depth: max_depth.max(1),
        }
    }

    /// Depth 1 fetches quotes of `seeds`; each further level fetches quotes
    /// of the quotes found on the previous one. No tweet is expanded twice.
    pub async fn run(&self, seeds: &[Target], window: TimeWindow) -> CollectorResult<ResolverReport> {
        let store = self.search.merge_stage().store();
        let event = self.search.merge_stage().event();
        let mut report = ResolverReport::new(SourceMethod::QuoteSearch, seeds.len());

        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: Vec<Target> = seeds
            .iter()
            .filter(|t| t.handle.is_some() && visited.insert(t.id.clone()))
            .cloned()
            .collect();

        for depth in 1..=self.max_depth {
            if frontier.is_empty() {
                break;
            }
            let jobs = plan_jobs(
                &frontier,
                quote_term,
                window,
                ResolveMode::Standard,
                SourceMethod::QuoteSearch,
            );
            info!(depth, tweets = frontier.len(), queries = jobs.len(), "Resolving quotes");
            run_jobs(self.search, &jobs, &mut report).await?;
            report.depth = Some(depth);
            if report.cancelled {
                break;
            }

            let parents: HashSet<&str> = frontier.iter().map(|t| t.id.as_str()).collect();
            let next: Vec<Target> = store
                .list(event)
                .await?
                .iter()
                .filter(|r| r.flags.has_direct(SourceMethod::QuoteSearch) && quotable(r))
                .filter(|r| {
                    r.record
                        .quoted
                        .as_ref()
                        .is_some_and(|q| parents.contains(q.id.as_str()))
                })
                .map(quote_target)
                .collect();
            frontier = next
                .into_iter()
                .filter(|t| visited.insert(t.id.clone()))
                .collect();
        }
        Ok(report)
    }
}

/// Pulls user timelines.
pub struct TimelineResolver {
    api: Arc<dyn TimelineApi>,
    merge: Arc<MergeStage>,
    paginator: PaginatorConfig,
    page_size: u32,
    cancel: CancellationToken,
}

impl TimelineResolver {
    #[must_use]
    pub fn new(
        api: Arc<dyn TimelineApi>,
        merge: Arc<MergeStage>,
        paginator: PaginatorConfig,
        page_size: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            merge,
            paginator,
            page_size,
            cancel,
        }
    }

    /// Fetch each author's timeline. `window` of `None` means the full timeline.
    pub async fn run(
        &self,
        targets: &[Target],
        window: Option<TimeWindow>,
        mode: ResolveMode,
    ) -> CollectorResult<ResolverReport> {
        let mut report = ResolverReport::new(SourceMethod::TimelineSearch, targets.len());
        info!(users = targets.len(), full = window.is_none(), ?mode, "Resolving timelines");

        for target in targets {
            let user_window = match window {
                Some(shared) => match target.window(shared, mode) {
                    Some(w) => Some(w),
                    None => continue,
                },
                None => None,
            };
            report.queries += 1;
            let finished = match self.run_user(&target.id, user_window, &mut report).await {
                Ok(finished) => finished,
                Err(e) => {
                    // Timelines pulled before the failure are kept.
                    self.merge.store().flush().await?;
                    return Err(e);
                }
            };
            if !finished {
                report.cancelled = true;
                break;
            }
        }
        self.merge.store().flush().await?;
        Ok(report)
    }

    /// Returns `false` if the stop signal interrupted the timeline.
    async fn run_user(
        &self,
        user_id: &str,
        window: Option<TimeWindow>,
        report: &mut ResolverReport,
    ) -> CollectorResult<bool> {
        let mut paginator =
            Paginator::new(self.paginator.clone(), self.cancel.clone(), None, window);
        loop {
            let page = paginator
                .next_page(|token| {
                    let request = TimelineRequest {
                        user_id: user_id.to_string(),
                        window,
                        max_results: self.page_size,
                        pagination_token: token,
                    };
                    let api = Arc::clone(&self.api);
                    async move { api.user_tweets(&request).await }
                })
                .await?;
            let Some(page) = page else { break };

            report.pages += 1;
            report.primary += page.data.len() as u64;
            for raw in extract_records(&page.data, &page.includes, SourceMethod::TimelineSearch) {
                report.records += 1;
                if self.merge.merge(raw).await? == MergeOutcome::Inserted {
                    report.inserted += 1;
                }
            }
        }
        let cursor = paginator.into_cursor();
        if cursor.state == CursorState::Cancelled {
            warn!(user_id, "Timeline interrupted");
            return Ok(false);
        }
        Ok(true)
    }
}
