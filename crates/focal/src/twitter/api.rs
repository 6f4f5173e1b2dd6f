//! Seams between the collectors and the remote API.
//!
//! Collectors only see these traits, so tests drive them with in-process
//! fakes while the binary plugs in [`super::TwitterClient`].

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::window::TimeWindow;

use super::types::{ApiRule, CountPage, RulesResponse, TweetPage};

/// Which search endpoint a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// `/2/tweets/search/recent` (last seven days)
    Recent,
    /// `/2/tweets/search/all` (academic full archive)
    FullArchive,
}

impl EndpointKind {
    /// Path suffix shared by the search and counts endpoints.
    #[must_use]
    pub fn path_suffix(self) -> &'static str {
        match self {
            Self::Recent => "recent",
            Self::FullArchive => "all",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recent => "recent",
            Self::FullArchive => "full_archive",
        })
    }
}

/// Bucket size for the counts endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    #[default]
    Hour,
    Day,
}

impl Granularity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

/// One page request against a search endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub window: Option<TimeWindow>,
    pub max_results: u32,
    pub next_token: Option<String>,
}

/// One page request against a counts endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRequest {
    pub query: String,
    pub window: Option<TimeWindow>,
    pub granularity: Granularity,
    pub next_token: Option<String>,
}

/// One page request against a user timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineRequest {
    pub user_id: String,
    pub window: Option<TimeWindow>,
    pub max_results: u32,
    /// Timelines call their cursor `pagination_token`.
    pub pagination_token: Option<String>,
}

/// Keyword search and tweet counts.
#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Fetch one page of search results.
    async fn search(&self, endpoint: EndpointKind, request: &SearchRequest) -> ApiResult<TweetPage>;

    /// Fetch one page of per-bucket tweet counts.
    async fn count(&self, endpoint: EndpointKind, request: &CountRequest) -> ApiResult<CountPage>;
}

/// User timeline lookup.
#[async_trait]
pub trait TimelineApi: Send + Sync {
    async fn user_tweets(&self, request: &TimelineRequest) -> ApiResult<TweetPage>;
}

/// Filtered stream rule registry.
#[async_trait]
pub trait RulesApi: Send + Sync {
    /// All rules currently registered.
    async fn list_rules(&self) -> ApiResult<Vec<ApiRule>>;

    /// Register rules. With `dry_run` the endpoint only validates them.
    async fn add_rules(&self, rules: &[ApiRule], dry_run: bool) -> ApiResult<RulesResponse>;

    /// Remove rules by id.
    async fn delete_rules(&self, ids: &[String]) -> ApiResult<()>;
}

/// Newline-delimited frames of the filtered stream, heartbeats included.
pub type LineStream = BoxStream<'static, ApiResult<String>>;

/// Opens filtered stream connections.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn connect(&self) -> ApiResult<LineStream>;
}
