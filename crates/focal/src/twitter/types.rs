//! Twitter API v2 wire types.
//!
//! Only the fields the collector persists are modelled; everything else in
//! the payload is ignored by serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Paged responses
// ─────────────────────────────────────────────────────────────────────────────

/// One page of tweets from search, conversation, quote or timeline lookups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TweetPage {
    /// Tweets that matched the query
    #[serde(default)]
    pub data: Vec<ApiTweet>,

    /// Expanded objects referenced by `data`
    #[serde(default)]
    pub includes: Includes,

    /// Pagination metadata
    #[serde(default)]
    pub meta: ResponseMeta,
}

/// Included expansions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Includes {
    /// Expanded user objects
    #[serde(default)]
    pub users: Vec<ApiUser>,

    /// Referenced tweets (quoted, replied to, retweeted)
    #[serde(default)]
    pub tweets: Vec<ApiTweet>,
}

/// Response metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Number of results on this page
    #[serde(default)]
    pub result_count: Option<u32>,

    /// Token for the next page
    #[serde(default)]
    pub next_token: Option<String>,

    /// Newest tweet ID on the page
    #[serde(default)]
    pub newest_id: Option<String>,

    /// Oldest tweet ID on the page
    #[serde(default)]
    pub oldest_id: Option<String>,

    /// Total across all buckets (counts endpoint only)
    #[serde(default)]
    pub total_tweet_count: Option<u64>,
}

/// One page from the counts endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountPage {
    #[serde(default)]
    pub data: Vec<CountBucket>,

    #[serde(default)]
    pub meta: ResponseMeta,
}

/// Tweet volume for one granularity bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tweet_count: u64,
}

/// Error object returned inside a 200 response or as a stream frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorObject {
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub detail: Option<String>,

    /// Rule endpoint puts its reasons here
    #[serde(default)]
    pub details: Vec<String>,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub id: Option<String>,
}

impl ApiErrorObject {
    /// Best human-readable description.
    #[must_use]
    pub fn message(&self) -> String {
        if !self.details.is_empty() {
            return self.details.join("; ");
        }
        self.detail
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tweets and users
// ─────────────────────────────────────────────────────────────────────────────

/// Tweet object as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTweet {
    pub id: String,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub author_id: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub lang: Option<String>,

    #[serde(default)]
    pub possibly_sensitive: Option<bool>,

    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub public_metrics: Option<TweetMetrics>,

    #[serde(default)]
    pub entities: Option<Entities>,

    #[serde(default)]
    pub referenced_tweets: Vec<ReferencedTweet>,

    #[serde(default)]
    pub attachments: Option<Attachments>,

    #[serde(default)]
    pub geo: Option<Geo>,
}

/// Reference from one tweet to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedTweet {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub id: String,
}

/// How a tweet references another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    RepliedTo,
    Quoted,
    Retweeted,
}

/// Engagement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetMetrics {
    #[serde(default)]
    pub retweet_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub quote_count: u64,
}

/// Structured sub-entities of a tweet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub hashtags: Vec<TagEntity>,

    #[serde(default)]
    pub mentions: Vec<MentionEntity>,

    #[serde(default)]
    pub urls: Vec<UrlEntity>,
}

/// Hashtag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagEntity {
    pub tag: String,
}

/// Mentioned account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionEntity {
    #[serde(alias = "tag")]
    pub username: String,

    #[serde(default)]
    pub id: Option<String>,
}

/// Link inside the tweet text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlEntity {
    pub url: String,

    #[serde(default)]
    pub expanded_url: Option<String>,
}

/// Media attachments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachments {
    #[serde(default)]
    pub media_keys: Vec<String>,
}

/// Geo tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geo {
    #[serde(default)]
    pub place_id: Option<String>,
}

/// User object from `includes.users`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
    pub id: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub public_metrics: Option<UserMetrics>,
}

/// Follower counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UserMetrics {
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub following_count: u64,
    #[serde(default)]
    pub tweet_count: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Filtered stream
// ─────────────────────────────────────────────────────────────────────────────

/// One frame of the filtered stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    pub data: ApiTweet,

    #[serde(default)]
    pub includes: Includes,

    #[serde(default)]
    pub matching_rules: Vec<MatchingRule>,
}

/// Rule that caused a stream match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingRule {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub tag: Option<String>,
}

/// Rule as registered with the stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Body for adding rules.
#[derive(Debug, Clone, Serialize)]
pub struct AddRulesRequest {
    pub add: Vec<ApiRule>,
}

/// Body for deleting rules.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteRulesRequest {
    pub delete: DeleteIds,
}

/// Rule ids to delete.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteIds {
    pub ids: Vec<String>,
}

/// Response of the rules endpoint (list, add and delete share it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesResponse {
    #[serde(default)]
    pub data: Vec<ApiRule>,

    #[serde(default)]
    pub errors: Vec<ApiErrorObject>,
}
