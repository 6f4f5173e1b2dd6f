//! Tweet records and their provenance.
//!
//! Every record the merge stage sees is a [`RawRecord`]: a normalised tweet
//! plus the provenance flags of the path that produced it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::twitter::types::{ApiTweet, ApiUser, Includes, ReferenceKind, TweetMetrics};

/// Collection path that produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMethod {
    Search,
    Stream,
    ConvoSearch,
    QuoteSearch,
    TimelineSearch,
}

impl SourceMethod {
    pub const ALL: [SourceMethod; 5] = [
        Self::Search,
        Self::Stream,
        Self::ConvoSearch,
        Self::QuoteSearch,
        Self::TimelineSearch,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Stream => "stream",
            Self::ConvoSearch => "convo_search",
            Self::QuoteSearch => "quote_search",
            Self::TimelineSearch => "timeline_search",
        }
    }
}

impl fmt::Display for SourceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which paths a tweet was observed through.
///
/// `from_*` means the tweet showed up through that path at all;
/// `directly_from_*` means it was a primary result rather than context.
/// Flags only ever accumulate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvenanceFlags {
    #[serde(default)]
    pub from_search: bool,
    #[serde(default)]
    pub directly_from_search: bool,
    #[serde(default)]
    pub from_stream: bool,
    #[serde(default)]
    pub directly_from_stream: bool,
    #[serde(default)]
    pub from_convo_search: bool,
    #[serde(default)]
    pub directly_from_convo_search: bool,
    #[serde(default)]
    pub from_quote_search: bool,
    #[serde(default)]
    pub directly_from_quote_search: bool,
    #[serde(default)]
    pub from_timeline_search: bool,
    #[serde(default)]
    pub directly_from_timeline_search: bool,
}

impl ProvenanceFlags {
    /// Flags for one observation through `source`.
    #[must_use]
    pub fn tagged(source: SourceMethod, direct: bool) -> Self {
        let mut flags = Self::default();
        let (from, directly) = flags.slots_mut(source);
        *from = true;
        *directly = direct;
        flags
    }

    fn slots_mut(&mut self, source: SourceMethod) -> (&mut bool, &mut bool) {
        match source {
            SourceMethod::Search => (&mut self.from_search, &mut self.directly_from_search),
            SourceMethod::Stream => (&mut self.from_stream, &mut self.directly_from_stream),
            SourceMethod::ConvoSearch => (
                &mut self.from_convo_search,
                &mut self.directly_from_convo_search,
            ),
            SourceMethod::QuoteSearch => (
                &mut self.from_quote_search,
                &mut self.directly_from_quote_search,
            ),
            SourceMethod::TimelineSearch => (
                &mut self.from_timeline_search,
                &mut self.directly_from_timeline_search,
            ),
        }
    }

    fn slots(self, source: SourceMethod) -> (bool, bool) {
        match source {
            SourceMethod::Search => (self.from_search, self.directly_from_search),
            SourceMethod::Stream => (self.from_stream, self.directly_from_stream),
            SourceMethod::ConvoSearch => (self.from_convo_search, self.directly_from_convo_search),
            SourceMethod::QuoteSearch => (self.from_quote_search, self.directly_from_quote_search),
            SourceMethod::TimelineSearch => {
                (self.from_timeline_search, self.directly_from_timeline_search)
            }
        }
    }

    /// Whether the tweet was seen through `source` at all.
    #[must_use]
    pub fn has(self, source: SourceMethod) -> bool {
        self.slots(source).0
    }

    /// Whether the tweet was a primary result of `source`.
    #[must_use]
    pub fn has_direct(self, source: SourceMethod) -> bool {
        self.slots(source).1
    }

    /// Whether the tweet was a primary result of any source.
    #[must_use]
    pub fn is_direct(self) -> bool {
        SourceMethod::ALL.iter().any(|s| self.has_direct(*s))
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        let mut out = self;
        out.absorb(other);
        out
    }

    /// Set every flag that is set in `other`.
    pub fn absorb(&mut self, other: Self) {
        for source in SourceMethod::ALL {
            let (from, directly) = other.slots(source);
            let (mine_from, mine_directly) = self.slots_mut(source);
            *mine_from |= from;
            *mine_directly |= directly;
        }
    }

    /// Whether every flag set in `other` is already set here.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.union(other) == self
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self == Self::default()
    }

    /// Sources with `from_*` set.
    #[must_use]
    pub fn sources(self) -> Vec<SourceMethod> {
        SourceMethod::ALL.into_iter().filter(|s| self.has(*s)).collect()
    }
}

/// How much of a tweet an observation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordShape {
    /// Only seen as something a primary result referenced.
    Partial,
    /// Returned as a primary result.
    Complete,
}

/// Pointer to a related tweet and its author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
}

/// A normalised tweet as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetRecord {
    pub id: String,
    pub shape: RecordShape,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_handle: Option<String>,
    #[serde(default)]
    pub author_followers: Option<u64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub metrics: Option<TweetMetrics>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub replied_to: Option<TweetRef>,
    #[serde(default)]
    pub quoted: Option<TweetRef>,
    #[serde(default)]
    pub retweeted: Option<TweetRef>,
}

impl TweetRecord {
    /// Minimal record, mostly for tests and fakes.
    #[must_use]
    pub fn new(id: impl Into<String>, shape: RecordShape) -> Self {
        Self {
            id: id.into(),
            shape,
            text: String::new(),
            author_id: None,
            author_handle: None,
            author_followers: None,
            created_at: None,
            conversation_id: None,
            lang: None,
            metrics: None,
            hashtags: Vec::new(),
            mentions: Vec::new(),
            urls: Vec::new(),
            replied_to: None,
            quoted: None,
            retweeted: None,
        }
    }

    /// Normalise an API tweet, resolving author details from `lookup`.
    #[must_use]
    pub fn from_api(tweet: &ApiTweet, shape: RecordShape, lookup: &IncludeLookup<'_>) -> Self {
        let author = tweet.author_id.as_deref().and_then(|id| lookup.user(id));
        let entities = tweet.entities.clone().unwrap_or_default();

        let mut record = Self {
            id: tweet.id.clone(),
            shape,
            text: tweet.text.clone(),
            author_id: tweet.author_id.clone(),
            author_handle: author.map(|u| u.username.clone()),
            author_followers: author
                .and_then(|u| u.public_metrics)
                .map(|m| m.followers_count),
            created_at: tweet.created_at,
            conversation_id: tweet.conversation_id.clone(),
            lang: tweet.lang.clone(),
            metrics: tweet.public_metrics,
            hashtags: entities.hashtags.into_iter().map(|h| h.tag).collect(),
            mentions: entities.mentions.into_iter().map(|m| m.username).collect(),
            urls: entities
                .urls
                .into_iter()
                .map(|u| u.expanded_url.unwrap_or(u.url))
                .collect(),
            replied_to: None,
            quoted: None,
            retweeted: None,
        };

        for reference in &tweet.referenced_tweets {
            let target = Some(TweetRef {
                id: reference.id.clone(),
                author_id: lookup.author_of(&reference.id).map(ToString::to_string),
            });
            match reference.kind {
                ReferenceKind::RepliedTo => record.replied_to = target,
                ReferenceKind::Quoted => record.quoted = target,
                ReferenceKind::Retweeted => record.retweeted = target,
            }
        }
        record
    }

    /// Ordering key used to decide whether one observation is fuller than
    /// another: the shape, then populated optional fields plus entities.
    #[must_use]
    pub fn completeness(&self) -> (RecordShape, usize) {
        let optional = [
            self.author_id.is_some(),
            self.author_handle.is_some(),
            self.author_followers.is_some(),
            self.created_at.is_some(),
            self.conversation_id.is_some(),
            self.lang.is_some(),
            self.metrics.is_some(),
            self.replied_to.as_ref().is_some_and(|r| r.author_id.is_some()),
            self.quoted.as_ref().is_some_and(|r| r.author_id.is_some()),
            self.retweeted.as_ref().is_some_and(|r| r.author_id.is_some()),
            !self.text.is_empty(),
        ];
        let entities = self.hashtags.len() + self.mentions.len() + self.urls.len();
        (self.shape, optional.iter().filter(|set| **set).count() + entities)
    }

    /// Whether `self` should replace `existing` in the store.
    #[must_use]
    pub fn is_fuller_than(&self, existing: &TweetRecord) -> bool {
        self.completeness() > existing.completeness()
    }

    #[must_use]
    pub fn is_retweet(&self) -> bool {
        self.retweeted.is_some()
    }

    #[must_use]
    pub fn quote_count(&self) -> u64 {
        self.metrics.map_or(0, |m| m.quote_count)
    }
}

/// One observation flowing into the merge stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub record: TweetRecord,
    pub flags: ProvenanceFlags,
}

/// Index over a response's `includes` block.
pub struct IncludeLookup<'a> {
    users: HashMap<&'a str, &'a ApiUser>,
    tweet_authors: HashMap<&'a str, &'a str>,
}

impl<'a> IncludeLookup<'a> {
    #[must_use]
    pub fn new(primary: &'a [ApiTweet], includes: &'a Includes) -> Self {
        let users = includes.users.iter().map(|u| (u.id.as_str(), u)).collect();
        let tweet_authors = primary
            .iter()
            .chain(&includes.tweets)
            .filter_map(|t| t.author_id.as_deref().map(|a| (t.id.as_str(), a)))
            .collect();
        Self {
            users,
            tweet_authors,
        }
    }

    fn user(&self, id: &str) -> Option<&'a ApiUser> {
        self.users.get(id).copied()
    }

    fn author_of(&self, tweet_id: &str) -> Option<&'a str> {
        self.tweet_authors.get(tweet_id).copied()
    }
}

/// Turn one response into raw records.
///
/// Primary tweets are complete and direct; referenced tweets from `includes`
/// that are not also primary are partial context.
#[must_use]
pub fn extract_records(
    primary: &[ApiTweet],
    includes: &Includes,
    source: SourceMethod,
) -> Vec<RawRecord> {
    let lookup = IncludeLookup::new(primary, includes);
    let primary_ids: HashSet<&str> = primary.iter().map(|t| t.id.as_str()).collect();

    let direct = primary.iter().map(|tweet| RawRecord {
        record: TweetRecord::from_api(tweet, RecordShape::Complete, &lookup),
        flags: ProvenanceFlags::tagged(source, true),
    });
    let context = includes
        .tweets
        .iter()
        .filter(|t| !primary_ids.contains(t.id.as_str()))
        .map(|tweet| RawRecord {
            record: TweetRecord::from_api(tweet, RecordShape::Partial, &lookup),
            flags: ProvenanceFlags::tagged(source, false),
        });

    direct.chain(context).collect()
}
