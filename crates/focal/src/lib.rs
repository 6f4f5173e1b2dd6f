//! Focal-event tweet collection.
//!
//! This crate provides:
//! - Recent and full-archive search with rate-limit aware pagination
//! - Filtered-stream collection with stream rule reconciliation
//! - Conversation, quote and timeline resolution around collected tweets
//! - A merge stage that deduplicates by tweet id and records provenance
//! - Resumable backfills over historical ranges

pub mod backfill;
pub mod config;
pub mod error;
pub mod merge;
pub mod paginator;
pub mod records;
pub mod resolvers;
pub mod rules;
pub mod search;
pub mod store;
pub mod stream;
pub mod summary;
pub mod twitter;
pub mod window;

// Re-export main types
pub use backfill::{BackfillOrchestrator, BackfillOrder, BackfillReport};
pub use config::CollectorConfig;
pub use error::{ApiError, CollectorError, CollectorResult, ConfigError, StoreError};
pub use merge::{MergeOutcome, MergeStage};
pub use paginator::{Cursor, Paginator, PaginatorConfig};
pub use records::{ProvenanceFlags, RawRecord, SourceMethod, TweetRecord};
pub use rules::{RuleManager, RuleMode};
pub use search::{SearchCollector, SearchJob, SearchLimits};
pub use store::{JsonFileStore, MemoryStore, Store};
pub use stream::{StreamCollector, StreamConfig, StreamOutcome};
pub use summary::{RunStatus, RunSummary};
pub use window::{TimeAnchor, TimeWindow};
