//! Twitter API v2 access.
//!
//! Wire types, the trait seams the collectors depend on, and the HTTP client
//! implementing them.

pub mod api;
mod client;
pub mod types;

pub use api::{
    CountRequest, EndpointKind, Granularity, LineStream, RulesApi, SearchApi, SearchRequest,
    StreamSource, TimelineApi, TimelineRequest,
};
pub use client::{split_lines, TwitterClient};
