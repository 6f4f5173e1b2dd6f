//! Collector configuration.
//!
//! Loaded from a YAML file describing the focal events plus tuning knobs for
//! the API client, paginator, stream and search. Credentials never live in
//! the file; the bearer token is read from the environment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paginator::PaginatorConfig;
use crate::search::SearchLimits;
use crate::stream::StreamConfig;
use crate::twitter::EndpointKind;
use crate::window::{EventSpan, TimeAnchor, TimeWindow};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "focal.yaml";

/// Default environment variable holding the bearer token.
pub const DEFAULT_TOKEN_ENV: &str = "TWITTER_BEARER_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub paginator: PaginatorSettings,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub search: SearchSettings,

    #[serde(default)]
    pub store: StoreSettings,

    /// Focal events, each collected independently
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

/// API client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub bearer_token_env: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// `max_results` for full-archive search (10..=500)
    #[serde(default = "default_archive_page_size")]
    pub archive_page_size: u32,

    /// `max_results` for recent search (10..=100)
    #[serde(default = "default_small_page_size")]
    pub recent_page_size: u32,

    /// `max_results` for timelines (10..=100)
    #[serde(default = "default_small_page_size")]
    pub timeline_page_size: u32,
}

fn default_base_url() -> String {
    "https://api.twitter.com".to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_archive_page_size() -> u32 {
    500
}

fn default_small_page_size() -> u32 {
    100
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            bearer_token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            archive_page_size: default_archive_page_size(),
            recent_page_size: default_small_page_size(),
            timeline_page_size: default_small_page_size(),
        }
    }
}

impl ApiConfig {
    /// Page size for a search endpoint.
    #[must_use]
    pub fn page_size(&self, endpoint: EndpointKind) -> u32 {
        match endpoint {
            EndpointKind::Recent => self.recent_page_size,
            EndpointKind::FullArchive => self.archive_page_size,
        }
    }
}

/// Retry and pacing knobs for paginated calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatorSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Sleep when a rate limit carries no reset time (one quota window)
    #[serde(default = "default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,

    /// Minimum spacing between full-archive requests
    #[serde(default = "default_archive_min_interval_ms")]
    pub archive_min_interval_ms: u64,

    /// Minimum spacing between other requests
    #[serde(default)]
    pub min_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_rate_limit_fallback_secs() -> u64 {
    15 * 60
}

fn default_archive_min_interval_ms() -> u64 {
    1_000
}

impl Default for PaginatorSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_fallback_secs: default_rate_limit_fallback_secs(),
            archive_min_interval_ms: default_archive_min_interval_ms(),
            min_interval_ms: 0,
        }
    }
}

impl PaginatorSettings {
    /// Runtime policy; full-archive calls get the archive pacing.
    #[must_use]
    pub fn policy(&self, endpoint: Option<EndpointKind>) -> PaginatorConfig {
        let interval = match endpoint {
            Some(EndpointKind::FullArchive) => self.archive_min_interval_ms,
            _ => self.min_interval_ms,
        };
        PaginatorConfig {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            rate_limit_fallback: Duration::from_secs(self.rate_limit_fallback_secs),
            min_request_interval: Duration::from_millis(interval),
        }
    }
}

/// Filtered stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Consecutive failed reconnects before giving up
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on reconnect backoff (16 minutes by default)
    #[serde(default = "default_stream_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Treat the connection as dropped after this long without any frame
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// Stop streaming after this many minutes
    #[serde(default)]
    pub duration_minutes: Option<u64>,
}

fn default_max_reconnects() -> u32 {
    10
}

fn default_stream_max_backoff_ms() -> u64 {
    16 * 60 * 1_000
}

fn default_stall_timeout_secs() -> u64 {
    90
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_reconnects: default_max_reconnects(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_stream_max_backoff_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            duration_minutes: None,
        }
    }
}

impl StreamSettings {
    #[must_use]
    pub fn policy(&self) -> StreamConfig {
        StreamConfig {
            max_reconnects: self.max_reconnects,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            duration: self
                .duration_minutes
                .map(|m| Duration::from_secs(m.saturating_mul(60))),
        }
    }
}

/// Search endpoint limits and resolver defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// How far back recent search reaches
    #[serde(default = "default_recent_lookback_days")]
    pub recent_lookback_days: i64,

    /// Split recent-search windows longer than this
    #[serde(default)]
    pub recent_max_window_hours: Option<i64>,

    /// Split full-archive windows longer than this
    #[serde(default)]
    pub archive_max_window_hours: Option<i64>,

    /// Quote-of-quote depth
    #[serde(default = "default_quote_max_depth")]
    pub quote_max_depth: u32,

    /// Size of one backfill window
    #[serde(default = "default_backfill_window_hours")]
    pub backfill_window_hours: i64,

    /// Days before an author's first event tweet that timelines start
    #[serde(default = "default_timeline_days_back")]
    pub timeline_days_back: i64,
}

fn default_recent_lookback_days() -> i64 {
    7
}

fn default_quote_max_depth() -> u32 {
    1
}

fn default_backfill_window_hours() -> i64 {
    24
}

fn default_timeline_days_back() -> i64 {
    14
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            recent_lookback_days: default_recent_lookback_days(),
            recent_max_window_hours: None,
            archive_max_window_hours: None,
            quote_max_depth: default_quote_max_depth(),
            backfill_window_hours: default_backfill_window_hours(),
            timeline_days_back: default_timeline_days_back(),
        }
    }
}

impl SearchSettings {
    #[must_use]
    pub fn limits(&self, endpoint: EndpointKind) -> SearchLimits {
        let max_window = match endpoint {
            EndpointKind::Recent => self.recent_max_window_hours,
            EndpointKind::FullArchive => self.archive_max_window_hours,
        };
        SearchLimits {
            endpoint,
            lookback: match endpoint {
                EndpointKind::Recent => Some(chrono::Duration::days(self.recent_lookback_days)),
                EndpointKind::FullArchive => None,
            },
            max_window: max_window
                .filter(|h| *h > 0)
                .map(chrono::Duration::hours),
        }
    }

    #[must_use]
    pub fn backfill_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.backfill_window_hours.max(1))
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// JSON snapshot holding tweets, provenance and backfill windows
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("focal-data.json")
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// One focal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub name: String,

    #[serde(default)]
    pub queries: Vec<QueryConfig>,

    /// Stream rules, name -> expression
    #[serde(default)]
    pub rules: BTreeMap<String, String>,
}

/// One search query of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub query: String,

    #[serde(default)]
    pub start_time: Option<TimeAnchor>,

    #[serde(default)]
    pub end_time: Option<TimeAnchor>,

    /// Days subtracted from the resolved start
    #[serde(default)]
    pub n_days_back: i64,

    /// Days added to the resolved end
    #[serde(default)]
    pub n_days_after: i64,

    /// Result ceiling for the query
    #[serde(default)]
    pub max_results: Option<u64>,
}

impl QueryConfig {
    /// Resolve the configured bounds; unset bounds stay `None`.
    pub fn resolve_bounds(
        &self,
        span: Option<EventSpan>,
        now: DateTime<Utc>,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), ConfigError> {
        let start = self
            .start_time
            .map(|a| a.resolve(span, now))
            .transpose()?
            .map(|t| t - chrono::Duration::days(self.n_days_back));
        let end = self
            .end_time
            .map(|a| a.resolve(span, now))
            .transpose()?
            .map(|t| t + chrono::Duration::days(self.n_days_after));
        Ok((start, end))
    }
}

impl CollectorConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content)?;
        tracing::debug!(path = %path.display(), events = config.events.len(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate YAML.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_page_size("archive_page_size", self.api.archive_page_size, 500)?;
        check_page_size("recent_page_size", self.api.recent_page_size, 100)?;
        check_page_size("timeline_page_size", self.api.timeline_page_size, 100)?;

        let mut names = HashSet::new();
        let mut rules: HashMap<&str, &str> = HashMap::new();
        for event in &self.events {
            if event.name.trim().is_empty() {
                return Err(ConfigError::Invalid("event name must not be empty".into()));
            }
            if !names.insert(event.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate event name '{}'",
                    event.name
                )));
            }
            for query in &event.queries {
                if query.query.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "event '{}' has an empty query",
                        event.name
                    )));
                }
                if let (Some(TimeAnchor::At(start)), Some(TimeAnchor::At(end))) =
                    (query.start_time, query.end_time)
                {
                    TimeWindow::new(start, end).map_err(|_| {
                        ConfigError::Invalid(format!(
                            "event '{}' query '{}': start_time must be before end_time",
                            event.name, query.query
                        ))
                    })?;
                }
                if query.max_results == Some(0) {
                    return Err(ConfigError::Invalid(format!(
                        "event '{}' query '{}': max_results must be positive",
                        event.name, query.query
                    )));
                }
            }
            for (name, value) in &event.rules {
                if value.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "event '{}' rule '{name}' has an empty expression",
                        event.name
                    )));
                }
                if rules.insert(name, value).is_some_and(|prev| prev != value) {
                    return Err(ConfigError::Invalid(format!(
                        "rule '{name}' is defined with different expressions"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up an event by name.
    pub fn event(&self, name: &str) -> Result<&EventConfig, ConfigError> {
        self.events
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ConfigError::UnknownEvent(name.to_string()))
    }

    /// Stream rules of every event; all events share one filtered stream.
    #[must_use]
    pub fn stream_rules(&self) -> BTreeMap<String, String> {
        self.events
            .iter()
            .flat_map(|e| e.rules.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Bearer token from the configured environment variable.
    pub fn bearer_token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api.bearer_token_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(self.api.bearer_token_env.clone()))
    }
}

fn check_page_size(field: &str, value: u32, max: u32) -> Result<(), ConfigError> {
    if (10..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be between 10 and {max}, got {value}"
        )))
    }
}
