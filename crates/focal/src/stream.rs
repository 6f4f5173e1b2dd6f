//! Filtered stream collector.
//!
//! One task owns one connection and walks an explicit state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> Reconnecting -> Connecting ...
//!                                   |-> Expired    (duration elapsed)
//!                                   |-> Cancelled  (stop signal)
//!                      (too many failed reconnects) -> Failed
//! ```
//!
//! Each frame becomes the matched tweet (direct) plus its referenced tweets
//! (context), merged as `from_stream`. The connection carries the rules of
//! every event, so a collector given its event's rule tags drops frames
//! matched only by other events' rules.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, CollectorError, CollectorResult};
use crate::merge::{MergeOutcome, MergeStage};
use crate::records::{extract_records, SourceMethod};
use crate::twitter::types::{ApiErrorObject, StreamMessage};
use crate::twitter::{LineStream, StreamSource};

/// Merged records between store flushes.
const FLUSH_EVERY: u64 = 100;

/// Reconnect and lifetime policy.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Consecutive failed connections before giving up.
    pub max_reconnects: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Silence (no data, no heartbeat) that counts as a dropped connection.
    pub stall_timeout: Duration,
    /// Local expiry timer.
    pub duration: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16 * 60),
            stall_timeout: Duration::from_secs(90),
            duration: None,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Expired,
    Cancelled,
    Failed,
}

impl StreamState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::{
            Cancelled, Connecting, Disconnected, Expired, Failed, Reconnecting, Streaming,
        };
        match (self, next) {
            (from, Cancelled | Expired) => !from.is_terminal(),
            (Disconnected | Reconnecting, Connecting)
            | (Connecting, Streaming | Reconnecting)
            | (Streaming, Reconnecting)
            | (Reconnecting, Failed) => true,
            _ => false,
        }
    }
}

/// How a stream run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Duration elapsed.
    Expired,
    /// Stop signal observed.
    Cancelled,
}

/// Tallies of one stream run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamReport {
    pub outcome: Option<StreamOutcome>,
    /// Tweet frames received.
    pub messages: u64,
    /// Records merged (matched plus referenced).
    pub records: u64,
    /// Records that created a new row.
    pub inserted: u64,
    pub heartbeats: u64,
    pub error_frames: u64,
    /// Frames matched only by rules of other events.
    pub foreign_frames: u64,
    pub reconnects: u32,
}

/// Why the streaming phase stopped.
enum Exit {
    Cancelled,
    Expired,
    Dropped(String),
}

/// Owns the filtered stream connection for one event.
pub struct StreamCollector {
    source: Arc<dyn StreamSource>,
    merge: Arc<MergeStage>,
    config: StreamConfig,
    cancel: CancellationToken,
    rule_tags: Option<BTreeSet<String>>,
    state: StreamState,
    report: StreamReport,
}

impl StreamCollector {
    #[must_use]
    pub fn new(
        source: Arc<dyn StreamSource>,
        merge: Arc<MergeStage>,
        config: StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            merge,
            config,
            cancel,
            rule_tags: None,
            state: StreamState::Disconnected,
            report: StreamReport::default(),
        }
    }

    /// Keep only frames matched by one of `tags`.
    #[must_use]
    pub fn with_rule_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rule_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn report(&self) -> &StreamReport {
        &self.report
    }

    fn transition(&mut self, next: StreamState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid stream transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "Stream state");
        self.state = next;
    }

    /// Run until expiry, cancellation or reconnect exhaustion.
    pub async fn run(&mut self) -> CollectorResult<StreamReport> {
        let deadline = self.config.duration.map(|d| Instant::now() + d);
        let mut backoff = self.config.initial_backoff;
        let mut failures: u32 = 0;

        info!(event = %self.merge.event(), duration = ?self.config.duration, "Starting stream");
        self.transition(StreamState::Connecting);

        let outcome = loop {
            let connected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break StreamOutcome::Cancelled,
                () = until(deadline) => break StreamOutcome::Expired,
                result = self.source.connect() => result,
            };

            let (reason, hint) = match connected {
                Ok(lines) => {
                    self.transition(StreamState::Streaming);
                    info!("Connected to filtered stream");
                    let before = self.report.messages;
                    match self.consume(lines, deadline).await? {
                        Exit::Cancelled => break StreamOutcome::Cancelled,
                        Exit::Expired => break StreamOutcome::Expired,
                        Exit::Dropped(reason) => {
                            if self.report.messages > before {
                                failures = 0;
                                backoff = self.config.initial_backoff;
                            }
                            (reason, None)
                        }
                    }
                }
                Err(e) => {
                    let hint = e.retry_after();
                    (e.to_string(), hint)
                }
            };

            failures += 1;
            self.transition(StreamState::Reconnecting);
            self.report.reconnects += 1;
            if failures > self.config.max_reconnects {
                self.transition(StreamState::Failed);
                self.merge.store().flush().await?;
                error!(attempts = failures, error = %reason, "Stream reconnect exhausted");
                return Err(CollectorError::StreamReconnectExhausted {
                    attempts: failures,
                    last_error: reason,
                });
            }

            let wait = hint.map_or(backoff, |h| h.max(backoff));
            warn!(attempt = failures, delay_ms = wait.as_millis(), error = %reason, "Stream dropped, reconnecting");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break StreamOutcome::Cancelled,
                () = until(deadline) => break StreamOutcome::Expired,
                () = tokio::time::sleep(wait) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
            self.transition(StreamState::Connecting);
        };

        self.transition(match outcome {
            StreamOutcome::Cancelled => StreamState::Cancelled,
            StreamOutcome::Expired => StreamState::Expired,
        });
        self.merge.store().flush().await?;
        self.report.outcome = Some(outcome);

        info!(
            ?outcome,
            messages = self.report.messages,
            records = self.report.records,
            inserted = self.report.inserted,
            reconnects = self.report.reconnects,
            "Stream finished"
        );
        Ok(self.report.clone())
    }

    async fn consume(
        &mut self,
        mut lines: LineStream,
        deadline: Option<Instant>,
    ) -> CollectorResult<Exit> {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(Exit::Cancelled),
                () = until(deadline) => return Ok(Exit::Expired),
                next = tokio::time::timeout(self.config.stall_timeout, lines.next()) => next,
            };

            match next {
                Err(_) => return Ok(Exit::Dropped("stream stalled".to_string())),
                Ok(None) => return Ok(Exit::Dropped("connection closed by server".to_string())),
                Ok(Some(Err(e))) => return Ok(Exit::Dropped(e.to_string())),
                Ok(Some(Ok(line))) => self.handle_line(&line).await?,
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> CollectorResult<()> {
        if line.is_empty() {
            self.report.heartbeats += 1;
            return Ok(());
        }

        let message: StreamMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(parse_error) => {
                self.report.error_frames += 1;
                match error_frame(line) {
                    Some(message) => warn!(error = %message, "Stream error frame"),
                    None => warn!(error = %parse_error, "Malformed stream frame"),
                }
                return Ok(());
            }
        };

        self.report.messages += 1;
        if !self.is_ours(&message) {
            self.report.foreign_frames += 1;
            debug!(id = %message.data.id, "Skipping frame matched by another event's rules");
            return Ok(());
        }
        let records = extract_records(
            std::slice::from_ref(&message.data),
            &message.includes,
            SourceMethod::Stream,
        );
        for raw in records {
            self.report.records += 1;
            if self.merge.merge(raw).await? == MergeOutcome::Inserted {
                self.report.inserted += 1;
            }
        }
        if self.report.messages % FLUSH_EVERY == 0 {
            self.merge.store().flush().await?;
        }
        Ok(())
    }

    fn is_ours(&self, message: &StreamMessage) -> bool {
        self.rule_tags.as_ref().is_none_or(|tags| {
            message
                .matching_rules
                .iter()
                .filter_map(|rule| rule.tag.as_deref())
                .any(|tag| tags.contains(tag))
        })
    }
}

/// Sleep until `deadline`, or forever without one.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Message of an `{"errors": [...]}` frame.
fn error_frame(line: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct ErrorFrame {
        errors: Vec<ApiErrorObject>,
    }
    let frame: ErrorFrame = serde_json::from_str(line).ok()?;
    let messages: Vec<String> = frame.errors.iter().map(ApiErrorObject::message).collect();
    Some(if messages.is_empty() {
        ApiError::Stream("empty error frame".into()).to_string()
    } else {
        messages.join("; ")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use StreamState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(Streaming.can_transition_to(Cancelled));
        assert!(Connecting.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Connecting));
        assert!(!Cancelled.can_transition_to(Expired));
        assert!(!Streaming.can_transition_to(Failed));
    }

    #[test]
    fn test_error_frame() {
        let line = r#"{"errors":[{"title":"ConnectionException","detail":"too many connections"}]}"#;
        assert_eq!(error_frame(line).as_deref(), Some("too many connections"));
        assert!(error_frame(r#"{"data":{"id":"1"}}"#).is_none());
    }
}
