//! Machine-readable run summary.
//!
//! Every command prints one JSON document to stdout when it finishes, with
//! per-source merge counts, backfill window state, errors and the exit code.

use std::collections::BTreeMap;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CollectorError;
use crate::merge::SourceCounts;
use crate::records::SourceMethod;
use crate::window::TimeWindow;

/// How a run ended, as seen by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Success,
    /// Something was left for a later run to resume.
    Partial,
    Fatal,
}

impl RunStatus {
    /// Process exit code: 0 success, 1 fatal, 2 partial.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Fatal => 1,
            Self::Partial => 2,
        }
    }
}

/// Backfill window state after the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowSummary {
    pub completed: Vec<TimeWindow>,
    pub pending: Vec<TimeWindow>,
}

/// JSON document describing one command run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub exit_code: u8,
    /// Merge tallies keyed by source name.
    pub sources: BTreeMap<String, SourceCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows: Option<WindowSummary>,
    pub errors: Vec<String>,
    /// Command-specific reports.
    pub details: Vec<serde_json::Value>,
}

impl RunSummary {
    #[must_use]
    pub fn new(command: impl Into<String>, event: Option<&str>) -> Self {
        Self {
            command: command.into(),
            event: event.map(str::to_string),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Success,
            exit_code: 0,
            sources: BTreeMap::new(),
            windows: None,
            errors: Vec::new(),
            details: Vec::new(),
        }
    }

    fn escalate(&mut self, status: RunStatus) {
        self.status = self.status.max(status);
        self.exit_code = self.status.code();
    }

    /// Record merge tallies.
    pub fn set_counts(&mut self, counts: &BTreeMap<SourceMethod, SourceCounts>) {
        for (source, tally) in counts {
            self.sources
                .entry(source.as_str().to_string())
                .or_default()
                .add(tally);
        }
    }

    /// Attach a command-specific report.
    pub fn push_detail<T: Serialize>(&mut self, report: &T) {
        match serde_json::to_value(report) {
            Ok(value) => self.details.push(value),
            Err(e) => self.errors.push(format!("unserializable report: {e}")),
        }
    }

    /// Record backfill window state; pending windows make the run partial.
    pub fn set_windows(&mut self, completed: Vec<TimeWindow>, pending: Vec<TimeWindow>) {
        if !pending.is_empty() {
            self.escalate(RunStatus::Partial);
        }
        self.windows = Some(WindowSummary { completed, pending });
    }

    /// Mark that work was left for a later run.
    pub fn mark_partial(&mut self, reason: impl Into<String>) {
        self.errors.push(reason.into());
        self.escalate(RunStatus::Partial);
    }

    /// Record a failure; resumable failures make the run partial, others fatal.
    pub fn record_error(&mut self, error: &CollectorError) {
        self.errors.push(error.to_string());
        self.escalate(if error.is_resumable() {
            RunStatus::Partial
        } else {
            RunStatus::Fatal
        });
    }

    /// Record a failure outside the collectors (config, credentials).
    pub fn record_fatal(&mut self, error: &anyhow::Error) {
        self.errors.push(format!("{error:#}"));
        self.escalate(RunStatus::Fatal);
    }

    /// Stamp the finish time and return the exit code.
    pub fn finish(&mut self) -> ExitCode {
        self.finished_at = Some(Utc::now());
        ExitCode::from(self.exit_code)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
