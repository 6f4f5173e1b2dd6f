//! Stream rule reconciliation.
//!
//! The remote rule set is fetched once, diffed against the desired set with
//! [`diff_rules`], and the diff applied: deletions first, then additions.
//! Additions are syntax-checked with the endpoint's dry-run before anything
//! is deleted, so a rejected rule never leaves the remote set half-changed.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CollectorError, CollectorResult, RuleRejection};
use crate::twitter::types::{ApiRule, RulesResponse};
use crate::twitter::RulesApi;

/// How far reconciliation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    /// Compute and apply the diff.
    Apply,
    /// Compute and report the diff only.
    DryRun,
    /// Syntax-check the additions, then retract anything created.
    ValidateOnly,
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Apply => "apply",
            Self::DryRun => "dry_run",
            Self::ValidateOnly => "validate_only",
        })
    }
}

/// Changes needed to turn the remote set into the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleDiff {
    /// Remote rules to remove (carry their ids).
    pub delete: Vec<ApiRule>,
    /// Desired rules to register.
    pub add: Vec<ApiRule>,
    /// Desired rules already registered as-is.
    pub unchanged: usize,
}

impl RuleDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.add.is_empty()
    }
}

/// Diff the desired `name -> expression` map against a remote snapshot.
///
/// A remote rule survives only if its tag names a desired rule with the same
/// expression, and only the first such rule per name does.
#[must_use]
pub fn diff_rules(desired: &BTreeMap<String, String>, remote: &[ApiRule]) -> RuleDiff {
    let mut kept: HashSet<&str> = HashSet::new();
    let mut diff = RuleDiff::default();

    for rule in remote {
        let keep = rule.tag.as_deref().is_some_and(|tag| {
            desired.get(tag) == Some(&rule.value) && !kept.contains(tag)
        });
        if keep {
            if let Some(tag) = rule.tag.as_deref() {
                kept.insert(tag);
            }
        } else {
            diff.delete.push(rule.clone());
        }
    }

    for (name, value) in desired {
        if !kept.contains(name.as_str()) {
            diff.add.push(ApiRule {
                id: None,
                value: value.clone(),
                tag: Some(name.clone()),
            });
        }
    }
    diff.unchanged = kept.len();
    diff
}

/// Outcome of a reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct RuleReport {
    pub mode: RuleMode,
    pub diff: RuleDiff,
    /// Whether the remote set was changed.
    pub mutated: bool,
}

/// Reconciles desired stream rules with the remote registry.
pub struct RuleManager {
    api: Arc<dyn RulesApi>,
}

impl RuleManager {
    #[must_use]
    pub fn new(api: Arc<dyn RulesApi>) -> Self {
        Self { api }
    }

    /// Bring the remote rules in line with `desired`.
    pub async fn reconcile(
        &self,
        desired: &BTreeMap<String, String>,
        mode: RuleMode,
    ) -> CollectorResult<RuleReport> {
        let remote = self.api.list_rules().await?;
        let diff = diff_rules(desired, &remote);
        info!(
            %mode,
            remote = remote.len(),
            desired = desired.len(),
            delete = diff.delete.len(),
            add = diff.add.len(),
            "Computed rule diff"
        );

        let mut report = RuleReport {
            mode,
            diff,
            mutated: false,
        };
        if mode == RuleMode::DryRun || report.diff.is_empty() {
            return Ok(report);
        }

        self.validate(&report.diff).await?;
        if mode == RuleMode::ValidateOnly {
            return Ok(report);
        }

        let delete_ids: Vec<String> = report.diff.delete.iter().filter_map(|r| r.id.clone()).collect();
        if !delete_ids.is_empty() {
            self.api.delete_rules(&delete_ids).await?;
            report.mutated = true;
        }
        if !report.diff.add.is_empty() {
            let response = self.api.add_rules(&report.diff.add, false).await?;
            report.mutated = true;
            let rejections = rejections(&report.diff.add, &response, &HashSet::new());
            if !rejections.is_empty() {
                return Err(CollectorError::RuleValidationFailure(rejections));
            }
        }
        info!(
            deleted = delete_ids.len(),
            added = report.diff.add.len(),
            "Applied rule diff"
        );
        Ok(report)
    }

    /// Dry-run the additions; anything the endpoint created anyway is retracted.
    async fn validate(&self, diff: &RuleDiff) -> CollectorResult<()> {
        if diff.add.is_empty() {
            return Ok(());
        }
        let response = self.api.add_rules(&diff.add, true).await?;

        let created: Vec<String> = response.data.iter().filter_map(|r| r.id.clone()).collect();
        if !created.is_empty() {
            warn!(count = created.len(), "Validation created rules, retracting");
            self.api.delete_rules(&created).await?;
        }

        // Values about to be deleted may be reported as duplicates.
        let leaving: HashSet<&str> = diff.delete.iter().map(|r| r.value.as_str()).collect();
        let rejections = rejections(&diff.add, &response, &leaving);
        if rejections.is_empty() {
            Ok(())
        } else {
            Err(CollectorError::RuleValidationFailure(rejections))
        }
    }
}

fn rejections(
    submitted: &[ApiRule],
    response: &RulesResponse,
    leaving: &HashSet<&str>,
) -> Vec<RuleRejection> {
    response
        .errors
        .iter()
        .filter(|e| {
            let duplicate = e.title.as_deref().is_some_and(|t| t.contains("Duplicate"));
            !(duplicate && e.value.as_deref().is_some_and(|v| leaving.contains(v)))
        })
        .map(|e| {
            let value = e.value.clone().unwrap_or_default();
            let name = submitted
                .iter()
                .find(|r| r.value == value)
                .and_then(|r| r.tag.clone())
                .unwrap_or_else(|| "<unknown>".to_string());
            RuleRejection {
                name,
                value,
                message: e.message(),
            }
        })
        .collect()
}
