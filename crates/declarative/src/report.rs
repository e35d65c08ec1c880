//! Run reports
//!
//! Aggregates per-action results into a run status so partial failures are
//! visible rather than hidden behind a single error.

use crate::types::{ActionKind, ActionOutcome, ApplyResult};
use serde::Serialize;
use std::fmt;

/// Final status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No action failed and nothing was cancelled
    Complete,
    /// At least one action failed
    PartialFailure,
    /// Cancellation stopped pending actions
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Complete => "complete",
            Self::PartialFailure => "partial failure",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Outcome of executing a plan, results in plan order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub status: RunStatus,
    pub results: Vec<ApplyResult>,
}

/// Summary counts for an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ReportSummary {
    /// Get total count
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.unchanged + self.failed + self.skipped
    }
}

impl ApplyReport {
    /// Build a report, deriving the status from the results
    pub fn new(results: Vec<ApplyResult>, cancelled: bool) -> Self {
        let failed = results.iter().any(|r| r.outcome == ActionOutcome::Failed);
        let status = if cancelled {
            RunStatus::Cancelled
        } else if failed {
            RunStatus::PartialFailure
        } else {
            RunStatus::Complete
        };
        Self { status, results }
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for result in &self.results {
            match (result.outcome, result.kind) {
                (ActionOutcome::Failed, _) => summary.failed += 1,
                (ActionOutcome::Skipped, _) => summary.skipped += 1,
                (ActionOutcome::Succeeded, ActionKind::Create) => summary.created += 1,
                (ActionOutcome::Succeeded, ActionKind::Update) => summary.updated += 1,
                (ActionOutcome::Succeeded, ActionKind::Delete) => summary.deleted += 1,
                (ActionOutcome::Succeeded, ActionKind::NoOp) => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }

    /// Results that did not succeed
    pub fn problems(&self) -> impl Iterator<Item = &ApplyResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// Last result for a resource (the create half of a replace)
    pub fn outcome_of(&self, resource_id: &str) -> Option<ActionOutcome> {
        self.results
            .iter()
            .rev()
            .find(|r| r.resource_id == resource_id)
            .map(|r| r.outcome)
    }
}
