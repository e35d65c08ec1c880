//! Execution options and callback traits
//!
//! These traits let the engine report progress and ask for confirmation
//! without depending on a terminal UI.

use crate::error::ProviderError;
use crate::planner::Plan;
use crate::retry::RetryConfig;
use crate::types::{ApplyResult, Phase, PlannedAction};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Progress callback for execution operations
///
/// Called from worker threads, so implementations must be `Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Called when a level starts
    fn on_level_start(&self, phase: Phase, level: usize, count: usize);

    /// Called when an action moves to in-flight
    fn on_action_start(&self, action: &PlannedAction);

    /// Called when an action reaches a terminal outcome
    fn on_action_complete(&self, action: &PlannedAction, result: &ApplyResult);

    /// Called before a provider call is retried
    fn on_retry(
        &self,
        resource: &str,
        attempt: u32,
        max_attempts: u32,
        error: &ProviderError,
        delay: Duration,
    );
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_level_start(&self, _phase: Phase, _level: usize, _count: usize) {}
    fn on_action_start(&self, _action: &PlannedAction) {}
    fn on_action_complete(&self, _action: &PlannedAction, _result: &ApplyResult) {}
    fn on_retry(&self, _: &str, _: u32, _: u32, _: &ProviderError, _: Duration) {}
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback {
    /// Ask the user to confirm an action
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool>;
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(false)
    }
}

/// Ask once before a plan with destructive actions runs.
///
/// Plans without destructive actions are approved without prompting.
pub fn confirm_destructive<C: ConfirmCallback + ?Sized>(
    plan: &Plan,
    confirm: &mut C,
) -> std::io::Result<bool> {
    let destructive: Vec<&str> = plan
        .actions
        .iter()
        .filter(|a| a.destructive)
        .map(|a| a.resource.as_str())
        .collect();
    if destructive.is_empty() {
        return Ok(true);
    }

    let mut ids = destructive;
    ids.dedup();
    confirm.confirm(&format!(
        "{} resource(s) will be deleted or replaced, losing data: {}. Proceed?",
        ids.len(),
        ids.join(", ")
    ))
}

/// Cooperative cancellation flag shared with the executor
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop starting new actions; in-flight actions finish
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for plan execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum actions in flight within one level
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Run destructive actions; when unset they fail unexecuted
    pub allow_destructive: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryConfig::default(),
            allow_destructive: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, ResourceType};

    fn action(resource: &str, destructive: bool) -> PlannedAction {
        PlannedAction {
            resource: resource.to_string(),
            resource_type: ResourceType::FileShare,
            kind: ActionKind::Delete,
            reason: String::new(),
            phase: Phase::Teardown,
            level: 0,
            depends_on: Vec::new(),
            destructive,
            replace: false,
            changed: Vec::new(),
        }
    }

    struct Recording(Vec<String>);

    impl ConfirmCallback for Recording {
        fn confirm(&mut self, prompt: &str) -> std::io::Result<bool> {
            self.0.push(prompt.to_string());
            Ok(false)
        }
    }

    #[test]
    fn test_confirm_skipped_without_destructive_actions() {
        let plan = Plan {
            actions: vec![action("file_share.a", false)],
            diagnostics: Vec::new(),
        };
        let mut recording = Recording(Vec::new());
        assert!(confirm_destructive(&plan, &mut recording).unwrap());
        assert!(recording.0.is_empty());
    }

    #[test]
    fn test_confirm_names_destructive_resources() {
        let plan = Plan {
            actions: vec![action("file_share.pg", true), action("file_share.tmp", false)],
            diagnostics: Vec::new(),
        };
        let mut recording = Recording(Vec::new());
        assert!(!confirm_destructive(&plan, &mut recording).unwrap());
        assert!(recording.0[0].contains("file_share.pg"));
        assert!(!recording.0[0].contains("file_share.tmp"));
        assert!(confirm_destructive(&plan, &mut AutoConfirm).unwrap());
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
