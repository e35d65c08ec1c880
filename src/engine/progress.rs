//! Progress bar for apply and destroy

use colored::Colorize;
use declarative::{
    ActionKind, ActionOutcome, ApplyResult, Phase, PlannedAction, ProgressCallback, ProviderError,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Reports executor progress on a single bar, printing one line per change
pub struct ApplyProgress {
    pb: ProgressBar,
}

impl ApplyProgress {
    pub fn new(total: usize, quiet: bool) -> Self {
        let pb = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total as u64)
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        Self { pb }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

fn past_tense(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Create => "created",
        ActionKind::Update => "updated",
        ActionKind::Delete => "deleted",
        ActionKind::NoOp => "unchanged",
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_level_start(&self, phase: Phase, level: usize, count: usize) {
        let phase = match phase {
            Phase::Teardown => "teardown",
            Phase::Converge => "converge",
            Phase::Cleanup => "cleanup",
        };
        self.pb
            .set_message(format!("{phase} level {level} ({count} actions)"));
    }

    fn on_action_start(&self, action: &PlannedAction) {
        if action.kind.is_change() {
            self.pb
                .set_message(format!("{} {}", action.kind, action.resource));
        }
    }

    fn on_action_complete(&self, action: &PlannedAction, result: &ApplyResult) {
        self.pb.inc(1);
        let line = match result.outcome {
            ActionOutcome::Succeeded if !action.kind.is_change() => return,
            ActionOutcome::Succeeded => {
                let retries = if result.attempts > 1 {
                    format!(" after {} attempts", result.attempts)
                        .as_str()
                        .dimmed()
                        .to_string()
                } else {
                    String::new()
                };
                format!(
                    "  {} {} {}{}",
                    "✓".green(),
                    past_tense(action.kind),
                    action.resource,
                    retries
                )
            }
            ActionOutcome::Failed => format!(
                "  {} {} {}: {}",
                "✗".red(),
                action.kind,
                action.resource,
                result.error.as_deref().unwrap_or("failed")
            ),
            ActionOutcome::Skipped => {
                let reason = result
                    .error
                    .as_deref()
                    .map(|reason| format!("({reason})"))
                    .unwrap_or_default();
                format!(
                    "  {} skipped {} {}",
                    "-".yellow(),
                    action.resource,
                    reason.as_str().dimmed()
                )
            }
        };
        self.pb.suspend(|| println!("{line}"));
    }

    fn on_retry(
        &self,
        resource: &str,
        attempt: u32,
        max_attempts: u32,
        error: &ProviderError,
        delay: Duration,
    ) {
        self.pb.suspend(|| {
            println!(
                "  {} {resource}: attempt {attempt}/{max_attempts} failed ({error}), retrying in {:.1}s",
                "⚠".yellow(),
                delay.as_secs_f64()
            );
        });
    }
}
