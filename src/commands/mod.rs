pub mod apply;
pub mod destroy;
pub mod plan;
pub mod state;
pub mod validate;

use crate::Context;
use crate::engine::{self, ApplyProgress};
use crate::ui;
use anyhow::{Context as _, Result};
use declarative::{
    ApplyReport, CancelToken, ConfirmCallback, DependencyCycleError, ExecuteOptions, Executor,
    FileStateStore, ManifestError, Plan, Provider, ResourceGraph, RunStatus, SecretMaterializer,
    confirm_destructive, manifest, planner,
};
use std::collections::BTreeSet;

/// How a command finished; mapped to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exit 0
    Success,
    /// Some actions failed or the run was cancelled; exit 1
    Incomplete,
    /// Manifest or dependency graph rejected; exit 2
    Invalid,
}

impl CommandOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Incomplete => 1,
            Self::Invalid => 2,
        }
    }
}

impl From<RunStatus> for CommandOutcome {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Complete => Self::Success,
            RunStatus::PartialFailure | RunStatus::Cancelled => Self::Incomplete,
        }
    }
}

/// Whether an error came from manifest or graph validation
pub fn is_validation_error(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<declarative::Error>()
        .is_some_and(declarative::Error::is_validation)
        || error.downcast_ref::<ManifestError>().is_some()
        || error.downcast_ref::<DependencyCycleError>().is_some()
}

/// Load and validate the manifest named on the command line
pub fn load_manifest(ctx: &Context) -> Result<ResourceGraph> {
    log::debug!("Loading manifest {}", ctx.manifest.display());
    let graph = manifest::load_path(&ctx.manifest)
        .with_context(|| format!("Invalid manifest {}", ctx.manifest.display()))?;
    log::info!(
        "Loaded {} from {}",
        ui::count(graph.len(), "resource"),
        ctx.manifest.display()
    );
    Ok(graph)
}

/// Resolve `--target` patterns; none means the whole manifest
pub fn resolve_targets(
    graph: &ResourceGraph,
    patterns: &[String],
) -> Result<Option<BTreeSet<String>>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let targets = planner::resolve_targets(graph, patterns)?;
    log::info!("Targeting {}", ui::count(targets.len(), "resource"));
    Ok(Some(targets))
}

/// Ask before running a plan.
///
/// Destructive plans get the data loss prompt, others a plain one.
/// `yes` skips both.
pub fn approve<C: ConfirmCallback + ?Sized>(plan: &Plan, yes: bool, confirm: &mut C) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if plan.has_destructive() {
        return Ok(confirm_destructive(plan, confirm)?);
    }
    let prompt = format!("Apply {}?", ui::count(plan.summary().changes(), "change"));
    Ok(confirm.confirm(&prompt)?)
}

/// Open the state file, taking its lock for the rest of the command
pub fn open_state(ctx: &Context) -> Result<FileStateStore> {
    FileStateStore::open(&ctx.state_path)
        .with_context(|| format!("Could not open state {}", ctx.state_path.display()))
}

/// Everything a run needs besides the plan
pub struct Session<'a> {
    pub graph: &'a ResourceGraph,
    pub store: &'a FileStateStore,
    pub provider: &'a dyn Provider,
    pub secrets: &'a SecretMaterializer,
}

/// Execute a plan with a progress bar, then print outcomes and the summary
pub fn execute(
    ctx: &Context,
    session: &Session<'_>,
    plan: &Plan,
    jobs: Option<usize>,
    cancel: CancelToken,
) -> Result<ApplyReport> {
    let options = ExecuteOptions {
        concurrency: jobs.unwrap_or(ctx.config.concurrency).max(1),
        retry: ctx.config.retry_config(),
        // Approval already happened in `approve`
        allow_destructive: true,
    };
    log::debug!("Executing with concurrency {}", options.concurrency);

    let progress = ApplyProgress::new(plan.actions.len(), ctx.quiet);
    let result = Executor::new(session.graph, session.store, session.provider, session.secrets)
        .with_options(options)
        .with_progress(&progress)
        .with_cancel(cancel)
        .execute(plan);
    progress.finish();
    let report = result?;

    if !report.is_complete() {
        engine::show_outcomes(&report);
    }
    if !ctx.quiet || !report.is_complete() {
        engine::print_summary(&report);
    }
    Ok(report)
}
