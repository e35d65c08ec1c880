use crate::Context;
use crate::cli::ApplyArgs;
use crate::commands::{self, CommandOutcome, Session};
use crate::engine::{self, TerminalConfirm};
use crate::ui;
use anyhow::Result;
use declarative::{
    CancelToken, ConfirmCallback, PlanOptions, Provider, StateStore, planner,
};

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<CommandOutcome> {
    let provider = engine::build_provider(&ctx.config)?;
    let cancel = engine::cancel_on_interrupt();
    apply_with(ctx, &args, &provider, &mut TerminalConfirm::new(false), cancel)
}

/// Plan against locked state, confirm, then execute
pub fn apply_with(
    ctx: &Context,
    args: &ApplyArgs,
    provider: &dyn Provider,
    confirm: &mut dyn ConfirmCallback,
    cancel: CancelToken,
) -> Result<CommandOutcome> {
    let graph = commands::load_manifest(ctx)?;
    let store = commands::open_state(ctx)?;
    let snapshot = store.snapshot()?;

    let options = PlanOptions {
        targets: commands::resolve_targets(&graph, &args.target)?,
    };
    let plan = planner::plan_with(&graph, &snapshot, &options)?;
    engine::show_diagnostics(&plan);

    if !plan.has_changes() {
        ui::success("No changes. Infrastructure matches the manifest.");
        store.close()?;
        return Ok(CommandOutcome::Success);
    }

    if !ctx.quiet {
        engine::show_plan(&plan, Some(&graph), &snapshot, ctx.verbose > 0);
    }
    if !commands::approve(&plan, args.yes, confirm)? {
        ui::info("Apply cancelled, nothing was changed");
        store.close()?;
        return Ok(CommandOutcome::Success);
    }

    let secrets = engine::build_secrets(Some(&graph), &ctx.config);
    let session = Session {
        graph: &graph,
        store: &store,
        provider,
        secrets: &secrets,
    };
    let report = commands::execute(ctx, &session, &plan, args.jobs, cancel)?;
    store.close()?;
    Ok(report.status.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{PLATFORM, context};
    use declarative::provider::memory::MemoryProvider;
    use declarative::{AutoConfirm, AutoDecline, ProviderError, StateDocument};
    use tempfile::TempDir;

    fn args() -> ApplyArgs {
        ApplyArgs {
            yes: false,
            jobs: Some(2),
            target: Vec::new(),
        }
    }

    #[test]
    fn test_apply_then_noop() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, PLATFORM);
        let provider = MemoryProvider::new();

        let outcome =
            apply_with(&ctx, &args(), &provider, &mut AutoConfirm, CancelToken::new()).unwrap();
        assert_eq!(outcome, CommandOutcome::Success);
        assert_eq!(provider.call_count(), 3);

        let document = StateDocument::read(&ctx.state_path).unwrap();
        assert_eq!(document.resources.len(), 3);
        assert!(!declarative::state::lock_path_for(&ctx.state_path).exists());

        // Nothing to do the second time; the prompt would decline if asked
        let outcome =
            apply_with(&ctx, &args(), &provider, &mut AutoDecline, CancelToken::new()).unwrap();
        assert_eq!(outcome, CommandOutcome::Success);
        assert_eq!(provider.call_count(), 3);
    }

    #[test]
    fn test_declined_prompt_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, PLATFORM);
        let provider = MemoryProvider::new();

        let outcome =
            apply_with(&ctx, &args(), &provider, &mut AutoDecline, CancelToken::new()).unwrap();
        assert_eq!(outcome, CommandOutcome::Success);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_partial_failure_exit() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, PLATFORM);
        let provider = MemoryProvider::new();
        provider.fail_always(
            "container_app.db",
            ProviderError::Permanent("quota exceeded".into()),
        );

        let mut apply_args = args();
        apply_args.yes = true;
        let outcome =
            apply_with(&ctx, &apply_args, &provider, &mut AutoDecline, CancelToken::new())
                .unwrap();
        assert_eq!(outcome, CommandOutcome::Incomplete);

        let document = StateDocument::read(&ctx.state_path).unwrap();
        assert!(document.resources.contains_key("container_app.cache"));
        assert!(!document.resources.contains_key("container_app.dns-server"));
    }

    #[test]
    fn test_cancelled_run_exits_incomplete() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, PLATFORM);
        let provider = MemoryProvider::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = apply_with(&ctx, &args(), &provider, &mut AutoConfirm, cancel).unwrap();
        assert_eq!(outcome, CommandOutcome::Incomplete);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_target_limits_apply() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, PLATFORM);
        let provider = MemoryProvider::new();

        let mut apply_args = args();
        apply_args.target = vec!["container_app.dns-server".into()];
        apply_with(&ctx, &apply_args, &provider, &mut AutoConfirm, CancelToken::new()).unwrap();

        let document = StateDocument::read(&ctx.state_path).unwrap();
        let ids: Vec<&str> = document.resources.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["container_app.db", "container_app.dns-server"]);
    }
}
