use crate::Context;
use crate::cli::DestroyArgs;
use crate::commands::{self, CommandOutcome, Session};
use crate::engine::{self, TerminalConfirm};
use crate::ui;
use anyhow::Result;
use declarative::{
    CancelToken, ConfirmCallback, Provider, ResourceGraph, StateStore, planner,
};

pub fn run(ctx: &Context, args: DestroyArgs) -> Result<CommandOutcome> {
    let provider = engine::build_provider(&ctx.config)?;
    let cancel = engine::cancel_on_interrupt();
    destroy_with(ctx, &args, &provider, &mut TerminalConfirm::new(false), cancel)
}

/// Delete everything recorded in state, dependents first.
///
/// The manifest is optional here; when present its edges refine the order.
pub fn destroy_with(
    ctx: &Context,
    args: &DestroyArgs,
    provider: &dyn Provider,
    confirm: &mut dyn ConfirmCallback,
    cancel: CancelToken,
) -> Result<CommandOutcome> {
    let graph = if ctx.manifest.exists() {
        Some(commands::load_manifest(ctx)?)
    } else {
        log::info!(
            "Manifest {} not found, ordering by recorded dependencies only",
            ctx.manifest.display()
        );
        None
    };

    let store = commands::open_state(ctx)?;
    let snapshot = store.snapshot()?;
    if snapshot.is_empty() {
        ui::success("State is empty, nothing to destroy");
        store.close()?;
        return Ok(CommandOutcome::Success);
    }

    let plan = planner::plan_destroy(&snapshot, graph.as_ref())?;
    engine::show_diagnostics(&plan);
    if !ctx.quiet {
        engine::show_plan(&plan, graph.as_ref(), &snapshot, false);
    }

    let prompt = format!(
        "Destroy {}? This deletes them remotely.",
        ui::count(snapshot.len(), "resource")
    );
    if !args.yes && !confirm.confirm(&prompt)? {
        ui::info("Destroy cancelled, nothing was changed");
        store.close()?;
        return Ok(CommandOutcome::Success);
    }

    let empty = ResourceGraph::default();
    let secrets = engine::build_secrets(graph.as_ref(), &ctx.config);
    let session = Session {
        graph: graph.as_ref().unwrap_or(&empty),
        store: &store,
        provider,
        secrets: &secrets,
    };
    let report = commands::execute(ctx, &session, &plan, args.jobs, cancel)?;
    store.close()?;
    Ok(report.status.into())
}
