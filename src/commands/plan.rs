use crate::Context;
use crate::cli::PlanArgs;
use crate::commands::{self, CommandOutcome};
use crate::engine;
use crate::ui;
use anyhow::{Context as _, Result};
use declarative::{PlanOptions, StateDocument, StateSnapshot, planner};

/// Show what apply would do. Reads state without locking it.
pub fn run(ctx: &Context, args: PlanArgs) -> Result<CommandOutcome> {
    let graph = commands::load_manifest(ctx)?;
    let document = StateDocument::read(&ctx.state_path)
        .with_context(|| format!("Could not read state {}", ctx.state_path.display()))?;
    let snapshot = StateSnapshot::from(document);

    let options = PlanOptions {
        targets: commands::resolve_targets(&graph, &args.target)?,
    };
    let plan = planner::plan_with(&graph, &snapshot, &options)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(CommandOutcome::Success);
    }

    engine::show_diagnostics(&plan);
    if !plan.has_changes() {
        ui::success("No changes. Infrastructure matches the manifest.");
        return Ok(CommandOutcome::Success);
    }

    engine::show_plan(&plan, Some(&graph), &snapshot, ctx.verbose > 0);
    if plan.has_destructive() {
        ui::warn("Destructive actions need --yes or confirmation at apply time");
    }
    Ok(CommandOutcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::context;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
[[resources]]
type = "log_workspace"
name = "main"
[resources.properties]
location = "westeurope"
"#;

    #[test]
    fn test_plan_json_never_writes_state() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, MANIFEST);
        let outcome = run(
            &ctx,
            PlanArgs {
                json: true,
                target: Vec::new(),
            },
        )
        .unwrap();
        assert_eq!(outcome, CommandOutcome::Success);
        assert!(!ctx.state_path.exists());
    }

    #[test]
    fn test_invalid_manifest_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            r#"
[[resources]]
type = "container_app"
name = "a"
depends_on = ["container_app.missing"]
"#,
        );
        let err = run(
            &ctx,
            PlanArgs {
                json: false,
                target: Vec::new(),
            },
        )
        .unwrap_err();
        assert!(commands::is_validation_error(&err));
    }

    #[test]
    fn test_unknown_target_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, MANIFEST);
        let err = run(
            &ctx,
            PlanArgs {
                json: true,
                target: vec!["container_app.nope".into()],
            },
        )
        .unwrap_err();
        assert!(commands::is_validation_error(&err));
    }
}
