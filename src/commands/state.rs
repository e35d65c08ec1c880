use crate::Context;
use crate::cli::StateCommand;
use crate::commands::{self, CommandOutcome};
use crate::engine::TerminalConfirm;
use crate::ui;
use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Utc};
use colored::Colorize;
use declarative::{ConfirmCallback, StateDocument, StateStore};

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<CommandOutcome> {
    match cmd {
        StateCommand::List => list(ctx),
        StateCommand::Show { id } => show(ctx, &id),
        StateCommand::Rm { id, yes } => {
            let mut confirm = TerminalConfirm::new(false);
            rm(ctx, &id, yes, &mut confirm)
        }
    }
}

fn read(ctx: &Context) -> Result<StateDocument> {
    StateDocument::read(&ctx.state_path)
        .with_context(|| format!("Could not read state {}", ctx.state_path.display()))
}

fn list(ctx: &Context) -> Result<CommandOutcome> {
    let document = read(ctx)?;

    ui::header(&format!("State {}", ctx.state_path.display()));
    ui::kv("serial", &document.serial.to_string());
    ui::kv(
        "updated",
        &document.last_updated.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    println!();

    if document.resources.is_empty() {
        ui::dim("No resources recorded");
        return Ok(CommandOutcome::Success);
    }

    println!(
        "  {:<40} {:<36} {}",
        "RESOURCE".dimmed(),
        "PROVIDER ID".dimmed(),
        "APPLIED".dimmed()
    );
    let now = Utc::now();
    for record in document.resources.values() {
        println!(
            "  {:<40} {:<36} {} {}",
            record.resource_id,
            ui::truncate(&record.provider_assigned_id, 36),
            record.last_applied_at.format("%Y-%m-%d %H:%M"),
            format!("({})", age(record.last_applied_at, now)).dimmed()
        );
    }
    println!();
    ui::info(&ui::count(document.resources.len(), "resource"));
    Ok(CommandOutcome::Success)
}

fn age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(at);
    if elapsed.num_days() > 0 {
        format!("{}d ago", elapsed.num_days())
    } else if elapsed.num_hours() > 0 {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed.num_minutes() > 0 {
        format!("{}m ago", elapsed.num_minutes())
    } else {
        "just now".to_string()
    }
}

fn show(ctx: &Context, id: &str) -> Result<CommandOutcome> {
    let document = read(ctx)?;
    let Some(record) = document.resources.get(id) else {
        bail!("No state recorded for '{id}'");
    };
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(CommandOutcome::Success)
}

/// Forget a record; the remote resource is left alone
fn rm(
    ctx: &Context,
    id: &str,
    yes: bool,
    confirm: &mut dyn ConfirmCallback,
) -> Result<CommandOutcome> {
    let store = commands::open_state(ctx)?;
    if store.get(id)?.is_none() {
        store.close()?;
        bail!("No state recorded for '{id}'");
    }

    let prompt = format!("Forget {id}? The remote resource is not deleted.");
    if !yes && !confirm.confirm(&prompt)? {
        ui::info("Nothing removed");
        store.close()?;
        return Ok(CommandOutcome::Success);
    }

    store.remove(id)?;
    store.close()?;
    ui::success(&format!("Removed {id} from state"));
    Ok(CommandOutcome::Success)
}
