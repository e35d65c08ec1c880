//! Plan and report rendering

use crate::ui;
use colored::Colorize;
use declarative::{
    ActionKind, ActionOutcome, ApplyReport, Phase, Plan, PlannedAction, ResourceGraph,
    StateSnapshot,
};
use serde_json::Value;
use similar::{ChangeTag, TextDiff};

/// One line of a property diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub tag: ChangeTag,
    pub text: String,
}

/// Line diff between the recorded and desired value of one property
pub fn property_diff(before: Option<&Value>, after: Option<&Value>) -> Vec<DiffLine> {
    let before = before.map(render_value).unwrap_or_default();
    let after = after.map(render_value).unwrap_or_default();

    TextDiff::from_lines(&before, &after)
        .iter_all_changes()
        .map(|change| DiffLine {
            tag: change.tag(),
            text: change.value().trim_end_matches('\n').to_string(),
        })
        .collect()
}

fn render_value(value: &Value) -> String {
    let mut text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    text.push('\n');
    text
}

fn symbol(action: &PlannedAction) -> String {
    let symbol = if action.replace && action.kind == ActionKind::Create {
        "±"
    } else {
        action.kind.symbol()
    };
    match action.kind {
        ActionKind::Create => symbol.green().to_string(),
        ActionKind::Update => symbol.yellow().to_string(),
        ActionKind::Delete => symbol.red().to_string(),
        ActionKind::NoOp => symbol.dimmed().to_string(),
    }
}

fn phase_title(phase: Phase) -> &'static str {
    match phase {
        Phase::Teardown => "Teardown",
        Phase::Converge => "Converge",
        Phase::Cleanup => "Cleanup",
    }
}

/// Display the plan as a box, with property diffs for updates and replaces.
///
/// `graph` is absent for destroy plans built from state alone.
pub fn show_plan(
    plan: &Plan,
    graph: Option<&ResourceGraph>,
    snapshot: &StateSnapshot,
    verbose: bool,
) {
    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");

    for phase in [Phase::Teardown, Phase::Converge, Phase::Cleanup] {
        let actions: Vec<&PlannedAction> = plan
            .actions
            .iter()
            .filter(|a| a.phase == phase && (verbose || a.kind.is_change()))
            .collect();
        if actions.is_empty() {
            continue;
        }

        println!("│ {}", phase_title(phase).bold());
        for action in actions {
            let marker = if action.destructive {
                format!(" {}", "[data loss]".red().bold())
            } else {
                String::new()
            };
            println!(
                "│   {} {:<40} {}{}",
                symbol(action),
                action.resource,
                action.reason.dimmed(),
                marker
            );

            if matches!(action.kind, ActionKind::Update | ActionKind::Create) {
                show_changes(action, graph, snapshot);
            }
        }
        println!("│");
    }

    let summary = plan.summary();
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red(),
        summary.noop
    );
    if summary.destructive > 0 {
        println!(
            "│ {} {} lose data",
            "⚠".yellow(),
            ui::count(summary.destructive, "action")
        );
    }
    println!("└─────────────────────────────────────────────────────┘");
}

fn show_changes(action: &PlannedAction, graph: Option<&ResourceGraph>, snapshot: &StateSnapshot) {
    let (Some(record), Some(resource)) = (
        snapshot.get(&action.resource),
        graph.and_then(|g| g.get(&action.resource)),
    ) else {
        return;
    };

    for property in &action.changed {
        println!("│       {}:", property.cyan());
        let before = record.last_applied_properties.get(property);
        let after = resource.properties.get(property);
        for line in property_diff(before, after) {
            match line.tag {
                ChangeTag::Delete => println!("│         {}", format!("- {}", line.text).red()),
                ChangeTag::Insert => println!("│         {}", format!("+ {}", line.text).green()),
                ChangeTag::Equal => println!("│         {}", format!("  {}", line.text).dimmed()),
            }
        }
    }
}

/// Print planner diagnostics as warnings
pub fn show_diagnostics(plan: &Plan) {
    for diagnostic in &plan.diagnostics {
        ui::warn(&format!("{}: {}", diagnostic.resource, diagnostic.message));
    }
}

fn outcome_label(outcome: ActionOutcome) -> String {
    match outcome {
        ActionOutcome::Succeeded => "ok".green().to_string(),
        ActionOutcome::Failed => "failed".red().bold().to_string(),
        ActionOutcome::Skipped => "skipped".yellow().to_string(),
    }
}

/// Per-resource outcome table, printed when anything went wrong
pub fn show_outcomes(report: &ApplyReport) {
    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Outcome".bold()
    );
    println!(
        "│ {:<40} {:<8} {:<9} {:>3}  {}",
        "RESOURCE".dimmed(),
        "ACTION".dimmed(),
        "RESULT".dimmed(),
        "TRY".dimmed(),
        "DETAIL".dimmed()
    );
    for result in report
        .results
        .iter()
        .filter(|r| r.kind.is_change() || !r.is_success())
    {
        // Pad before colouring so escape codes do not break alignment
        let label = format!("{:<9}", outcome_label(result.outcome));
        println!(
            "│ {:<40} {:<8} {} {:>3}  {}",
            result.resource_id,
            result.kind.to_string(),
            label,
            result.attempts,
            ui::truncate(result.error.as_deref().unwrap_or(""), 60)
        );
    }
    println!("└─────────────────────────────────────────────────────┘");
}

/// Print the final run summary
pub fn print_summary(report: &ApplyReport) {
    let summary = report.summary();

    println!();
    if report.is_complete() {
        println!("  {} Apply complete", "✓".green().bold());
    } else {
        println!("  {} Apply finished: {}", "⚠".yellow().bold(), report.status);
    }

    if summary.created > 0 {
        println!("    • {} created", ui::count(summary.created, "resource"));
    }
    if summary.updated > 0 {
        println!("    • {} updated", ui::count(summary.updated, "resource"));
    }
    if summary.deleted > 0 {
        println!("    • {} deleted", ui::count(summary.deleted, "resource"));
    }
    if summary.unchanged > 0 {
        println!("    • {} unchanged", ui::count(summary.unchanged, "resource"));
    }
    if summary.skipped > 0 {
        println!("    • {} skipped", ui::count(summary.skipped, "resource"));
    }
    if summary.failed > 0 {
        println!(
            "    • {}",
            format!("{} failed", ui::count(summary.failed, "resource")).red()
        );
    }
}
