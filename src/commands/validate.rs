use crate::Context;
use crate::commands::{self, CommandOutcome};
use crate::ui;
use anyhow::Result;
use colored::Colorize;

/// Load the manifest, resolve the graph and print its levels
pub fn run(ctx: &Context) -> Result<CommandOutcome> {
    let graph = commands::load_manifest(ctx)?;
    let levels = graph.levels()?;

    if !ctx.quiet {
        ui::header(&format!("Manifest {}", ctx.manifest.display()));
        for (index, level) in levels.iter().enumerate() {
            println!("{} {}", format!("Level {index}:").cyan().bold(), level.join(", "));
        }

        if !graph.secrets().is_empty() {
            ui::section("Secrets");
            for (name, spec) in graph.secrets() {
                ui::kv(name, &spec.describe());
            }
        }
        println!();
    }

    ui::success(&format!(
        "{} in {}",
        ui::count(graph.len(), "resource"),
        ui::count(levels.len(), "level")
    ));
    Ok(CommandOutcome::Success)
}
