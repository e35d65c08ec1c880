mod cli;
mod commands;
mod config;
mod engine;
mod paths;
mod provider;
mod ui;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use commands::CommandOutcome;
use config::Config;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub manifest: PathBuf,
    pub state_path: PathBuf,
    pub config: Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            let outcome = if commands::is_validation_error(&e) {
                CommandOutcome::Invalid
            } else {
                CommandOutcome::Incomplete
            };
            ExitCode::from(outcome.exit_code())
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<CommandOutcome> {
    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "converge", &mut io::stdout());
        return Ok(CommandOutcome::Success);
    }

    let config = Config::load(cli.config.as_deref())?;
    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        state_path: config.state_path(cli.state.as_deref())?,
        manifest: cli.manifest,
        config,
    };
    log::debug!("State file: {}", ctx.state_path.display());

    match cli.command {
        Command::Plan(args) => commands::plan::run(&ctx, args),
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Destroy(args) => commands::destroy::run(&ctx, args),
        Command::Validate => commands::validate::run(&ctx),
        Command::State(cmd) => commands::state::run(&ctx, cmd),
        Command::Completions { .. } => Ok(CommandOutcome::Success),
    }
}
