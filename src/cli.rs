use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Reconcile a container platform with a declarative manifest", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Manifest describing the desired infrastructure
    #[arg(
        short = 'f',
        long,
        global = true,
        env = "CONVERGE_MANIFEST",
        default_value = "manifest.toml"
    )]
    pub manifest: PathBuf,

    /// State file (overrides the config file)
    #[arg(long, global = true, env = "CONVERGE_STATE")]
    pub state: Option<PathBuf>,

    /// Config file (default: <config dir>/converge.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change, without touching anything
    Plan(PlanArgs),

    /// Create, update and delete resources until the platform matches the manifest
    Apply(ApplyArgs),

    /// Delete every resource recorded in state
    Destroy(DestroyArgs),

    /// Load the manifest and print its dependency levels
    Validate,

    /// Inspect or edit recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan / Apply / Destroy
// ============================================================================

#[derive(Parser)]
pub struct PlanArgs {
    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Only plan these resources and their dependencies (type or type.name)
    #[arg(short, long)]
    pub target: Vec<String>,
}

#[derive(Parser)]
pub struct ApplyArgs {
    /// Skip confirmation, including for destructive actions
    #[arg(short, long)]
    pub yes: bool,

    /// Maximum provider calls in flight (overrides the config file)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Only apply these resources and their dependencies (type or type.name)
    #[arg(short, long)]
    pub target: Vec<String>,
}

#[derive(Parser)]
pub struct DestroyArgs {
    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Maximum provider calls in flight (overrides the config file)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one recorded resource
    Show {
        /// Resource id (type.name)
        id: String,
    },

    /// Forget a resource without deleting it remotely
    Rm {
        /// Resource id (type.name)
        id: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}
