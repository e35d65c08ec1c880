//! # Declarative
//!
//! A reconciliation engine for declarative infrastructure.
//!
//! The engine takes a manifest of desired resources, orders them by their
//! dependencies, diffs them against the last recorded live state and drives a
//! remote provider until the two match.
//!
//! ## Core Concepts
//!
//! - **Manifest**: typed resources with properties, `depends_on` and parents
//! - **ResourceGraph**: resources plus explicit, implicit and parent edges
//! - **Plan**: ordered Create/Update/Delete/NoOp actions in teardown, converge
//!   and cleanup phases
//! - **Executor**: applies a plan level by level with bounded parallelism,
//!   retrying transient provider errors
//! - **StateStore**: what was last applied, never containing secret values
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     Executor, ExecuteOptions, FileStateStore, SecretMaterializer, StateStore,
//!     manifest, planner,
//! };
//!
//! let graph = manifest::load_path("manifest.toml".as_ref())?;
//! let state = FileStateStore::open("state.json")?;
//! let plan = planner::plan(&graph, &state.snapshot()?)?;
//!
//! let secrets = SecretMaterializer::new(graph.secrets().clone());
//! let report = Executor::new(&graph, &state, &provider, &secrets)
//!     .with_options(ExecuteOptions::default())
//!     .execute(&plan)?;
//! println!("{}", report.status);
//! ```
//!
//! ## Provider Traits
//!
//! - [`Provider`]: performs create/update/delete against the remote platform
//! - [`StateStore`]: persists live state records
//! - [`SecretBackend`]: external secret source
//! - [`ProgressCallback`]: receives progress updates
//! - [`ConfirmCallback`]: handles user confirmations

pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod manifest;
pub mod planner;
pub mod provider;
pub mod reference;
pub mod report;
pub mod retry;
pub mod secrets;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use context::{
    AutoConfirm, AutoDecline, CancelToken, ConfirmCallback, ExecuteOptions, NoProgress,
    ProgressCallback, confirm_destructive,
};
pub use error::{
    DependencyCycleError, Error, ManifestError, ProviderError, Result, SecretResolutionError,
    StateStoreError,
};
pub use executor::Executor;
pub use graph::ResourceGraph;
pub use planner::{Diagnostic, Plan, PlanOptions, PlanSummary};
pub use provider::{Provider, ProviderOutput, ProviderRegistry, ResolvedResource};
pub use report::{ApplyReport, ReportSummary, RunStatus};
pub use retry::RetryConfig;
pub use secrets::{FileVault, SecretBackend, SecretMaterializer, SecretSpec, SecretValue};
pub use state::{
    FileStateStore, LiveStateRecord, MemoryStateStore, StateDocument, StateSnapshot, StateStore,
};
pub use types::{
    ActionKind, ActionOutcome, ApplyResult, Phase, PlannedAction, Properties, Resource,
    ResourceType,
};
