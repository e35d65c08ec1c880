//! Wiring between the CLI and the reconciliation engine
//!
//! Builds the provider, secret materializer and cancellation token from the
//! loaded configuration, and renders plans and reports.

pub mod display;
pub mod progress;
pub mod prompt;

use crate::config::Config;
use crate::provider::HttpProvider;
use anyhow::{Context, Result};
use declarative::{
    CancelToken, FileVault, ProviderRegistry, ResourceGraph, SecretMaterializer,
};
use std::sync::Arc;

pub use display::{print_summary, show_diagnostics, show_outcomes, show_plan};
pub use progress::ApplyProgress;
pub use prompt::TerminalConfirm;

/// Provider for every resource type, backed by the configured REST endpoint
pub fn build_provider(config: &Config) -> Result<ProviderRegistry> {
    let endpoint = config.provider.endpoint.as_deref().context(
        "No provider endpoint configured (set [provider] endpoint in converge.toml)",
    )?;

    let token = std::env::var(&config.provider.token_env).ok();
    if token.is_none() {
        log::debug!(
            "{} is not set, calling {endpoint} without a token",
            config.provider.token_env
        );
    }

    let http = HttpProvider::new(endpoint, token, config.provider_timeout())?;
    log::info!("Using provider endpoint {endpoint}");
    Ok(ProviderRegistry::new().with_fallback(Arc::new(http)))
}

/// Secret materializer for the manifest's declared secrets
pub fn build_secrets(graph: Option<&ResourceGraph>, config: &Config) -> SecretMaterializer {
    let specs = graph.map(|g| g.secrets().clone()).unwrap_or_default();
    let secrets = SecretMaterializer::new(specs);
    match config.vault_path() {
        Some(path) => {
            log::debug!("Using vault file {}", path.display());
            secrets.with_vault(Arc::new(FileVault::new(path)))
        }
        None => secrets,
    }
}

/// Cancel the run on Ctrl-C; in-flight actions still finish
pub fn cancel_on_interrupt() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if !handler_token.is_cancelled() {
            eprintln!("Interrupted: waiting for in-flight actions to finish...");
        }
        handler_token.cancel();
    }) {
        log::warn!("Could not install Ctrl-C handler: {e}");
    }
    token
}
