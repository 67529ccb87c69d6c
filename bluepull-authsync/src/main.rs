//! `authsync` — one-shot credential file normalizer.
//!
//! Rewrites `secrets/auth_tokens.json` so every credential carries a
//! `credKey`, backing up the original alongside. Run it before starting the
//! worker; the two must not run concurrently, since the worker snapshots
//! the file under the same advisory lock this tool writes under.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluepull_core::auth;

/// Normalizes the credential file in place.
#[derive(Parser, Debug)]
#[command(name = "authsync")]
#[command(about = "Normalizes secrets/auth_tokens.json, deriving missing credKeys")]
struct Cli {
    /// Environment root holding secrets/auth_tokens.json.
    #[arg(long, default_value = ".")]
    root_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let auth_tokens_path = cli.root_dir.join("secrets").join("auth_tokens.json");

    info!(path = %auth_tokens_path.display(), "normalizing credentials");
    let store = auth::normalize_and_persist(&auth_tokens_path).with_context(|| {
        format!(
            "failed to normalize and persist credentials at {}",
            auth_tokens_path.display()
        )
    })?;

    info!(
        purposes = store.0.len(),
        "credentials normalized and persisted successfully"
    );
    Ok(())
}
