//! `datapuller` — the scheduled data-pull worker.
//!
//! Wires the credential store, persisted state, merged configuration,
//! audit database, API client and relay into an application context, then
//! hands the active integration to the cron scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluepull_core::auth;
use bluepull_core::state::StateManager;
use bluepull_core::Config;

use bluepull_worker::{
    active_integration_service, ApiClient, AppContext, BluelockRelayService, JobScheduler,
    SqliteAuditStore,
};

/// Periodic Bitbucket Cloud data-pull worker.
#[derive(Parser, Debug)]
#[command(name = "datapuller")]
#[command(about = "Pulls repository, PR and commit data and relays it downstream")]
struct Cli {
    /// Environment root holding config/, secrets/, states/ and database.db.
    #[arg(long, default_value = ".")]
    root_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let root_dir = cli.root_dir;

    info!("loading authentication tokens");
    let auth_tokens_path = root_dir.join("secrets").join("auth_tokens.json");
    let (credential_store, _) = auth::load_and_validate(&auth_tokens_path).with_context(|| {
        format!(
            "failed to load authentication tokens from {}",
            auth_tokens_path.display()
        )
    })?;
    let datapull_credentials = credential_store
        .datapull_credentials()
        .context("datapull credentials not found in the credential store")?
        .to_vec();
    info!(
        count = datapull_credentials.len(),
        "authentication tokens loaded"
    );

    info!("initializing state manager");
    let state_path = root_dir.join("states").join("datapuller.json");
    let state_manager = Arc::new(
        StateManager::new(&state_path)
            .with_context(|| format!("failed to initialize state manager at {}", state_path.display()))?,
    );

    info!("syncing token status with latest authentication credentials");
    state_manager
        .sync_token_status_with_latest_auth_credentials(&datapull_credentials)
        .context("failed to sync token status with latest authentication credentials")?;

    info!("loading configuration");
    let config = Arc::new(Config::load_merged(&root_dir).context("failed to load configuration")?);
    let active_service = config
        .active_service
        .context("no active service configured")?;

    info!("initializing audit database");
    let database_path = root_dir.join("database.db");
    let audit_store = Arc::new(
        SqliteAuditStore::open(&database_path)
            .await
            .with_context(|| format!("failed to open audit database at {}", database_path.display()))?,
    );

    let api_client = Arc::new(ApiClient::new(
        state_manager.clone(),
        datapull_credentials.clone(),
        Duration::from_secs(config.defaults.waiting_time_for_rate_limit_in_seconds),
    ));
    let data_relayer = Arc::new(BluelockRelayService::new(
        &config.common.relay_base_url,
        &config.common.org_code,
        active_service,
        config.secrets.dd_api_key.clone(),
    ));

    let context = AppContext::builder()
        .config(config.clone())
        .credentials(datapull_credentials)
        .state_manager(state_manager.clone())
        .audit_store(audit_store)
        .api_client(api_client)
        .data_relayer(data_relayer)
        .build()?;

    info!("initializing integration service");
    let service = active_integration_service(&context)?;
    service
        .validate_env_variables()
        .context("failed to validate environment variables for integration service")?;

    info!("starting job scheduler");
    let scheduler = JobScheduler::new("Datapull", config, state_manager, service);
    scheduler.run().await
}
