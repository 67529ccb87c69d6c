//! The application context.
//!
//! Every shared dependency is constructed once in `main` and handed to the
//! rest of the worker through this struct. The builder refuses to produce a
//! context with anything missing, so a service constructed from an
//! `AppContext` never has to re-check its collaborators.

use std::sync::Arc;

use anyhow::{Context as _, Result};

use bluepull_core::auth::Credential;
use bluepull_core::state::StateManager;
use bluepull_core::Config;

use crate::audit::SqliteAuditStore;
use crate::bitbucket::ApiClient;
use crate::relay::DataRelayer;

pub struct AppContext {
    pub config: Arc<Config>,
    pub credentials: Vec<Credential>,
    pub state_manager: Arc<StateManager>,
    pub audit_store: Arc<SqliteAuditStore>,
    pub api_client: Arc<ApiClient>,
    pub data_relayer: Arc<dyn DataRelayer>,
}

impl AppContext {
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::default()
    }
}

#[derive(Default)]
pub struct AppContextBuilder {
    config: Option<Arc<Config>>,
    credentials: Option<Vec<Credential>>,
    state_manager: Option<Arc<StateManager>>,
    audit_store: Option<Arc<SqliteAuditStore>>,
    api_client: Option<Arc<ApiClient>>,
    data_relayer: Option<Arc<dyn DataRelayer>>,
}

impl AppContextBuilder {
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn credentials(mut self, credentials: Vec<Credential>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn state_manager(mut self, state_manager: Arc<StateManager>) -> Self {
        self.state_manager = Some(state_manager);
        self
    }

    pub fn audit_store(mut self, audit_store: Arc<SqliteAuditStore>) -> Self {
        self.audit_store = Some(audit_store);
        self
    }

    pub fn api_client(mut self, api_client: Arc<ApiClient>) -> Self {
        self.api_client = Some(api_client);
        self
    }

    pub fn data_relayer(mut self, data_relayer: Arc<dyn DataRelayer>) -> Self {
        self.data_relayer = Some(data_relayer);
        self
    }

    /// Validates that every required dependency was supplied.
    pub fn build(self) -> Result<AppContext> {
        Ok(AppContext {
            config: self.config.context("app context is missing config")?,
            credentials: self
                .credentials
                .context("app context is missing credentials")?,
            state_manager: self
                .state_manager
                .context("app context is missing state manager")?,
            audit_store: self
                .audit_store
                .context("app context is missing audit store")?,
            api_client: self
                .api_client
                .context("app context is missing API client")?,
            data_relayer: self
                .data_relayer
                .context("app context is missing data relayer")?,
        })
    }
}
