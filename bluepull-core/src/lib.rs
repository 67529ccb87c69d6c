//! Shared building blocks for the bluepull data-pull worker.
//!
//! This crate holds everything the worker and the credential-normalizer CLI
//! have in common: the credential store, the persisted token/job state, the
//! merged configuration, and cron expression evaluation.

pub mod auth;
pub mod config;
pub mod cron;
pub mod fsync;
pub mod state;

pub use auth::{
    load_and_validate, normalize_and_persist, CredStoreError, Credential, CredentialStore,
    DATAPULL_CREDENTIALS_KEY,
};
pub use config::{Config, ServiceKey};
pub use state::{
    PersistedState, StateError, StateManager, TokenPoolError, TokenState, TokenStatus,
};
