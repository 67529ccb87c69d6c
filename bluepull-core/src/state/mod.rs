//! Persisted worker state: per-token usage accounting and job timestamps.

mod manager;
mod token;

pub use manager::{PersistedState, StateError, StateManager, TokenPoolError};
pub use token::{TokenState, TokenStatus};
