//! The persisted state manager.
//!
//! A single mutex guards the whole [`PersistedState`]; every public mutating
//! operation holds it for the full read-modify-write-persist cycle, so the
//! file on disk always reflects the last operation that returned `Ok`.
//! Contention is low: the API client's request loop is serial, and the only
//! other caller is the shutdown handler's final flush.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Credential;
use crate::fsync::atomic_write_file;
use crate::state::token::{TokenState, TokenStatus};

/// Errors from loading or persisting the state file.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("state file JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token not found: {0}")]
    TokenNotFound(String),
}

/// Outcome of token selection when no token could be returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenPoolError {
    /// The pool has no tokens at all. Critical.
    #[error("token pool is empty")]
    EmptyTokenPool,

    /// Every token is unauthorized. Critical.
    #[error("all tokens are ignored")]
    AllTokensIgnored,

    /// Every non-ignored token is exhausted; a pool-wide reset will recover.
    #[error("all tokens are exhausted")]
    AllTokensExhausted,

    /// No active token and the exhausted/ignored classification did not
    /// account for the pool. Invariant breach; critical.
    #[error("no active token found (expected either all-exhausted or all-ignored)")]
    ActiveTokenNotFound,
}

impl TokenPoolError {
    /// Critical errors abort the pull cycle; `AllTokensExhausted` is the one
    /// recoverable case (the caller sleeps and resets the pool).
    pub fn is_critical(&self) -> bool {
        !matches!(self, TokenPoolError::AllTokensExhausted)
    }
}

/// The full document serialized to the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub last_job_execution_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_job_execution_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ongoing_job_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooldown_completed_at: Option<DateTime<Utc>>,
    /// Keyed by credKey. A `BTreeMap` keeps iteration (and therefore
    /// least-usage tie-breaking and file output) deterministic.
    #[serde(default)]
    pub token_states: BTreeMap<String, TokenState>,
}

/// Thread-safe owner of [`PersistedState`] with write-through persistence.
pub struct StateManager {
    file_path: PathBuf,
    state: Mutex<PersistedState>,
}

impl StateManager {
    /// Loads existing state from `file_path`, or starts fresh if the file
    /// does not exist yet.
    pub fn new(file_path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let file_path = file_path.into();
        let state = match std::fs::read(&file_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(StateManager {
            file_path,
            state: Mutex::new(state),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// A copy of the current in-memory state.
    pub fn snapshot(&self) -> PersistedState {
        self.state.lock().unwrap().clone()
    }

    /// Persists the current state. Used by the shutdown handler; the mutex
    /// guarantees the flush cannot interleave with a mutation.
    pub fn save(&self) -> Result<(), StateError> {
        let state = self.state.lock().unwrap();
        self.save_locked(&state)
    }

    fn save_locked(&self, state: &PersistedState) -> Result<(), StateError> {
        let data = serde_json::to_vec_pretty(state)?;
        atomic_write_file(&self.file_path, &data)?;
        Ok(())
    }

    /// Reconciles the token map with the credential file: exactly one entry
    /// per supplied credKey, counters carried over for keys that survive,
    /// dropped entries forgotten, and every entry re-asserted active.
    pub fn sync_token_status_with_latest_auth_credentials(
        &self,
        credentials: &[Credential],
    ) -> Result<(), StateError> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();

        let mut latest = BTreeMap::new();
        for credential in credentials {
            let mut token = state
                .token_states
                .get(&credential.cred_key)
                .cloned()
                .unwrap_or_default();
            token.update_status(TokenStatus::Active, now);
            latest.insert(credential.cred_key.clone(), token);
        }
        state.token_states = latest;

        self.save_locked(&state)
    }

    pub fn update_ongoing_job_start_time(
        &self,
        start_time: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap();
        state.ongoing_job_start_time = Some(start_time);
        self.save_locked(&state)
    }

    /// Rolls the ongoing start time into the last-execution window and
    /// records the end time.
    pub fn update_last_job_execution_time(
        &self,
        end_time: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap();
        state.last_job_execution_start_time = state.ongoing_job_start_time;
        state.last_job_execution_end_time = Some(end_time);
        self.save_locked(&state)
    }

    pub fn update_rate_limit_reset_time(
        &self,
        reset_time: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap();
        state.rate_limit_reset_at = Some(reset_time);
        self.save_locked(&state)
    }

    pub fn set_token_status_to_rate_limited(&self, cred_key: &str) -> Result<(), StateError> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let token = state
            .token_states
            .get_mut(cred_key)
            .ok_or_else(|| StateError::TokenNotFound(cred_key.to_string()))?;
        token.set_exhausted(now);
        self.save_locked(&state)
    }

    pub fn set_token_status_to_unauthorized(&self, cred_key: &str) -> Result<(), StateError> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let token = state
            .token_states
            .get_mut(cred_key)
            .ok_or_else(|| StateError::TokenNotFound(cred_key.to_string()))?;
        token.set_unauthorized(now);
        self.save_locked(&state)
    }

    pub fn update_token_usage(
        &self,
        cred_key: &str,
        usage_time: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap();
        let token = state
            .token_states
            .get_mut(cred_key)
            .ok_or_else(|| StateError::TokenNotFound(cred_key.to_string()))?;
        token.record_usage(usage_time);
        self.save_locked(&state)
    }

    /// Pool-wide recovery after exhaustion: records the cooldown completion
    /// and marks every token active with its usage counter rolled over.
    pub fn reset_usage_metrics_for_all_tokens(
        &self,
        resume_time: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut state = self.state.lock().unwrap();
        state.cooldown_completed_at = Some(resume_time);
        for token in state.token_states.values_mut() {
            token.reset_usage_metrics(resume_time);
        }
        self.save_locked(&state)
    }

    /// Selects the active token with the smallest successful usage count.
    ///
    /// Ties go to the lexicographically first credKey, which is arbitrary
    /// but stable for any fixed pool content. When no token is active the
    /// error classifies the pool so the caller can tell "wait and reset"
    /// (`AllTokensExhausted`) apart from the critical outcomes.
    pub fn get_least_usage_active_token(&self) -> Result<String, TokenPoolError> {
        let state = self.state.lock().unwrap();

        if state.token_states.is_empty() {
            return Err(TokenPoolError::EmptyTokenPool);
        }

        let mut least: Option<(&String, u64)> = None;
        for (cred_key, token) in &state.token_states {
            if !token.is_active() {
                continue;
            }
            match least {
                Some((_, count)) if token.successful_usage_count >= count => {}
                _ => least = Some((cred_key, token.successful_usage_count)),
            }
        }
        if let Some((cred_key, _)) = least {
            return Ok(cred_key.clone());
        }

        let total = state.token_states.len();
        let ignored = state
            .token_states
            .values()
            .filter(|t| t.is_ignored())
            .count();
        let exhausted = state
            .token_states
            .values()
            .filter(|t| t.is_exhausted())
            .count();

        if ignored == total {
            Err(TokenPoolError::AllTokensIgnored)
        } else if ignored + exhausted == total {
            Err(TokenPoolError::AllTokensExhausted)
        } else {
            Err(TokenPoolError::ActiveTokenNotFound)
        }
    }
}
