//! The on-disk credential store.
//!
//! The store is a JSON document mapping a purpose key (e.g.
//! `datapullCredentials`) to an ordered list of credentials. Two processes
//! touch the file: the worker (read-only at startup) and the `authsync`
//! normalizer (rewrite). Coordination is an advisory lock on a `.lock`
//! sidecar. Readers take the lock only long enough to know no writer holds
//! it and then release it — a snapshot read, safe because writers replace
//! the file with an atomic rename, so a racing reader sees one complete
//! document version or the other.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsync::atomic_write_file;
use crate::auth::credentials::Credential;

/// Purpose key the worker requires.
pub const DATAPULL_CREDENTIALS_KEY: &str = "datapullCredentials";

/// Purpose key for the commit-analysis pipeline; carried through
/// normalization untouched.
pub const COMMIT_ANALYSIS_CREDENTIALS_KEY: &str = "commitAnalysisCredentials";

/// Readers only need to observe that no writer is mid-rewrite.
const READ_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Writers hold the lock across the whole write+rename.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors from loading or rewriting the credential store.
#[derive(Debug, Error)]
pub enum CredStoreError {
    /// The store parsed but violates a structural requirement.
    #[error("invalid credential store: {0}")]
    Invalid(String),

    /// Another process held the advisory lock past the timeout.
    #[error("failed to acquire lock on {path} within {timeout_ms} ms: another process is holding the lock")]
    LockContention { path: PathBuf, timeout_ms: u128 },

    #[error("credential store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("credential store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Immutable map from purpose key to credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialStore(pub BTreeMap<String, Vec<Credential>>);

impl CredentialStore {
    /// The credentials the data-pull worker runs with.
    pub fn datapull_credentials(&self) -> Option<&[Credential]> {
        self.0.get(DATAPULL_CREDENTIALS_KEY).map(Vec::as_slice)
    }

    /// Structural validation: non-empty store, required purpose key present
    /// and non-empty, and every credential carries a usable username and
    /// password (the credKey is derivable from those, so it may be absent).
    pub fn validate(&self) -> Result<(), CredStoreError> {
        if self.0.is_empty() {
            return Err(CredStoreError::Invalid("credential store is empty".into()));
        }
        let datapull = self
            .0
            .get(DATAPULL_CREDENTIALS_KEY)
            .ok_or_else(|| {
                CredStoreError::Invalid(format!(
                    "missing required key: {DATAPULL_CREDENTIALS_KEY}"
                ))
            })?;
        if datapull.is_empty() {
            return Err(CredStoreError::Invalid(format!(
                "no credentials under key: {DATAPULL_CREDENTIALS_KEY}"
            )));
        }
        for (key, credentials) in &self.0 {
            for credential in credentials {
                if credential.username.is_empty() || credential.password.is_empty() {
                    return Err(CredStoreError::Invalid(format!(
                        "invalid credentials for key {key}: username and password must not be empty"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn backup_path_for(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

/// Acquires the advisory lock, polling until the timeout elapses.
///
/// The returned file handle owns the lock; dropping it releases the lock.
fn acquire_lock(path: &Path, timeout: Duration) -> Result<fs::File, CredStoreError> {
    let lock_path = lock_path_for(path);
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => return Err(e.into()),
            Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_POLL_INTERVAL),
            Err(_) => {
                return Err(CredStoreError::LockContention {
                    path: lock_path,
                    timeout_ms: timeout.as_millis(),
                })
            }
        }
    }
}

/// Reads, parses and validates the credential store.
///
/// Returns the store together with the raw file bytes (the normalizer
/// writes those bytes to the backup file before rewriting).
pub fn load_and_validate(path: &Path) -> Result<(CredentialStore, Vec<u8>), CredStoreError> {
    let lock_file = acquire_lock(path, READ_LOCK_TIMEOUT)?;
    // Snapshot semantics: release immediately, the atomic-rename write path
    // guarantees we cannot observe a torn file.
    drop(lock_file);

    let data = fs::read(path)?;
    let store: CredentialStore = serde_json::from_slice(&data)?;
    store.validate()?;
    Ok((store, data))
}

/// Rewrites the credential store with every `credKey` populated.
///
/// The original bytes are copied to the `.backup.json` sibling first, then
/// the normalized document replaces the original via an atomic rename while
/// the advisory lock is held. The result is re-loaded and re-validated so a
/// bad rewrite cannot go unnoticed.
pub fn normalize_and_persist(path: &Path) -> Result<CredentialStore, CredStoreError> {
    let (mut store, raw) = load_and_validate(path)?;

    fs::write(backup_path_for(path), &raw)?;

    for credentials in store.0.values_mut() {
        for credential in credentials {
            credential.generate_cred_key_if_absent();
        }
    }

    let serialized = serde_json::to_vec_pretty(&store)?;
    {
        let _lock_file = acquire_lock(path, WRITE_LOCK_TIMEOUT)?;
        atomic_write_file(path, &serialized)?;
        // Lock released here on every exit path, success or error.
    }

    let (reloaded, _) = load_and_validate(path)?;
    Ok(reloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_store(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("auth_tokens.json");
        fs::write(&path, contents).unwrap();
        path
    }

    const VALID_STORE: &str = r#"{
        "datapullCredentials": [
            {"username": "alice", "password": "pa"},
            {"username": "bob", "password": "pb", "credKey": "bob-key"}
        ],
        "commitAnalysisCredentials": [
            {"username": "carol", "password": "pc"}
        ]
    }"#;

    #[test]
    fn load_and_validate_accepts_a_valid_store() {
        let dir = tempdir().unwrap();
        let path = write_store(dir.path(), VALID_STORE);

        let (store, raw) = load_and_validate(&path).unwrap();
        assert_eq!(store.datapull_credentials().unwrap().len(), 2);
        assert_eq!(raw, fs::read(&path).unwrap());
    }

    #[test]
    fn load_and_validate_rejects_missing_datapull_key() {
        let dir = tempdir().unwrap();
        let path = write_store(
            dir.path(),
            r#"{"commitAnalysisCredentials": [{"username": "u", "password": "p"}]}"#,
        );

        let err = load_and_validate(&path).unwrap_err();
        assert!(matches!(err, CredStoreError::Invalid(_)));
        assert!(err.to_string().contains("datapullCredentials"));
    }

    #[test]
    fn load_and_validate_rejects_empty_store() {
        let dir = tempdir().unwrap();
        let path = write_store(dir.path(), "{}");

        let err = load_and_validate(&path).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn load_and_validate_rejects_blank_username() {
        let dir = tempdir().unwrap();
        let path = write_store(
            dir.path(),
            r#"{"datapullCredentials": [{"username": "", "password": "p"}]}"#,
        );

        assert!(load_and_validate(&path).is_err());
    }

    #[test]
    fn normalize_fills_missing_cred_keys_and_keeps_existing() {
        let dir = tempdir().unwrap();
        let path = write_store(dir.path(), VALID_STORE);

        let store = normalize_and_persist(&path).unwrap();

        let creds = store.datapull_credentials().unwrap();
        // base64("alice:pa")
        assert_eq!(creds[0].cred_key, "YWxpY2U6cGE=");
        assert_eq!(creds[1].cred_key, "bob-key");

        // Every credential in the rewritten file carries a credKey.
        let (reloaded, _) = load_and_validate(&path).unwrap();
        for credentials in reloaded.0.values() {
            for credential in credentials {
                assert!(!credential.cred_key.is_empty());
            }
        }
    }

    #[test]
    fn normalize_writes_backup_with_original_bytes() {
        let dir = tempdir().unwrap();
        let path = write_store(dir.path(), VALID_STORE);

        normalize_and_persist(&path).unwrap();

        let backup = dir.path().join("auth_tokens.backup.json");
        assert_eq!(fs::read(&backup).unwrap(), VALID_STORE.as_bytes());
    }

    #[test]
    fn normalize_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = write_store(dir.path(), VALID_STORE);

        normalize_and_persist(&path).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "stray temp files: {leftovers:?}");
    }

    #[test]
    fn normalize_result_is_a_complete_document() {
        // An observer reading the file after normalization parses a full
        // store; the write path never exposes a partial document because the
        // temp file is renamed into place.
        let dir = tempdir().unwrap();
        let path = write_store(dir.path(), VALID_STORE);

        normalize_and_persist(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        let parsed: CredentialStore = serde_json::from_slice(&bytes).unwrap();
        parsed.validate().unwrap();
    }

    #[test]
    fn contended_lock_fails_with_lock_contention() {
        let dir = tempdir().unwrap();
        let path = write_store(dir.path(), VALID_STORE);

        // Hold the writer lock from this thread, then try to load.
        let held = acquire_lock(&path, WRITE_LOCK_TIMEOUT).unwrap();
        let err = load_and_validate(&path).unwrap_err();
        assert!(matches!(err, CredStoreError::LockContention { .. }));
        drop(held);

        load_and_validate(&path).unwrap();
    }
}
