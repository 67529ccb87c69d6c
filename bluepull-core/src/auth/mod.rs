//! Credentials and the on-disk credential store.

mod credentials;
mod credstore;

pub use credentials::{find_by_cred_key, Credential};
pub use credstore::{
    load_and_validate, normalize_and_persist, CredStoreError, CredentialStore,
    COMMIT_ANALYSIS_CREDENTIALS_KEY, DATAPULL_CREDENTIALS_KEY,
};
