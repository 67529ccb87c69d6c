use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// A single upstream credential.
///
/// `cred_key` is the stable identifier used for rate-limit accounting. When
/// the credentials file omits it, normalization derives it deterministically
/// from the username/password pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    #[serde(rename = "credKey", default)]
    pub cred_key: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential {
            username: username.into(),
            password: password.into(),
            cred_key: String::new(),
        }
    }

    /// Fills in `cred_key` as `base64(username:password)` if it is empty.
    pub fn generate_cred_key_if_absent(&mut self) -> &str {
        if self.cred_key.is_empty() {
            self.cred_key = general_purpose::STANDARD
                .encode(format!("{}:{}", self.username, self.password));
        }
        &self.cred_key
    }

    /// The value of the `Authorization: Basic` header for this credential.
    pub fn basic_auth_token(&self) -> String {
        general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

/// Looks up a credential by its `cred_key`.
pub fn find_by_cred_key<'a>(cred_key: &str, credentials: &'a [Credential]) -> Option<&'a Credential> {
    credentials.iter().find(|c| c.cred_key == cred_key)
}
