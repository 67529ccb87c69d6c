//! The retrying Bitbucket Cloud API client.
//!
//! Every request selects the least-used active credential from the token
//! pool. `401` and `429` eject the offending token and rotate to the next
//! active one immediately; only when the whole pool is exhausted does the
//! client sleep and reset the pool, at most [`MAX_ATTEMPTS`] times. A `200`
//! is the only success — the endpoints this worker calls never legitimately
//! answer with any other 2xx, so those are surfaced as failures instead of
//! being parsed as data.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{error, info, warn};

use bluepull_core::auth::{find_by_cred_key, Credential};
use bluepull_core::state::{StateError, StateManager, TokenPoolError};

/// Upper bound on sleep-and-reset cycles per logical request.
pub const MAX_ATTEMPTS: u32 = 2;

const BASE_URL: &str = "https://api.bitbucket.org/2.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const WORKSPACES_PAGE_LEN: usize = 50;
const REPOSITORIES_PAGE_LEN: usize = 100;
const PULL_REQUESTS_PAGE_LEN: usize = 50;
const COMMITS_PAGE_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum ApiClientError {
    /// Token selection failed; critical unless the pool is merely exhausted.
    #[error(transparent)]
    TokenPool(#[from] TokenPoolError),

    /// The state file could not record a token transition. Fatal.
    #[error("state persistence failed: {0}")]
    State(#[from] StateError),

    #[error("unexpected 2xx response code: {status} for token: {cred_key}. message: {message}")]
    Unexpected2xx {
        status: u16,
        cred_key: String,
        message: String,
    },

    #[error("unhandled response code: {status} for token: {cred_key}")]
    UnhandledStatus { status: u16, cred_key: String },

    #[error("exceeded maximum reset limit({0}) without a successful response")]
    ResetLimitExceeded(u32),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build request URL: {0}")]
    Url(String),
}

impl ApiClientError {
    /// Critical errors abort the whole pull cycle; the rest abort only the
    /// containing phase and are retried from the audit cursor next tick.
    pub fn is_critical(&self) -> bool {
        match self {
            ApiClientError::TokenPool(e) => e.is_critical(),
            ApiClientError::State(_) => true,
            _ => false,
        }
    }
}

/// HTTP client over the token pool.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    state_manager: Arc<StateManager>,
    credentials: Vec<Credential>,
    waiting_time_for_rate_limit: Duration,
}

impl ApiClient {
    /// Builds the client with the shared HTTP connection pool and a
    /// client-level request timeout.
    pub fn new(
        state_manager: Arc<StateManager>,
        credentials: Vec<Credential>,
        waiting_time_for_rate_limit: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        ApiClient {
            base_url: BASE_URL.to_string(),
            http,
            state_manager,
            credentials,
            waiting_time_for_rate_limit,
        }
    }

    /// Points the client at a different API root (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Executes one logical GET with token rotation and pool resets.
    pub async fn execute_with_retries(
        &self,
        url: &str,
    ) -> Result<reqwest::Response, ApiClientError> {
        for attempt in 0..MAX_ATTEMPTS {
            info!(attempt = attempt + 1, "request attempt");

            if attempt > 0 {
                info!(
                    seconds = self.waiting_time_for_rate_limit.as_secs(),
                    "pool exhausted, sleeping before reset"
                );
                tokio::time::sleep(self.waiting_time_for_rate_limit).await;
                info!("resetting usage metrics for all tokens");
                self.state_manager
                    .reset_usage_metrics_for_all_tokens(Utc::now())?;
            }

            loop {
                let cred_key = match self.state_manager.get_least_usage_active_token() {
                    Ok(key) => key,
                    Err(TokenPoolError::AllTokensExhausted) => {
                        warn!("all tokens are exhausted, need to wait for rate limit to reset");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to get least usage active token");
                        return Err(e.into());
                    }
                };

                let Some(credential) = find_by_cred_key(&cred_key, &self.credentials) else {
                    error!(cred_key = %cred_key, "no credential found for selected token, retrying with next available token");
                    self.state_manager.set_token_status_to_unauthorized(&cred_key)?;
                    continue;
                };

                let response = self.send_get(url, credential).await?;
                let status = response.status();

                if status == StatusCode::OK {
                    self.state_manager
                        .update_token_usage(&cred_key, Utc::now())?;
                    return Ok(response);
                }

                if status.is_success() {
                    error!(status = status.as_u16(), cred_key = %cred_key, "unexpected 2xx response");
                    let message = match response.text().await {
                        Ok(body) => format!("response body: {body}"),
                        Err(e) => format!("failed to read response body: {e}"),
                    };
                    return Err(ApiClientError::Unexpected2xx {
                        status: status.as_u16(),
                        cred_key,
                        message,
                    });
                }

                match status.as_u16() {
                    401 => {
                        error!(cred_key = %cred_key, "unauthorized access for token");
                        self.state_manager.set_token_status_to_unauthorized(&cred_key)?;
                    }
                    429 => {
                        warn!(cred_key = %cred_key, "rate limit exceeded for token");
                        self.state_manager.set_token_status_to_rate_limited(&cred_key)?;
                    }
                    code => {
                        error!(status = code, cred_key = %cred_key, "unhandled response code");
                        return Err(ApiClientError::UnhandledStatus {
                            status: code,
                            cred_key,
                        });
                    }
                }
            }
        }

        Err(ApiClientError::ResetLimitExceeded(MAX_ATTEMPTS))
    }

    async fn send_get(
        &self,
        url: &str,
        credential: &Credential,
    ) -> Result<reqwest::Response, ApiClientError> {
        let response = self
            .http
            .get(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(
                AUTHORIZATION,
                format!("Basic {}", credential.basic_auth_token()),
            )
            .send()
            .await?;
        Ok(response)
    }

    /// Follows `next` links until the listing is exhausted.
    async fn collect_pages<T: serde::de::DeserializeOwned>(
        &self,
        first_url: String,
    ) -> Result<Vec<T>, ApiClientError> {
        let mut results = Vec::new();
        let mut url = Some(first_url);

        while let Some(current) = url {
            let response = self.execute_with_retries(&current).await?;
            let page: super::types::Paginated<T> =
                response
                    .json()
                    .await
                    .map_err(|source| ApiClientError::Decode {
                        url: current,
                        source,
                    })?;
            results.extend(page.values);
            url = page.next.filter(|next| !next.is_empty());
        }

        Ok(results)
    }

    pub async fn get_workspaces(&self) -> Result<Vec<super::Workspace>, ApiClientError> {
        let url = format!(
            "{}/workspaces?pagelen={}",
            self.base_url, WORKSPACES_PAGE_LEN
        );
        let workspaces: Vec<super::Workspace> = self.collect_pages(url).await?;
        info!(count = workspaces.len(), "fetched workspaces");
        Ok(workspaces)
    }

    pub async fn get_repositories(
        &self,
        workspace: &str,
    ) -> Result<Vec<super::Repository>, ApiClientError> {
        let url = format!(
            "{}/repositories/{}?pagelen={}",
            self.base_url, workspace, REPOSITORIES_PAGE_LEN
        );
        self.collect_pages(url).await
    }

    /// Pull requests in any terminal-or-open state updated since `cutoff`.
    pub async fn get_pull_requests(
        &self,
        workspace: &str,
        repo: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<super::PullRequest>, ApiClientError> {
        let query = format!(
            r#"state IN ("OPEN", "MERGED", "DECLINED", "SUPERSEDED") AND updated_on >= {}"#,
            cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let page_len = PULL_REQUESTS_PAGE_LEN.to_string();
        let url = Url::parse_with_params(
            &format!(
                "{}/repositories/{}/{}/pullrequests",
                self.base_url, workspace, repo
            ),
            &[("q", query.as_str()), ("pagelen", page_len.as_str())],
        )
        .map_err(|e| ApiClientError::Url(e.to_string()))?;

        self.collect_pages(url.to_string()).await
    }

    pub async fn get_pull_request_commits(
        &self,
        workspace: &str,
        repo: &str,
        pull_request_id: i64,
    ) -> Result<Vec<super::Commit>, ApiClientError> {
        let url = format!(
            "{}/repositories/{}/{}/pullrequests/{}/commits?pagelen={}",
            self.base_url, workspace, repo, pull_request_id, COMMITS_PAGE_LEN
        );
        self.collect_pages(url).await
    }

    /// Repository commits dated after `cutoff`.
    ///
    /// The endpoint has no server-side date filter, so pages are filtered
    /// client-side. Commit listings come newest-first; once a page
    /// contributes fewer qualifying commits than its page length, the rest
    /// of the history predates the cutoff and paging stops.
    pub async fn get_commits(
        &self,
        workspace: &str,
        repo: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<super::Commit>, ApiClientError> {
        let mut commits: Vec<super::Commit> = Vec::new();
        let mut url = Some(format!(
            "{}/repositories/{}/{}/commits?pagelen={}",
            self.base_url, workspace, repo, COMMITS_PAGE_LEN
        ));

        while let Some(current) = url {
            let response = self.execute_with_retries(&current).await?;
            let page: super::Paginated<super::Commit> =
                response
                    .json()
                    .await
                    .map_err(|source| ApiClientError::Decode {
                        url: current,
                        source,
                    })?;

            let mut qualifying = 0usize;
            for commit in page.values {
                if commit.date > cutoff {
                    commits.push(commit);
                    qualifying += 1;
                }
            }
            if qualifying < COMMITS_PAGE_LEN {
                break;
            }
            url = page.next.filter(|next| !next.is_empty());
        }

        Ok(commits)
    }
}
