//! The Bitbucket Cloud pull phases.
//!
//! `run_job` executes two phases in order. RepoPull discovers workspaces
//! and repositories, creates audit rows for repos seen for the first time,
//! and emits the discovered batch. GitActivityPull walks the audit table
//! never-synced and longest-stale first, fetches pull requests and commits
//! since each repo's cutoff, emits the normalized payload, and writes the
//! outcome back to the audit row.
//!
//! A critical error aborts the phase and the job; everything else is
//! collected into the nested error payload or the audit row and the next
//! cron tick picks up from the cursor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use bluepull_core::Config;

use crate::audit::{AuditError, NewRepoSyncAudit, RepoSyncAudit, SqliteAuditStore, SyncOutcome};
use crate::bitbucket::client::{ApiClient, ApiClientError};
use crate::bitbucket::types as bb;
use crate::context::AppContext;
use crate::integrations::dtos::{
    ActivityData, Actor, CommitRecord, PrError, PullRequestRecord, RepoError, RepoRecord,
    RootErrorPayload, WorkspaceError,
};
use crate::integrations::{GitIntegrationService, IntegrationService};
use crate::relay::DataRelayer;

const AUDIT_PAGE_SIZE: i64 = 100;

/// Settle delay after both phases, before the scheduler records completion.
const POST_JOB_SETTLE: Duration = Duration::from_secs(5);

pub struct BitbucketCloudService {
    config: Arc<Config>,
    api_client: Arc<ApiClient>,
    audit_store: Arc<SqliteAuditStore>,
    data_relayer: Arc<dyn DataRelayer>,
}

impl BitbucketCloudService {
    pub fn new(
        config: Arc<Config>,
        api_client: Arc<ApiClient>,
        audit_store: Arc<SqliteAuditStore>,
        data_relayer: Arc<dyn DataRelayer>,
    ) -> Self {
        BitbucketCloudService {
            config,
            api_client,
            audit_store,
            data_relayer,
        }
    }

    pub fn from_context(context: &AppContext) -> Self {
        BitbucketCloudService::new(
            context.config.clone(),
            context.api_client.clone(),
            context.audit_store.clone(),
            context.data_relayer.clone(),
        )
    }

    /// Every audit row, paged out of the store in walk order.
    async fn all_active_repo_sync_audits(&self) -> Result<Vec<RepoSyncAudit>, AuditError> {
        let mut audits = Vec::new();
        loop {
            let page = self
                .audit_store
                .list_active(AUDIT_PAGE_SIZE, audits.len() as i64)
                .await?;
            let page_len = page.len();
            audits.extend(page);
            if page_len < AUDIT_PAGE_SIZE as usize {
                break;
            }
        }
        Ok(audits)
    }

    /// Syncs one repository's activity window.
    ///
    /// Returns `Err` only for critical fetch errors and relay failures;
    /// partial fetch errors are collected into the repo error payload and
    /// forwarded to the relay's pull-error endpoint.
    async fn sync_git_activity_for_repo(&self, audit: &RepoSyncAudit) -> Result<()> {
        let mut repo_error = RepoError {
            repo_id: audit.id.clone(),
            ..RepoError::default()
        };
        let mut repo_record = RepoRecord {
            slug: audit.id.clone(),
            ..RepoRecord::default()
        };

        let cutoff = audit.successful_sync_time.unwrap_or_else(|| {
            Utc::now() - chrono::Duration::days(self.config.defaults.default_data_pull_days)
        });

        match self
            .api_client
            .get_pull_requests(&audit.workspace_slug, &audit.id, cutoff)
            .await
        {
            Ok(pull_requests) => {
                let mut pr_records = Vec::new();
                for pull_request in pull_requests {
                    let mut pr_error = PrError {
                        pr_id: pull_request.id,
                        ..PrError::default()
                    };
                    let commits = match self
                        .api_client
                        .get_pull_request_commits(&audit.workspace_slug, &audit.id, pull_request.id)
                        .await
                    {
                        Ok(commits) => commits,
                        Err(e) if e.is_critical() => {
                            return Err(anyhow!(e).context(format!(
                                "error fetching pull request commits for repository: {}",
                                audit.id
                            )))
                        }
                        Err(e) => {
                            let message = format!(
                                "error fetching pull request commits for repository: {}: {e}",
                                audit.id
                            );
                            error!("{message}");
                            pr_error.commit_fetch_error = message;
                            Vec::new()
                        }
                    };

                    let commit_records = commits.into_iter().map(to_commit_record).collect();
                    pr_records.push(to_pull_request_record(pull_request, commit_records));
                    if !pr_error.is_empty() {
                        repo_error.pr_errors.push(pr_error);
                    }
                }
                if !pr_records.is_empty() {
                    repo_record.prs = pr_records;
                }
            }
            Err(e) if e.is_critical() => {
                return Err(anyhow!(e).context(format!(
                    "error fetching pull requests for repository: {}",
                    audit.id
                )))
            }
            Err(e) => {
                let message =
                    format!("error fetching pull requests for repository: {}: {e}", audit.id);
                error!("{message}");
                repo_error.pr_fetch_error = message;
            }
        }

        match self
            .api_client
            .get_commits(&audit.workspace_slug, &audit.id, cutoff)
            .await
        {
            Ok(commits) => {
                let commit_records: Vec<CommitRecord> =
                    commits.into_iter().map(to_commit_record).collect();
                if !commit_records.is_empty() {
                    repo_record.commits = commit_records;
                }
            }
            Err(e) if e.is_critical() => {
                return Err(anyhow!(e).context(format!(
                    "error fetching commits for repository: {}",
                    audit.id
                )))
            }
            Err(e) => {
                let message =
                    format!("error fetching commits for repository: {}: {e}", audit.id);
                error!("{message}");
                repo_error.commit_fetch_error = message;
            }
        }

        if !repo_record.is_empty() {
            let data = ActivityData {
                workspace_key: audit.workspace_slug.clone(),
                repos: vec![repo_record],
            };
            let payload =
                serde_json::to_value(&data).context("failed to serialize activity payload")?;
            self.data_relayer
                .send_collected_data(payload, &[("type", "activity_pull")])
                .await
                .context("error sending data to data relayer")?;
        }

        if !repo_error.is_empty() {
            let payload = serde_json::to_value(&repo_error)
                .context("failed to serialize repo error payload")?;
            self.data_relayer
                .send_pull_error(payload, &[])
                .await
                .context("error sending error logs to data relayer")?;
        }

        Ok(())
    }
}

#[async_trait]
impl IntegrationService for BitbucketCloudService {
    fn validate_env_variables(&self) -> Result<()> {
        info!("validating environment variables for Bitbucket Cloud");
        if self.config.bitbucket_cloud_workspace().is_empty() {
            bail!("Bitbucket Cloud workspace is not set in the configuration");
        }
        Ok(())
    }

    async fn run_job(&self) -> Result<()> {
        info!("Bitbucket Cloud job started");

        match self.repo_pull().await {
            Ok(payload) if !payload.is_empty() => {
                warn!(
                    errors = %serde_json::to_string(&payload).unwrap_or_default(),
                    "repository pull finished with collected errors"
                );
            }
            Ok(_) => {}
            Err(e) => {
                let e = e.context("error pulling repositories from Bitbucket Cloud");
                error!("{e:#}");
                return Err(e);
            }
        }

        match self.git_activity_pull().await {
            Ok(payload) if !payload.is_empty() => {
                warn!(
                    errors = %serde_json::to_string(&payload).unwrap_or_default(),
                    "Git activity pull finished with collected errors"
                );
            }
            Ok(_) => {}
            Err(e) => {
                let e = e.context("error pulling Git activity from Bitbucket Cloud");
                error!("{e:#}");
                return Err(e);
            }
        }

        tokio::time::sleep(POST_JOB_SETTLE).await;
        info!("Bitbucket Cloud job completed");
        Ok(())
    }
}

#[async_trait]
impl GitIntegrationService for BitbucketCloudService {
    async fn repo_pull(&self) -> Result<RootErrorPayload> {
        info!("pulling repositories from Bitbucket Cloud");
        let mut payload = RootErrorPayload::default();

        let workspaces = match self.api_client.get_workspaces().await {
            Ok(workspaces) => workspaces,
            Err(e) if e.is_critical() => {
                return Err(anyhow!(e).context("error pulling workspaces from Bitbucket Cloud"))
            }
            Err(e) => {
                let message = format!("error pulling workspaces from Bitbucket Cloud: {e}");
                error!("{message}");
                payload.workspace_fetch_error = message;
                return Ok(payload);
            }
        };
        if workspaces.is_empty() {
            payload.workspace_fetch_error = "no workspaces found in Bitbucket Cloud".to_string();
            return Ok(payload);
        }

        for workspace in workspaces {
            let mut workspace_error = WorkspaceError {
                workspace_slug: workspace.slug.clone(),
                ..WorkspaceError::default()
            };

            let repos = match self.api_client.get_repositories(&workspace.slug).await {
                Ok(repos) => repos,
                Err(e) if e.is_critical() => {
                    return Err(anyhow!(e).context(format!(
                        "error pulling repositories for workspace: {}",
                        workspace.slug
                    )))
                }
                Err(e) => {
                    let message = format!("error pulling repositories from Bitbucket Cloud: {e}");
                    error!("{message}");
                    workspace_error.repo_fetch_error = message;
                    Vec::new()
                }
            };
            if repos.is_empty() && workspace_error.repo_fetch_error.is_empty() {
                let message = format!("no repositories found in workspace: {}", workspace.slug);
                error!("{message}");
                workspace_error.repo_fetch_error = message;
            }
            info!(workspace = %workspace.slug, count = repos.len(), "found repositories");

            let mut discovered = Vec::new();
            for repo in &repos {
                discovered.push(RepoRecord {
                    slug: repo.slug.clone(),
                    name: repo.name.clone(),
                    id: repo.id.clone(),
                    is_public: !repo.is_private,
                    link: repo.links.html.href.clone(),
                    commits: Vec::new(),
                    prs: Vec::new(),
                });

                match self.audit_store.get_by_id(&repo.slug).await {
                    Ok(Some(existing)) => {
                        debug!(repo = %existing.repo_name, "repository already audited");
                        continue;
                    }
                    Ok(None) => {
                        info!(repo = %repo.name, "repository not audited yet, creating repo sync audit");
                        if let Err(e) = self
                            .audit_store
                            .create(NewRepoSyncAudit {
                                id: repo.slug.clone(),
                                repo_name: repo.name.clone(),
                                workspace_slug: workspace.slug.clone(),
                            })
                            .await
                        {
                            let message = format!(
                                "error creating repo sync audit for repo: {}: {e}",
                                repo.slug
                            );
                            error!("{message}");
                            workspace_error.repo_errors.push(RepoError {
                                repo_id: repo.slug.clone(),
                                repo_processing_error: message,
                                ..RepoError::default()
                            });
                            continue;
                        }
                    }
                    Err(e) => {
                        let message =
                            format!("error getting repo sync audit for repo: {}: {e}", repo.slug);
                        error!("{message}");
                        workspace_error.repo_errors.push(RepoError {
                            repo_id: repo.slug.clone(),
                            repo_processing_error: message,
                            ..RepoError::default()
                        });
                        continue;
                    }
                }
            }

            let discovered_payload = serde_json::to_value(&discovered)
                .context("failed to serialize discovered repositories")?;
            if let Err(e) = self
                .data_relayer
                .send_collected_data(discovered_payload, &[("type", "repo_pull")])
                .await
            {
                let message = format!("error sending pull data to data relayer: {e}");
                error!("{message}");
                workspace_error.workspace_processing_error = message;
            }

            if !workspace_error.is_empty() {
                payload.workspace_errors.push(workspace_error);
            }
        }

        Ok(payload)
    }

    async fn git_activity_pull(&self) -> Result<RootErrorPayload> {
        info!("pulling Git activity from Bitbucket Cloud");
        let audits = self
            .all_active_repo_sync_audits()
            .await
            .context("error getting all active repo sync audits")?;
        info!(count = audits.len(), "found active repo sync audits");

        for audit in audits {
            info!(repo = %audit.repo_name, "syncing Git activity");
            let current_sync_time = Utc::now();

            match self.sync_git_activity_for_repo(&audit).await {
                Ok(()) => {
                    self.audit_store
                        .update(
                            &audit.id,
                            SyncOutcome {
                                successful_sync_time: current_sync_time,
                                success: true,
                                error_context: None,
                            },
                        )
                        .await
                        .context("error updating repo sync audit")?;
                }
                Err(e) if is_critical(&e) => {
                    return Err(e.context(format!(
                        "error syncing Git activity for repo: {}",
                        audit.id
                    )));
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    error!(repo = %audit.id, error = %message, "error syncing Git activity for repo");
                    self.audit_store
                        .update(
                            &audit.id,
                            SyncOutcome {
                                successful_sync_time: current_sync_time,
                                success: false,
                                error_context: Some(message),
                            },
                        )
                        .await
                        .context("error updating repo sync audit")?;
                }
            }
        }

        info!("Git activity pulled successfully");
        Ok(RootErrorPayload::default())
    }
}

/// Whether any cause in the chain is a critical API client failure.
fn is_critical(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ApiClientError>()
            .is_some_and(ApiClientError::is_critical)
    })
}

fn to_actor(user: Option<&bb::User>, email_address: &str) -> Actor {
    let (id, display_name) = match user {
        Some(user) => (user.account_id.clone(), user.display_name.clone()),
        None => (String::new(), String::new()),
    };
    Actor {
        id,
        name: display_name.clone(),
        display_name,
        email_address: email_address.to_string(),
    }
}

fn to_commit_record(commit: bb::Commit) -> CommitRecord {
    let committer = to_actor(commit.author.user.as_ref(), &commit.author.raw);
    CommitRecord {
        id: commit.hash,
        message: commit.message,
        committer,
        committer_timestamp: commit.date,
        changed_files: Vec::new(),
    }
}

fn to_pull_request_record(
    pull_request: bb::PullRequest,
    pr_commits: Vec<CommitRecord>,
) -> PullRequestRecord {
    let is_open = pull_request.state == bb::PR_STATE_OPEN;
    let reviewers = pull_request
        .reviewers
        .iter()
        .map(|reviewer| to_actor(Some(reviewer), ""))
        .collect();

    PullRequestRecord {
        pr_commits,
        activity_info: Vec::new(),
        id: pull_request.id,
        title: pull_request.title,
        description: pull_request.description,
        open: is_open,
        closed: !is_open,
        state: pull_request.state,
        created_date: pull_request.created_on,
        updated_date: pull_request.updated_on,
        source_branch: pull_request.source.branch.name,
        target_branch: pull_request.destination.branch.name,
        author: to_actor(pull_request.author.as_ref(), ""),
        reviewers,
        comment_count: pull_request.comment_count,
        link: pull_request.links.html.href,
    }
}
