//! The integration capability set and tagged dispatch.
//!
//! Every integration implements [`IntegrationService`]; families layer
//! their phase methods on top. Only the Bitbucket Cloud git integration is
//! implemented — the CI/CD and issue-tracker traits reserve the capability
//! surface for services that plug in later.

pub mod dtos;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use bluepull_core::ServiceKey;

use crate::bitbucket::BitbucketCloudService;
use crate::context::AppContext;
use dtos::RootErrorPayload;

/// Capabilities every integration provides.
#[async_trait]
pub trait IntegrationService: Send + Sync {
    /// Checks the integration's addressing before the scheduler starts.
    fn validate_env_variables(&self) -> Result<()>;

    /// Runs one full pull cycle.
    async fn run_job(&self) -> Result<()>;
}

/// Version-control integrations: repository discovery plus activity sync.
///
/// Phases return the collected non-critical error payload; a critical
/// failure aborts the phase through `Err` instead.
#[async_trait]
pub trait GitIntegrationService: IntegrationService {
    async fn repo_pull(&self) -> Result<RootErrorPayload>;
    async fn git_activity_pull(&self) -> Result<RootErrorPayload>;
}

/// Git integrations whose code-breakdown data ships on its own schedule.
#[async_trait]
pub trait PriorityScheduledGitIntegrationService: GitIntegrationService {
    async fn git_code_breakdown_pull(&self) -> Result<RootErrorPayload>;
}

/// CI/CD integrations. No implementor yet.
#[async_trait]
pub trait CicdIntegrationService: IntegrationService {
    async fn build_pull(&self) -> Result<()>;
    async fn pipeline_pull(&self) -> Result<()>;
    async fn deployment_pull(&self) -> Result<()>;
}

/// Issue-tracker integrations. No implementor yet.
#[async_trait]
pub trait IssueIntegrationService: IntegrationService {
    async fn issue_pull(&self) -> Result<()>;
    async fn issue_activity_pull(&self) -> Result<()>;
    async fn issue_metrics_pull(&self) -> Result<()>;
}

/// Resolves the configured `activeService` to its implementation.
pub fn active_integration_service(context: &AppContext) -> Result<Arc<dyn IntegrationService>> {
    match context.config.active_service {
        Some(ServiceKey::BitbucketCloud) => {
            info!("initializing Bitbucket Cloud as the active integration service");
            Ok(Arc::new(BitbucketCloudService::from_context(context)))
        }
        Some(other) => bail!("unsupported service type: {other}"),
        None => bail!("no active service configured"),
    }
}
