//! The bluepull data-pull worker.
//!
//! A cron-driven loop pulls repository metadata, pull requests and commits
//! from Bitbucket Cloud through a pool of rate-limited credentials and
//! forwards normalized records to the Bluelock relay. Per-repository sync
//! progress lives in a SQLite audit table so interrupted runs resume from
//! their incremental cursor.

pub mod audit;
pub mod bitbucket;
pub mod context;
pub mod integrations;
pub mod relay;
pub mod scheduler;

pub use audit::{AuditError, NewRepoSyncAudit, RepoSyncAudit, SqliteAuditStore, SyncOutcome};
pub use bitbucket::{ApiClient, ApiClientError, BitbucketCloudService};
pub use context::{AppContext, AppContextBuilder};
pub use integrations::{active_integration_service, GitIntegrationService, IntegrationService};
pub use relay::{BluelockRelayService, DataRelayer, RelayError};
pub use scheduler::JobScheduler;
