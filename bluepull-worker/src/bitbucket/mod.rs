//! Bitbucket Cloud integration: wire types, the retrying API client, and
//! the pull-phase service.

mod client;
mod service;
mod types;

pub use client::{ApiClient, ApiClientError, MAX_ATTEMPTS};
pub use service::BitbucketCloudService;
pub use types::{
    Branch, BranchRef, Commit, CommitAuthor, Link, Links, Paginated, PullRequest, Repository,
    User, Workspace, PR_STATE_OPEN,
};
