//! Canonical records pushed to the relay, plus the nested error payloads.
//!
//! Field names are the relay's wire contract; do not rename them without a
//! matching change on the ingest side. The error payload structs mirror the
//! data hierarchy (workspace → repo → PR → commit → changed file); each
//! level is elided from its parent when empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "emailAddress")]
    pub email_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    pub change_type: String,
    pub additions: i64,
    pub deletions: i64,
    pub new_work: i64,
    pub refactor: i64,
    pub rework: i64,
    pub help_others: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    pub message: String,
    pub committer: Actor,
    #[serde(rename = "committerTimestamp")]
    pub committer_timestamp: DateTime<Utc>,
    pub changed_files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub actor: Actor,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub pr_commits: Vec<CommitRecord>,
    pub activity_info: Vec<ActivityInfo>,
    pub id: i64,
    pub title: String,
    pub description: String,
    pub state: String,
    pub open: bool,
    pub closed: bool,
    #[serde(rename = "createdDate")]
    pub created_date: DateTime<Utc>,
    #[serde(rename = "updatedDate")]
    pub updated_date: DateTime<Utc>,
    #[serde(rename = "sourceBranch")]
    pub source_branch: String,
    #[serde(rename = "targetBranch")]
    pub target_branch: String,
    pub author: Actor,
    pub reviewers: Vec<Actor>,
    #[serde(rename = "commentCount")]
    pub comment_count: i64,
    pub link: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub slug: String,
    pub name: String,
    pub id: String,
    #[serde(rename = "isPublic")]
    pub is_public: bool,
    pub link: String,
    pub commits: Vec<CommitRecord>,
    pub prs: Vec<PullRequestRecord>,
}

impl RepoRecord {
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.prs.is_empty()
    }
}

/// Per-workspace emit envelope for the activity phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityData {
    pub repos: Vec<RepoRecord>,
    #[serde(rename = "workspaceKey")]
    pub workspace_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootErrorPayload {
    #[serde(rename = "critical", skip_serializing_if = "Vec::is_empty", default)]
    pub critical_errors: Vec<String>,
    #[serde(
        rename = "workspace_fetch_error",
        skip_serializing_if = "String::is_empty",
        default
    )]
    pub workspace_fetch_error: String,
    #[serde(
        rename = "workspace_errors",
        skip_serializing_if = "Vec::is_empty",
        default
    )]
    pub workspace_errors: Vec<WorkspaceError>,
}

impl RootErrorPayload {
    pub fn is_empty(&self) -> bool {
        self.critical_errors.is_empty()
            && self.workspace_fetch_error.is_empty()
            && self.workspace_errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceError {
    pub workspace_slug: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub workspace_processing_error: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub repo_fetch_error: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub repo_errors: Vec<RepoError>,
}

impl WorkspaceError {
    pub fn is_empty(&self) -> bool {
        self.workspace_processing_error.is_empty()
            && self.repo_fetch_error.is_empty()
            && self.repo_errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoError {
    pub repo_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub repo_processing_error: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub pr_fetch_error: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pr_errors: Vec<PrError>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub commit_fetch_error: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub commit_errors: Vec<CommitError>,
}

impl RepoError {
    pub fn is_empty(&self) -> bool {
        self.repo_processing_error.is_empty()
            && self.pr_fetch_error.is_empty()
            && self.commit_fetch_error.is_empty()
            && self.pr_errors.is_empty()
            && self.commit_errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrError {
    pub pr_id: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub pr_processing_error: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub commit_fetch_error: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub commit_errors: Vec<CommitError>,
}

impl PrError {
    pub fn is_empty(&self) -> bool {
        self.pr_processing_error.is_empty()
            && self.commit_fetch_error.is_empty()
            && self.commit_errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitError {
    pub commit_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub commit_processing_error: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub changed_file_errors: Vec<ChangedFileError>,
}

impl CommitError {
    pub fn is_empty(&self) -> bool {
        self.commit_processing_error.is_empty() && self.changed_file_errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangedFileError {
    pub filename: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub changed_file_processing_error: String,
}

impl ChangedFileError {
    pub fn is_empty(&self) -> bool {
        self.changed_file_processing_error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_record_is_empty_without_commits_or_prs() {
        let repo = RepoRecord {
            slug: "api".into(),
            ..RepoRecord::default()
        };
        assert!(repo.is_empty());
    }

    #[test]
    fn empty_levels_are_elided_from_serialized_payload() {
        let payload = RootErrorPayload {
            workspace_errors: vec![WorkspaceError {
                workspace_slug: "acme".into(),
                repo_fetch_error: "boom".into(),
                ..WorkspaceError::default()
            }],
            ..RootErrorPayload::default()
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("critical").is_none());
        assert!(json.get("workspace_fetch_error").is_none());
        let workspace = &json["workspace_errors"][0];
        assert_eq!(workspace["workspace_slug"], "acme");
        assert_eq!(workspace["repo_fetch_error"], "boom");
        assert!(workspace.get("repo_errors").is_none());
    }

    #[test]
    fn nested_is_empty_rolls_up() {
        let mut repo_error = RepoError {
            repo_id: "api".into(),
            ..RepoError::default()
        };
        assert!(repo_error.is_empty());

        repo_error.pr_errors.push(PrError {
            pr_id: 7,
            commit_fetch_error: "timeout".into(),
            ..PrError::default()
        });
        assert!(!repo_error.is_empty());
        assert!(!repo_error.pr_errors[0].is_empty());
    }

    #[test]
    fn activity_payload_uses_wire_field_names() {
        let data = ActivityData {
            workspace_key: "acme".into(),
            repos: vec![RepoRecord {
                slug: "api".into(),
                name: "API".into(),
                id: "{u}".into(),
                is_public: true,
                link: "https://bitbucket.org/acme/api".into(),
                commits: vec![],
                prs: vec![],
            }],
        };

        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["workspaceKey"], "acme");
        assert_eq!(json["repos"][0]["isPublic"], true);
        assert!(json["repos"][0].get("commits").is_some());
    }
}
