//! Bitbucket Cloud API response shapes.
//!
//! Field names follow the provider's JSON; everything the worker does not
//! read is simply not modeled.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The page envelope every list endpoint returns. `next` is the absolute
/// URL of the following page, absent on the last one.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct Paginated<T> {
    #[serde(default)]
    pub values: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workspace {
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "uuid", default)]
    pub id: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub html: Link,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub href: String,
}

pub const PR_STATE_OPEN: &str = "OPEN";

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: String,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default)]
    pub reviewers: Vec<User>,
    pub source: BranchRef,
    pub destination: BranchRef,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BranchRef {
    #[serde(default)]
    pub branch: Branch,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: CommitAuthor,
    pub date: DateTime<Utc>,
}

/// Commit authorship: `raw` is the committer line from git, `user` the
/// Bitbucket account when one could be matched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginated_page_parses_with_next_link() {
        let json = r#"{
            "values": [{"slug": "ws-one", "name": "Workspace One"}],
            "next": "https://api.bitbucket.org/2.0/workspaces?page=2"
        }"#;
        let page: Paginated<Workspace> = serde_json::from_str(json).unwrap();
        assert_eq!(page.values.len(), 1);
        assert_eq!(page.values[0].slug, "ws-one");
        assert!(page.next.is_some());
    }

    #[test]
    fn paginated_last_page_has_no_next() {
        let json = r#"{"values": []}"#;
        let page: Paginated<Workspace> = serde_json::from_str(json).unwrap();
        assert!(page.values.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn repository_maps_uuid_to_id() {
        let json = r#"{
            "slug": "api",
            "name": "API",
            "uuid": "{1234}",
            "is_private": true,
            "links": {"html": {"href": "https://bitbucket.org/acme/api"}}
        }"#;
        let repo: Repository = serde_json::from_str(json).unwrap();
        assert_eq!(repo.id, "{1234}");
        assert!(repo.is_private);
        assert_eq!(repo.links.html.href, "https://bitbucket.org/acme/api");
    }

    #[test]
    fn commit_parses_without_matched_user() {
        let json = r#"{
            "hash": "abc123",
            "message": "fix",
            "author": {"raw": "Jo Doe <jo@example.com>"},
            "date": "2025-03-01T10:00:00+00:00"
        }"#;
        let commit: Commit = serde_json::from_str(json).unwrap();
        assert!(commit.author.user.is_none());
        assert_eq!(commit.author.raw, "Jo Doe <jo@example.com>");
    }
}
