//! Wire types for the GitHub records we mirror.
//!
//! Every field GitHub may omit is an `Option`, so the conversion layer can
//! check its preconditions explicitly instead of trusting the payload.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: Option<String>,
}

/// One commit status as returned by the statuses endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoStatus {
    pub state: Option<String>,
    pub target_url: Option<String>,
    pub context: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestBranch {
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
    pub sha: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequest {
    pub number: Option<u64>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub user: Option<User>,
    pub base: Option<PullRequestBranch>,
    pub head: Option<PullRequestBranch>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A comment on the issue half of a pull request. Carries no location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueComment {
    pub body: Option<String>,
    pub user: Option<User>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A comment anchored in the diff of a pull request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequestComment {
    pub body: Option<String>,
    pub user: Option<User>,
    pub path: Option<String>,
    pub original_commit_id: Option<String>,
    pub diff_hunk: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitObject {
    pub sha: Option<String>,
}

/// One entry from the git refs listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
    pub object: Option<GitObject>,
}

/// A repository webhook, as returned by the hook-creation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    pub id: Option<u64>,
}

impl User {
    pub fn with_login(login: &str) -> Self {
        Self {
            login: Some(login.to_string()),
        }
    }
}
