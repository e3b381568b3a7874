//! The paged, rate-limited pipeline that reads every record for a
//! repository.
//!
//! The shape mirrors the provider's API: list endpoints are paged, and
//! every response reports the remaining quota. [`retry`] absorbs quota
//! exhaustion by sleeping until the reported reset; [`fetch_all_pages`]
//! walks a list endpoint from page one to the last page the provider
//! advertises; the fetchers compose the two and convert as they go.
//!
//! Failures are split two ways: a failure that prevents all progress (a
//! page that cannot be read) aborts the fetcher, while a failure scoped to
//! one record (an unconvertible status, one pull request whose comments
//! cannot be listed) is forwarded to the error channel and that record is
//! dropped.

use std::collections::HashMap;
use std::future::Future;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info};

use mirror_core::convert::{convert_status, pull_request_to_review};
use mirror_core::notes::{Report, Review};
use mirror_core::repository::Repository;

use crate::github::{ApiError, GitHubApi, ListOptions, Page};

/// Retry ceiling for the hosted supervisor.
pub const MAX_RETRIES_LIVE: usize = 200;
/// Retry ceiling for the batch tool.
pub const MAX_RETRIES_BATCH: usize = 100;

const PER_PAGE: u32 = 100;

/// Run `f` until it succeeds or fails for a reason other than quota
/// exhaustion. Quota waits advance the attempt counter, so the total time
/// spent sleeping is bounded by `max_retries` reset windows.
pub async fn retry<T, F, Fut>(max_retries: usize, mut f: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    for _ in 0..max_retries {
        match f().await {
            Err(ApiError::RateLimited { reset }) => {
                let wait = (reset - Utc::now()).to_std().unwrap_or_default();
                info!(
                    "Ran out of GitHub API requests; sleeping {:?} (until {})",
                    wait, reset
                );
                tokio::time::sleep(wait).await;
            }
            other => return other,
        }
    }
    error!("Too many retries, abandoning operation");
    Err(ApiError::TooManyRetries(max_retries))
}

/// Drive a list endpoint across every page it advertises, collecting the
/// items. Each page read goes through [`retry`].
pub async fn fetch_all_pages<T, F, Fut>(max_retries: usize, mut fetch: F) -> Result<Vec<T>, ApiError>
where
    F: FnMut(ListOptions) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Page), ApiError>>,
{
    let mut results = Vec::new();
    let mut page = 1;
    let mut max_page = 1;
    while page <= max_page {
        let opts = ListOptions {
            page,
            per_page: PER_PAGE,
        };
        let (mut items, meta) = retry(max_retries, || fetch(opts)).await?;
        results.append(&mut items);
        max_page = meta.last_page;
        page += 1;
    }
    Ok(results)
}

/// Head commit of every ref in the remote repository, in listing order.
pub async fn remote_head_commits(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    max_retries: usize,
) -> Result<Vec<String>, ApiError> {
    let refs = fetch_all_pages(max_retries, |opts| api.list_refs(owner, repo, opts)).await?;
    Ok(refs
        .into_iter()
        .filter_map(|r| r.object.and_then(|o| o.sha))
        .collect())
}

/// Read the statuses of every head commit and convert them to CI reports,
/// keyed by commit. Statuses that fail conversion go to the error channel.
pub async fn get_all_statuses(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    max_retries: usize,
    errors: &mpsc::Sender<anyhow::Error>,
) -> Result<HashMap<String, Vec<Report>>, ApiError> {
    if owner.is_empty() || repo.is_empty() {
        return Err(ApiError::InvalidRemoteRepo);
    }
    let commits = remote_head_commits(api, owner, repo, max_retries).await?;

    let mut reports_by_commit = HashMap::new();
    for sha in commits {
        let statuses =
            fetch_all_pages(max_retries, |opts| api.list_statuses(owner, repo, &sha, opts)).await?;
        let mut reports = Vec::new();
        for status in &statuses {
            match convert_status(status) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    let _ = errors.send(e.into()).await;
                }
            }
        }
        reports_by_commit.insert(sha, reports);
    }
    Ok(reports_by_commit)
}

async fn fetch_comments(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    number: u64,
    max_retries: usize,
) -> Result<
    (
        Vec<mirror_core::github::IssueComment>,
        Vec<mirror_core::github::PullRequestComment>,
    ),
    ApiError,
> {
    let issue_comments = fetch_all_pages(max_retries, |opts| {
        api.list_issue_comments(owner, repo, number, opts)
    })
    .await?;
    let diff_comments = fetch_all_pages(max_retries, |opts| {
        api.list_diff_comments(owner, repo, number, opts)
    })
    .await?;
    Ok((issue_comments, diff_comments))
}

/// Read every pull request (open and closed) with its comments and convert
/// each into a review. A failure scoped to one pull request drops only that
/// pull request, reported on the error channel.
pub async fn get_all_pull_requests(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    local: &dyn Repository,
    max_retries: usize,
    errors: &mpsc::Sender<anyhow::Error>,
) -> Result<Vec<Review>, ApiError> {
    if owner.is_empty() || repo.is_empty() {
        return Err(ApiError::InvalidRemoteRepo);
    }
    let prs = fetch_all_pages(max_retries, |opts| api.list_pulls(owner, repo, opts)).await?;

    let mut reviews = Vec::new();
    for pr in &prs {
        let Some(number) = pr.number else {
            let _ = errors
                .send(mirror_core::ConvertError::InsufficientInfo.into())
                .await;
            continue;
        };
        match fetch_comments(api, owner, repo, number, max_retries).await {
            Err(e) => {
                let _ = errors.send(e.into()).await;
            }
            Ok((issue_comments, diff_comments)) => {
                match pull_request_to_review(pr, &issue_comments, &diff_comments, local).await {
                    Ok(review) => reviews.push(review),
                    Err(e) => {
                        let _ = errors.send(e).await;
                    }
                }
            }
        }
    }
    Ok(reviews)
}
