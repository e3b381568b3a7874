//! Lifecycle operations for tracked repositories.
//!
//! Each repository moves through validating → hooks-initializing →
//! initializing → ready, with error as the terminal for anything
//! unrecoverable:
//!
//! ```text
//!   [validating]
//!     |  (validate credential scopes and repo access)
//!     v
//!   [hooks initializing]
//!     |  (create the webhook, then receive its ping)
//!     v
//!   [initializing]
//!     |  (mirror the pull requests and statuses)
//!     v
//!   [ready] <---+
//!     |         |  (any webhook delivery re-mirrors)
//!     +---------+
//! ```
//!
//! Every operation is idempotent, so the startup sweep can safely re-run
//! whatever a previous process abandoned mid-flight.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use mirror_core::merge::{write_new_reports, write_new_reviews};

use crate::db::{RepoState, StoreError};
use crate::fetch::{get_all_pull_requests, get_all_statuses, retry, MAX_RETRIES_LIVE};
use crate::git::{clone_repo, sync_notes, GitIdentity};
use crate::github::GitHubClient;
use crate::store::RepoStore;

pub const EVENT_PING: &str = "ping";
pub const EVENT_STATUS: &str = "status";
pub const EVENT_PULL_REQUEST: &str = "pull_request";
pub const EVENT_DIFF_COMMENT: &str = "pull_request_review_comment";
pub const EVENT_ISSUE_COMMENT: &str = "issue_comment";

const HOOK_EVENTS: &[&str] = &[
    EVENT_PING,
    EVENT_STATUS,
    EVENT_PULL_REQUEST,
    EVENT_DIFF_COMMENT,
    EVENT_ISSUE_COMMENT,
];

const SECRET_SIZE: usize = 64;

/// Everything the lifecycle operations need; shared by the webhook and
/// admin surfaces.
pub struct OpsContext {
    pub store: RepoStore,
    pub http: reqwest::Client,
    /// Public host webhook URLs are formed under.
    pub external_host: String,
    pub git_identity: GitIdentity,
}

impl OpsContext {
    pub fn github_client(&self, token: &str) -> GitHubClient {
        GitHubClient::new(self.http.clone(), Some(token.to_string()))
    }
}

/// Record a terminal failure: log it and move the repository to the error
/// state with the cause. If even that fails, the log line is all we have.
pub async fn fail_repo(ctx: &OpsContext, owner: &str, name: &str, cause: String) {
    error!("{}/{}: {}", owner, name, cause);
    let stored_cause = cause.clone();
    if let Err(e) = ctx
        .store
        .update(owner, name, move |record| {
            record.state = RepoState::Error;
            record.error_cause = stored_cause;
        })
        .await
    {
        error!("Can't set repo error status for {}/{}: {}", owner, name, e);
    }
}

fn load_failure(context: &str, result: Result<Option<crate::db::RepoRecord>, StoreError>) -> Result<crate::db::RepoRecord, String> {
    match result {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(format!("{}: record missing", context)),
        Err(e) => Err(format!("{}: {}", context, e)),
    }
}

/// Which scopes a granted-scopes header is missing, if any. The header is
/// comma-space delimited; `admin:repo_hook` subsumes `write:repo_hook`.
fn missing_scopes(header: &str) -> Option<&'static str> {
    let mut has_repo = false;
    let mut has_hook_scope = false;
    for scope in header.split(", ") {
        match scope {
            "repo" => has_repo = true,
            "write:repo_hook" | "admin:repo_hook" => has_hook_scope = true,
            _ => {}
        }
    }
    match (has_repo, has_hook_scope) {
        (true, true) => None,
        (false, false) => Some("repo, write:repo_hook"),
        (false, true) => Some("repo"),
        (true, false) => Some("write:repo_hook"),
    }
}

/// Confirm the stored credential can see the repository and carries the
/// scopes hook creation will need, then hand off to hook creation.
pub async fn validate(ctx: Arc<OpsContext>, owner: String, name: String) {
    info!("Validating repo {}/{}", owner, name);

    let record = match load_failure(
        "Can't load repo to validate",
        ctx.store.get(&owner, &name).await,
    ) {
        Ok(record) => record,
        Err(cause) => return fail_repo(&ctx, &owner, &name, cause).await,
    };
    let client = ctx.github_client(&record.token);

    let scopes_header = match retry(MAX_RETRIES_LIVE, || client.granted_scopes()).await {
        Ok(header) => header,
        Err(e) => {
            let cause = format!("Can't validate repo {}/{}: {}", owner, name, e);
            return fail_repo(&ctx, &owner, &name, cause).await;
        }
    };

    // No scopes header means the token only reaches public data; require
    // the real thing.
    let Some(header) = scopes_header else {
        let cause = "Invalid token, missing scopes: `repo`, `write:repo_hook`".to_string();
        return fail_repo(&ctx, &owner, &name, cause).await;
    };
    if let Some(missing) = missing_scopes(&header) {
        let cause = format!(
            "Invalid token for {}/{}, missing scopes: {}",
            owner, name, missing
        );
        return fail_repo(&ctx, &owner, &name, cause).await;
    }

    if let Err(e) = retry(MAX_RETRIES_LIVE, || client.get_repository(&owner, &name)).await {
        let cause = format!("Can't validate repo {}/{}: {}", owner, name, e);
        return fail_repo(&ctx, &owner, &name, cause).await;
    }
    info!("Validated repo {}/{}", owner, name);

    if let Err(e) = ctx
        .store
        .update(&owner, &name, |record| {
            record.state = RepoState::HooksInitializing;
        })
        .await
    {
        let cause = format!("Can't change repo status: {}", e);
        return fail_repo(&ctx, &owner, &name, cause).await;
    }

    tokio::spawn(create_hooks(ctx, owner, name));
}

/// Create the repository webhook with a fresh shared secret and persist
/// both. The repository then waits in hooks-initializing until the
/// provider's ping arrives.
pub async fn create_hooks(ctx: Arc<OpsContext>, owner: String, name: String) {
    let record = match load_failure(
        "Can't load repo to hook",
        ctx.store.get(&owner, &name).await,
    ) {
        Ok(record) => record,
        Err(cause) => return fail_repo(&ctx, &owner, &name, cause).await,
    };
    let client = ctx.github_client(&record.token);

    let mut secret = vec![0u8; SECRET_SIZE];
    OsRng.fill_bytes(&mut secret);
    let secret_hex = hex::encode(&secret);

    let hook_url = format!("https://{}/hook/{}/{}", ctx.external_host, owner, name);
    let hook = match retry(MAX_RETRIES_LIVE, || {
        client.create_hook(&owner, &name, HOOK_EVENTS, &hook_url, &secret_hex)
    })
    .await
    {
        Ok(hook) => hook,
        Err(e) => {
            let cause = format!("Can't create hook: {}", e);
            return fail_repo(&ctx, &owner, &name, cause).await;
        }
    };
    let Some(hook_id) = hook.id else {
        return fail_repo(&ctx, &owner, &name, "No hook ID for new hook".to_string()).await;
    };
    info!("Hook creation for {}/{} successful", owner, name);

    if let Err(e) = ctx
        .store
        .update(&owner, &name, move |record| {
            record.hook_id = Some(hook_id);
            record.hook_secret = Some(secret_hex);
        })
        .await
    {
        let cause = format!("Can't store hook for repo: {}", e);
        return fail_repo(&ctx, &owner, &name, cause).await;
    }

    info!("Repo waiting for hook ping: {}/{}", owner, name);
}

/// The bulk mirror: clone, read everything, reconcile into notes, push,
/// and advance to ready. Safe to re-run at any time; the reconciler only
/// appends material that is not already present.
pub async fn initialize(ctx: Arc<OpsContext>, owner: String, name: String) {
    let record = match load_failure(
        "Can't load repo to initialize",
        ctx.store.get(&owner, &name).await,
    ) {
        Ok(record) => record,
        Err(cause) => return fail_repo(&ctx, &owner, &name, cause).await,
    };

    let repo = match clone_repo(&owner, &name, &record.token, &ctx.git_identity).await {
        Ok(repo) => repo,
        Err(e) => {
            let cause = format!("Can't clone repo: {}", e);
            return fail_repo(&ctx, &owner, &name, cause).await;
        }
    };
    let client = ctx.github_client(&record.token);

    // Per-record failures flow here while the fetchers keep going; the
    // consumer just counts and logs them.
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1000);
    let err_owner = owner.clone();
    let err_name = name.clone();
    let error_counter = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(e) = err_rx.recv().await {
            error!("{}/{}: {:#}", err_owner, err_name, e);
            count += 1;
        }
        count
    });

    let statuses = match get_all_statuses(&client, &owner, &name, MAX_RETRIES_LIVE, &err_tx).await {
        Ok(statuses) => statuses,
        Err(e) => {
            let cause = format!("Can't get statuses: {}", e);
            return fail_repo(&ctx, &owner, &name, cause).await;
        }
    };
    let reviews =
        match get_all_pull_requests(&client, &owner, &name, &repo, MAX_RETRIES_LIVE, &err_tx).await
        {
            Ok(reviews) => reviews,
            Err(e) => {
                let cause = format!("Can't get PRs: {}", e);
                return fail_repo(&ctx, &owner, &name, cause).await;
            }
        };
    drop(err_tx);
    let record_errors = error_counter.await.unwrap_or(0);

    let (log_tx, mut log_rx) = mpsc::channel::<String>(1000);
    let log_task = tokio::spawn(async move {
        while let Some(message) = log_rx.recv().await {
            info!("{}", message);
        }
    });

    info!(
        "Done reading! Read {} statuses, {} PRs",
        statuses.len(),
        reviews.len()
    );
    info!("Committing...");
    if let Err(e) = write_new_reports(&statuses, &repo, &log_tx).await {
        return fail_repo(&ctx, &owner, &name, e.to_string()).await;
    }
    if let Err(e) = write_new_reviews(&reviews, &repo, &log_tx).await {
        return fail_repo(&ctx, &owner, &name, e.to_string()).await;
    }
    drop(log_tx);
    let _ = log_task.await;

    if let Err(e) = sync_notes(&repo).await {
        let cause = format!(
            "Error pushing initialization changes for {}/{}: {}",
            owner, name, e
        );
        return fail_repo(&ctx, &owner, &name, cause).await;
    }
    info!(
        "Success initializing {}/{} ({} per-record errors)",
        owner, name, record_errors
    );

    if let Err(e) = ctx
        .store
        .update(&owner, &name, |record| {
            record.state = RepoState::Ready;
            record.error_cause.clear();
        })
        .await
    {
        let cause = format!("Can't change repo status for {}/{}: {}", owner, name, e);
        fail_repo(&ctx, &owner, &name, cause).await;
    }
}

/// Delete the provider-side webhook (best effort) and forget the record.
pub async fn deactivate(ctx: Arc<OpsContext>, owner: String, name: String) {
    let record = match load_failure(
        "Can't load repo to deactivate",
        ctx.store.get(&owner, &name).await,
    ) {
        Ok(record) => record,
        Err(cause) => return fail_repo(&ctx, &owner, &name, cause).await,
    };

    if let Some(hook_id) = record.hook_id {
        let client = ctx.github_client(&record.token);
        info!("Deleting hook for repository {}/{}", owner, name);
        match retry(MAX_RETRIES_LIVE, || client.delete_hook(&owner, &name, hook_id)).await {
            // Keep going; the record should be deleted regardless.
            Err(e) => error!("Can't delete webhook for {}/{}: {}", owner, name, e),
            Ok(()) => info!("Deleted hook for repository {}/{}", owner, name),
        }
    }

    info!("Deleting repository data for {}/{}", owner, name);
    if let Err(e) = ctx.store.delete(&owner, &name).await {
        fail_repo(
            &ctx,
            &owner,
            &name,
            format!("Can't delete repository data: {}", e),
        )
        .await;
    }
}

#[derive(Debug, Deserialize)]
struct PingPayload {
    zen: Option<String>,
    hook_id: Option<u64>,
}

/// The provider pings every hook once after creation; that ping is what
/// moves the repository into initializing.
pub async fn handle_ping(ctx: Arc<OpsContext>, owner: String, name: String, body: Vec<u8>) {
    let payload: PingPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            let cause = format!("Can't parse payload for ping hook: {}", e);
            return fail_repo(&ctx, &owner, &name, cause).await;
        }
    };
    info!(
        "Hook ping for {}/{} (hook {:?}): {:?}",
        owner, name, payload.hook_id, payload.zen
    );

    if let Err(e) = ctx
        .store
        .update(&owner, &name, |record| {
            record.state = RepoState::Initializing;
        })
        .await
    {
        error!("Can't set repo {}/{} to initializing: {}", owner, name, e);
    }

    initialize(ctx, owner, name).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    Skip,
    Validate,
    CreateHooks,
    Initialize,
}

/// What the startup sweep should do for a record found in a given state.
/// Initializing is re-run rather than just logged: the bulk mirror is
/// idempotent, and skipping it would strand a half-mirrored repository.
pub fn plan_restart(state: RepoState) -> RestartAction {
    match state {
        RepoState::Ready | RepoState::Error => RestartAction::Skip,
        RepoState::Validating => RestartAction::Validate,
        RepoState::HooksInitializing => RestartAction::CreateHooks,
        RepoState::Initializing => RestartAction::Initialize,
    }
}

/// Re-drive whatever a previous process left unfinished. Runs once at
/// startup, before the server accepts requests.
pub async fn restart_abandoned_operations(ctx: Arc<OpsContext>) {
    info!("Restarting abandoned operations...");
    let records = match ctx.store.list_all().await {
        Ok(records) => records,
        Err(e) => {
            error!("Can't load repos: {}", e);
            return;
        }
    };

    for record in records {
        let state = record.state;
        let owner = record.owner;
        let name = record.name;
        match plan_restart(state) {
            RestartAction::Skip => info!("Repo {}: {}/{}", state, owner, name),
            RestartAction::Validate => {
                info!("Repo requires validation: {}/{}", owner, name);
                tokio::spawn(validate(ctx.clone(), owner, name));
            }
            RestartAction::CreateHooks => {
                info!("Repo requires hook initialization: {}/{}", owner, name);
                tokio::spawn(create_hooks(ctx.clone(), owner, name));
            }
            RestartAction::Initialize => {
                info!("Repo requires initialization: {}/{}", owner, name);
                tokio::spawn(initialize(ctx.clone(), owner, name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, RepoRecord};

    #[test]
    fn missing_scopes_accepts_the_required_pair() {
        assert_eq!(missing_scopes("repo, write:repo_hook"), None);
        assert_eq!(missing_scopes("gist, repo, write:repo_hook, user"), None);
    }

    #[test]
    fn missing_scopes_accepts_admin_hook_as_superset() {
        assert_eq!(missing_scopes("repo, admin:repo_hook"), None);
    }

    #[test]
    fn missing_scopes_reports_what_is_absent() {
        assert_eq!(missing_scopes("repo"), Some("write:repo_hook"));
        assert_eq!(missing_scopes("write:repo_hook"), Some("repo"));
        assert_eq!(missing_scopes("gist"), Some("repo, write:repo_hook"));
        assert_eq!(missing_scopes(""), Some("repo, write:repo_hook"));
    }

    #[test]
    fn missing_scopes_requires_comma_space_delimiting() {
        // The provider delimits with ", "; a bare comma is one unknown scope.
        assert_eq!(
            missing_scopes("repo,write:repo_hook"),
            Some("repo, write:repo_hook")
        );
    }

    #[test]
    fn plan_restart_matches_lifecycle() {
        assert_eq!(plan_restart(RepoState::Ready), RestartAction::Skip);
        assert_eq!(plan_restart(RepoState::Error), RestartAction::Skip);
        assert_eq!(plan_restart(RepoState::Validating), RestartAction::Validate);
        assert_eq!(
            plan_restart(RepoState::HooksInitializing),
            RestartAction::CreateHooks
        );
        assert_eq!(
            plan_restart(RepoState::Initializing),
            RestartAction::Initialize
        );
    }

    /// The sweep over a store with one record in each state plans exactly
    /// one validation and one hook creation, and nothing for the
    /// terminal states.
    #[test]
    fn restart_sweep_plan_over_store() {
        let db = Db::new_in_memory().unwrap();
        let states = [
            ("a", RepoState::Ready),
            ("b", RepoState::Error),
            ("c", RepoState::Validating),
            ("d", RepoState::HooksInitializing),
        ];
        for (name, state) in states {
            let mut record =
                RepoRecord::new("owner".to_string(), name.to_string(), "token".to_string());
            record.state = state;
            db.insert_new(&record).unwrap();
        }

        let actions: Vec<RestartAction> = db
            .list_all()
            .unwrap()
            .into_iter()
            .map(|record| plan_restart(record.state))
            .collect();

        assert_eq!(
            actions
                .iter()
                .filter(|a| **a == RestartAction::Validate)
                .count(),
            1
        );
        assert_eq!(
            actions
                .iter()
                .filter(|a| **a == RestartAction::CreateHooks)
                .count(),
            1
        );
        assert_eq!(
            actions
                .iter()
                .filter(|a| **a == RestartAction::Skip)
                .count(),
            2
        );
    }
}
