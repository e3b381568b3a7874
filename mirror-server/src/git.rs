//! The local clone: subprocess plumbing around `git`, and the notes
//! synchronization loop.
//!
//! Notes are pulled with a union merge (`cat_sort_uniq`) so concurrent
//! mirror passes converge: a pass that loses a push race pulls, re-merges
//! and pushes again, up to a bounded number of attempts, without any
//! cross-process locking.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::info;

use mirror_core::repository::Repository;

pub const REMOTE_NAME: &str = "origin";
pub const NOTES_REF_PATTERN: &str = "refs/notes/devtools/*";
const PULL_REFS_SPEC: &str = "+refs/pull/*:refs/pull/*";
const SYNC_RETRY_ATTEMPTS: usize = 10;

/// Author identity configured into every clone the mirror writes through.
#[derive(Debug, Clone)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// A working tree the mirror can read and append notes in. When the tree
/// was cloned into a temp directory, the directory lives exactly as long
/// as this handle.
pub struct GitRepo {
    dir: PathBuf,
    _tempdir: Option<TempDir>,
}

impl GitRepo {
    /// Open an existing local clone.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let repo = Self {
            dir: dir.into(),
            _tempdir: None,
        };
        repo.git(&["rev-parse", "--git-dir"])
            .await
            .context("not a git repository")?;
        Ok(repo)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        run_git(Some(&self.dir), args).await
    }
}

async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut command = Command::new("git");
    command.args(args);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    let output = command
        .output()
        .await
        .with_context(|| format!("failed to execute git {}", args.first().unwrap_or(&"")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Clone `owner/name` into a fresh temp directory, pull its review notes,
/// fetch the pull-request refs, and configure the mirror's author identity.
pub async fn clone_repo(
    owner: &str,
    name: &str,
    token: &str,
    identity: &GitIdentity,
) -> Result<GitRepo> {
    let tempdir = tempfile::Builder::new()
        .prefix(&format!("{}-{}-", owner, name))
        .tempdir()
        .context("failed to create temp directory for clone")?;
    let dir = tempdir.path().to_path_buf();

    let url = format!("https://{}:{}@github.com/{}/{}", owner, token, owner, name);
    let output = Command::new("git")
        .args(["clone", &url, &dir.to_string_lossy()])
        .output()
        .await
        .context("failed to execute git clone")?;
    if !output.status.success() {
        // The URL embeds the access token; report only what git said.
        bail!(
            "git clone of {}/{} failed: {}",
            owner,
            name,
            String::from_utf8_lossy(&output.stderr)
                .replace(token, "<token>")
                .trim()
        );
    }

    let repo = GitRepo {
        dir,
        _tempdir: Some(tempdir),
    };
    repo.pull_notes(REMOTE_NAME, NOTES_REF_PATTERN).await?;
    repo.git(&["fetch", REMOTE_NAME, PULL_REFS_SPEC]).await?;
    repo.git(&["config", "--local", "--add", "user.name", &identity.name])
        .await?;
    repo.git(&["config", "--local", "--add", "user.email", &identity.email])
        .await?;
    Ok(repo)
}

/// Where fetched copies of remote notes refs land before merging:
/// `refs/notes/devtools/*` becomes `refs/notes/<remote>/devtools/*`.
fn tracking_pattern(remote: &str, ref_pattern: &str) -> Option<String> {
    ref_pattern
        .strip_prefix("refs/notes/")
        .map(|rest| format!("refs/notes/{}/{}", remote, rest))
}

#[async_trait]
impl Repository for GitRepo {
    async fn get_notes(&self, notes_ref: &str, revision: &str) -> Result<Vec<u8>> {
        // A commit with no notes is an empty blob, not a failure.
        match self
            .git(&["notes", "--ref", notes_ref, "show", revision])
            .await
        {
            Ok(output) => Ok(output.into_bytes()),
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn append_note(&self, notes_ref: &str, revision: &str, note: &[u8]) -> Result<()> {
        let message = std::str::from_utf8(note).context("note is not valid UTF-8")?;
        self.git(&[
            "notes",
            "--ref",
            notes_ref,
            "append",
            "--allow-empty",
            "-m",
            message,
            revision,
        ])
        .await?;
        Ok(())
    }

    async fn pull_notes(&self, remote: &str, ref_pattern: &str) -> Result<()> {
        let tracking = tracking_pattern(remote, ref_pattern)
            .ok_or_else(|| anyhow!("unsupported notes ref pattern: {}", ref_pattern))?;
        self.git(&[
            "fetch",
            remote,
            &format!("+{}:{}", ref_pattern, tracking),
        ])
        .await?;

        // Union-merge every fetched notes ref into its local counterpart.
        let tracking_prefix = tracking.trim_end_matches('*').to_string();
        let local_prefix = ref_pattern.trim_end_matches('*').to_string();
        let fetched = self
            .git(&["for-each-ref", "--format=%(refname)", &tracking_prefix])
            .await?;
        for remote_ref in fetched.lines().filter(|line| !line.is_empty()) {
            let suffix = remote_ref
                .strip_prefix(&tracking_prefix)
                .ok_or_else(|| anyhow!("unexpected fetched ref: {}", remote_ref))?;
            let local_ref = format!("{}{}", local_prefix, suffix);
            self.git(&[
                "notes",
                "--ref",
                &local_ref,
                "merge",
                "-s",
                "cat_sort_uniq",
                remote_ref,
            ])
            .await?;
        }
        Ok(())
    }

    async fn push_notes(&self, remote: &str, ref_pattern: &str) -> Result<()> {
        self.git(&["push", remote, ref_pattern]).await?;
        Ok(())
    }

    async fn list_commits_between(&self, base: &str, head: &str) -> Result<Vec<String>> {
        let output = self
            .git(&["rev-list", "--reverse", &format!("{}..{}", base, head)])
            .await?;
        Ok(output
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect())
    }
}

/// Converge local and remote notes: pull, then push, retrying the pair
/// when a concurrent writer wins the race.
pub async fn sync_notes(repo: &GitRepo) -> Result<()> {
    let mut last_error = None;
    for attempt in 0..SYNC_RETRY_ATTEMPTS {
        match repo.pull_notes(REMOTE_NAME, NOTES_REF_PATTERN).await {
            Err(e) => last_error = Some(e),
            Ok(()) => match repo.push_notes(REMOTE_NAME, NOTES_REF_PATTERN).await {
                Err(e) => last_error = Some(e),
                Ok(()) => {
                    if attempt > 0 {
                        info!("Notes sync succeeded after {} retries", attempt);
                    }
                    return Ok(());
                }
            },
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("notes sync failed")))
}
