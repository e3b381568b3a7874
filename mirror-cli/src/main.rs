//! One-shot mirror of a GitHub repository's review metadata into an
//! existing local clone.
//!
//! Clone the repository yourself (including the pull-request refs) before
//! running the tool:
//!
//! ```text
//! git clone https://github.com/example_org/example_repo example_repo/
//! cd example_repo
//! git fetch origin '+refs/pull/*:refs/pull/*'
//! mirror-cli --target example_org/example_repo --local ./ --auth-token <TOKEN>
//! ```
//!
//! The token is optional but strongly recommended: unauthenticated API
//! access is limited to 60 requests per hour.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::Level;

use mirror_core::merge::{write_new_reports, write_new_reviews};
use mirror_server::fetch::{get_all_pull_requests, get_all_statuses, MAX_RETRIES_BATCH};
use mirror_server::git::GitRepo;
use mirror_server::github::{create_http_client, GitHubClient};

const TOKEN_HELP: &str = "You can generate a token at: https://github.com/settings/tokens
Note that the 'public_repo' scope is needed for public repositories,
and the 'repo' scope is needed for private repositories.";

/// Mirror GitHub pull-request metadata into git notes on a local clone.
#[derive(Parser, Debug)]
#[command(name = "mirror-cli")]
#[command(about = "Mirror GitHub pull-request metadata into git notes", long_about = None)]
struct Cli {
    /// GitHub repository to read data from, in the format `owner/repo`
    #[arg(long)]
    target: String,

    /// Local repository to write notes to
    #[arg(long, default_value = ".")]
    local: PathBuf,

    /// GitHub OAuth token with either the `repo` or `public_repo` scope
    #[arg(long)]
    auth_token: Option<String>,

    /// Don't log progress to stdout
    #[arg(long)]
    quiet: bool,
}

async fn run(cli: Cli) -> Result<usize> {
    let (owner, name) = cli
        .target
        .split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty())
        .ok_or_else(|| anyhow!("Target repository is required, in the format `owner/repo'"))?;

    let local = GitRepo::open(&cli.local)
        .await
        .context("Couldn't open local repository; clone the remote repository locally first")?;

    if cli.auth_token.is_none() {
        eprintln!("Not using authentication. Note that this will be EXTREMELY SLOW;");
        eprintln!("you get 60 requests to the GitHub API per hour.");
        eprintln!("{}", TOKEN_HELP);
    }
    let client = GitHubClient::new(create_http_client(), cli.auth_token.clone());

    if cli.auth_token.is_some() {
        if let Err(e) = client.current_user().await {
            eprintln!("Token error: {}", e);
            eprintln!("{}", TOKEN_HELP);
            return Err(anyhow!("invalid auth token"));
        }
    }

    client
        .get_repository(owner, name)
        .await
        .context("Error fetching repository info")?;

    let quiet = cli.quiet;
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1000);
    let error_counter = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(e) = err_rx.recv().await {
            if !quiet {
                eprintln!("{:#}", e);
            }
            count += 1;
        }
        count
    });

    let statuses = get_all_statuses(&client, owner, name, MAX_RETRIES_BATCH, &err_tx)
        .await
        .context("Error reading statuses")?;
    let reviews = get_all_pull_requests(&client, owner, name, &local, MAX_RETRIES_BATCH, &err_tx)
        .await
        .context("Error reading pull requests")?;
    drop(err_tx);
    let errors = error_counter.await.unwrap_or(0);

    let (log_tx, mut log_rx) = mpsc::channel::<String>(1000);
    let log_task = tokio::spawn(async move {
        while let Some(message) = log_rx.recv().await {
            if !quiet {
                println!("{}", message);
            }
        }
    });

    if !quiet {
        println!(
            "Done reading! Read {} statuses, {} PRs",
            statuses.len(),
            reviews.len()
        );
        println!("Committing...");
    }
    write_new_reports(&statuses, &local, &log_tx).await?;
    write_new_reviews(&reviews, &local, &log_tx).await?;
    drop(log_tx);
    let _ = log_task.await;

    if !quiet {
        println!("Done! Hit {} errors", errors);
    }
    Ok(errors)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(Level::WARN).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
