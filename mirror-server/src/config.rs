use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Public host the provider delivers webhooks to; hook URLs are formed
    /// as `https://<external_host>/hook/<owner>/<repo>`.
    pub external_host: String,
    /// Bearer token guarding the admin endpoints.
    /// If not set, the admin surface is disabled (returns 403 Forbidden).
    pub admin_auth_token: Option<String>,
    /// Author identity configured into every clone the mirror writes.
    pub git_user_name: String,
    pub git_user_email: String,
}

/// Read an optional config value.
///
/// For a key like "ADMIN_AUTH_TOKEN":
/// 1. Check if ADMIN_AUTH_TOKEN_FILE is set - if so, read from that file
///    path (errors if the file is unreadable)
/// 2. Otherwise, check the ADMIN_AUTH_TOKEN env var directly
/// 3. Returns None if neither is set, or if the value is empty/whitespace-only
fn read_secret_optional(key: &str) -> Result<Option<String>> {
    let file_key = format!("{}_FILE", key);

    let value = if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        Some(contents)
    } else {
        env::var(key).ok()
    };

    Ok(value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let external_host =
            env::var("EXTERNAL_HOST").context("EXTERNAL_HOST environment variable is required")?;

        let admin_auth_token = read_secret_optional("ADMIN_AUTH_TOKEN")?;

        let git_user_name =
            env::var("GIT_USER_NAME").unwrap_or_else(|_| "Github Mirror".to_string());
        let git_user_email = env::var("GIT_USER_EMAIL")
            .unwrap_or_else(|_| format!("mirror@{}", external_host));

        Ok(Config {
            port,
            state_dir,
            external_host,
            admin_auth_token,
            git_user_name,
            git_user_email,
        })
    }
}
