pub mod admin;
pub mod config;
pub mod db;
pub mod fetch;
pub mod git;
pub mod github;
pub mod operations;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use operations::OpsContext;

pub struct AppState {
    pub ops: Arc<OpsContext>,
    /// Bearer token guarding the admin endpoints; `None` disables them.
    pub admin_token: Option<String>,
}
