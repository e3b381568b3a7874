//! The control panel: list tracked repositories, add, delete, and
//! restart abandoned operations.
//!
//! The whole surface sits behind a bearer token; leaving the token
//! unconfigured disables it outright.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use tracing::{error, info};

use crate::db::{RepoRecord, RepoState};
use crate::operations::{deactivate, restart_abandoned_operations, validate};
use crate::AppState;

pub fn admin_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(config_page))
        .route("/add", post(add_handler))
        .route("/delete", post(delete_handler))
        .route("/restartOperations", post(restart_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            require_admin,
        ))
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    // No configured token means the admin surface is switched off.
    let Some(expected) = &state.admin_token else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_config(records: &[RepoRecord]) -> String {
    const CONFIG_HTML_TEMPLATE: &str = include_str!("admin.html");

    let mut rows = String::new();
    for record in records {
        let full_name = format!("{}/{}", record.owner, record.name);
        let error_cause = if record.state == RepoState::Error {
            escape_html(&record.error_cause)
        } else {
            String::new()
        };
        rows.push_str(&format!(
            "<tr><td>{name}</td><td>{status}</td><td>{cause}</td>\
             <td><form method=\"post\" action=\"/delete\">\
             <input type=\"hidden\" name=\"repoName\" value=\"{name}\">\
             <button type=\"submit\">Delete</button></form></td></tr>\n",
            name = escape_html(&full_name),
            status = record.state,
            cause = error_cause,
        ));
    }
    CONFIG_HTML_TEMPLATE.replace("{rows}", &rows)
}

async fn config_page(State(state): State<Arc<AppState>>) -> Response {
    match state.ops.store.list_all().await {
        Err(e) => {
            error!("Error fetching repos: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Ok(records) => Html(render_config(&records)).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AddForm {
    #[serde(rename = "repoName")]
    repo_name: String,
    #[serde(rename = "repoToken")]
    repo_token: String,
}

#[derive(Debug, Deserialize)]
struct DeleteForm {
    #[serde(rename = "repoName")]
    repo_name: String,
}

fn split_repo_name(full_name: &str) -> Option<(String, String)> {
    match full_name.split('/').collect::<Vec<_>>().as_slice() {
        [owner, name] if !owner.is_empty() && !name.is_empty() => {
            Some((owner.to_string(), name.to_string()))
        }
        _ => None,
    }
}

async fn add_handler(State(state): State<Arc<AppState>>, Form(form): Form<AddForm>) -> Redirect {
    if form.repo_name.is_empty() || form.repo_token.is_empty() {
        error!("Missing repoName or repoToken for /add endpoint");
        return Redirect::to("/");
    }
    let Some((owner, name)) = split_repo_name(&form.repo_name) else {
        error!(
            "Invalid repository name (can't split on '/'): {}",
            form.repo_name
        );
        return Redirect::to("/");
    };

    info!("Adding repository {}", form.repo_name);
    let record = RepoRecord::new(owner.clone(), name.clone(), form.repo_token);
    if let Err(e) = state.ops.store.insert_new(record).await {
        error!("Couldn't store repository {}: {}", form.repo_name, e);
        return Redirect::to("/");
    }

    tokio::spawn(validate(state.ops.clone(), owner, name));
    Redirect::to("/")
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<DeleteForm>,
) -> Redirect {
    let Some((owner, name)) = split_repo_name(&form.repo_name) else {
        error!(
            "Invalid repository name (can't split on '/'): {}",
            form.repo_name
        );
        return Redirect::to("/");
    };
    tokio::spawn(deactivate(state.ops.clone(), owner, name));
    Redirect::to("/")
}

async fn restart_handler(State(state): State<Arc<AppState>>) -> Redirect {
    tokio::spawn(restart_abandoned_operations(state.ops.clone()));
    Redirect::to("/")
}
