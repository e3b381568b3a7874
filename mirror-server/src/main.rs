use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use mirror_server::admin::admin_router;
use mirror_server::config::Config;
use mirror_server::db::Db;
use mirror_server::git::GitIdentity;
use mirror_server::github::create_http_client;
use mirror_server::operations::{restart_abandoned_operations, OpsContext};
use mirror_server::store::RepoStore;
use mirror_server::webhook::hook_router;
use mirror_server::AppState;

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "github-notes-mirror"
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting GitHub notes mirror");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    let db_path = config.state_dir.join("mirror-state.db");
    info!("Using state database: {}", db_path.display());
    let db = Db::new(&db_path).expect("Failed to initialize SQLite database");

    let ops = Arc::new(OpsContext {
        store: RepoStore::new(Arc::new(db)),
        http: create_http_client(),
        external_host: config.external_host.clone(),
        git_identity: GitIdentity {
            name: config.git_user_name.clone(),
            email: config.git_user_email.clone(),
        },
    });

    // Pick up whatever a previous process abandoned before accepting any
    // deliveries.
    restart_abandoned_operations(ops.clone()).await;

    let app_state = Arc::new(AppState {
        ops,
        admin_token: config.admin_auth_token.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(hook_router())
        .merge(admin_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
