//! Webhook receiver: `POST /hook/{owner}/{repo}`.
//!
//! Every delivery is authenticated with HMAC-SHA1 over the raw body, keyed
//! by the per-repository secret provisioned at hook creation. The secret
//! lives in the store, so the record lookup has to happen before
//! verification. A verified delivery is acknowledged immediately; the
//! mirror work runs detached.

use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::error;

use crate::operations::{handle_ping, initialize, EVENT_PING};
use crate::AppState;

const GITHUB_EVENT_HEADER: &str = "x-github-event";
const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature";

type HmacSha1 = Hmac<Sha1>;

pub fn hook_router() -> Router<Arc<AppState>> {
    Router::new().route("/hook/{owner}/{repo}", post(hook_handler))
}

/// Constant-time check of `signature` against HMAC-SHA1 of `payload`.
fn verify_signature(secret: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha1::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(signature).is_ok()
}

async fn hook_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let signature_header = parts
        .headers
        .get(GITHUB_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(signature_hex) = signature_header
        .strip_prefix("sha1=")
        .filter(|hex| !hex.is_empty())
    else {
        error!("Hook hit with no signature");
        return (
            StatusCode::BAD_REQUEST,
            "Webhook requires X-Hub-Signature header",
        )
            .into_response();
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        error!("Hook can't decode hex signature {:?}", signature_hex);
        return (StatusCode::BAD_REQUEST, "Can't decode signature").into_response();
    };

    let event = parts
        .headers
        .get(GITHUB_EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if event.is_empty() {
        error!("Hook hit with no event type");
        return (
            StatusCode::BAD_REQUEST,
            "Webhook requires X-Github-Event header",
        )
            .into_response();
    }
    let event = event.to_string();

    let Ok(content) = to_bytes(body, usize::MAX).await else {
        error!("Hook request body unreadable");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Can't read request body").into_response();
    };

    let record = match state.ops.store.get(&owner, &repo).await {
        Ok(Some(record)) => record,
        Ok(None) | Err(_) => {
            error!("Hook can't retrieve repo {}/{}", owner, repo);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Can't retrieve repo information",
            )
                .into_response();
        }
    };

    let secret = record.hook_secret.unwrap_or_default();
    if !verify_signature(secret.as_bytes(), &content, &signature) {
        error!("Hook hit with invalid signature for {}/{}", owner, repo);
        return (StatusCode::BAD_REQUEST, "Invalid signature").into_response();
    }

    // Acknowledge now; the mirror work happens on its own task.
    if event == EVENT_PING {
        tokio::spawn(handle_ping(
            state.ops.clone(),
            owner,
            repo,
            content.to_vec(),
        ));
    } else {
        tokio::spawn(initialize(state.ops.clone(), owner, repo));
    }
    StatusCode::OK.into_response()
}
