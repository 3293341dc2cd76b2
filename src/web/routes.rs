use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::progress::ProvisioningStep;
use crate::state::{AppState, Session};

fn error_response(e: ProvisionError) -> Response {
    let status = match &e {
        ProvisionError::InvalidAuthorizationCode => StatusCode::BAD_REQUEST,
        ProvisionError::TokenExchange(_)
        | ProvisionError::Pairing(_)
        | ProvisionError::Connection(_)
        | ProvisionError::Protocol(_) => StatusCode::BAD_GATEWAY,
        ProvisionError::NotReady(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("{}", e);
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "advice": e.advice(),
            "retryable": e.is_retryable(),
        })),
    )
        .into_response()
}

pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    let p = &state.provisioner;
    let step = p.current_step();
    let authorize_url = match step {
        ProvisioningStep::Login => match p.authorize_url() {
            Ok(url) => Some(url),
            Err(e) => return error_response(e),
        },
        _ => None,
    };
    let session = state.session.read().await.clone();

    Json(serde_json::json!({
        "step": step,
        "authorize_url": authorize_url,
        "server_addr": session.server_addr,
        "leap_version": session.leap_version,
        "ssl_path": p.storage_dir(),
        "artifacts": p.artifacts(),
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct LoginRequest {
    redirected_url: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Response {
    match state
        .provisioner
        .issue_certificate(&payload.redirected_url)
        .await
    {
        Ok(outcome) => Json(serde_json::json!({
            "ok": true,
            "outcome": outcome,
            "step": state.provisioner.current_step(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct BridgeRequest {
    server_addr: String,
}

pub async fn pair_bridge(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BridgeRequest>,
) -> Response {
    let server_addr = payload.server_addr.trim().to_string();
    state.session.write().await.server_addr = Some(server_addr.clone());

    match state.provisioner.bootstrap_trust(&server_addr).await {
        Ok(bridge) => {
            state.session.write().await.leap_version = Some(bridge.leap_version.clone());
            info!(
                "Successfully connected to bridge, running LEAP Server version {}",
                bridge.leap_version
            );
            Json(serde_json::json!({
                "ok": true,
                "bridge": bridge,
                "step": state.provisioner.current_step(),
            }))
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn reset(State(state): State<Arc<AppState>>) -> Response {
    if let Err(e) = state.provisioner.reset() {
        return error_response(e);
    }
    *state.session.write().await = Session::default();

    Json(serde_json::json!({
        "ok": true,
        "message": "The certificate files have been deleted and your session has been reset.",
        "step": state.provisioner.current_step(),
    }))
    .into_response()
}

pub async fn debug(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let session = state.session.read().await.clone();
    Json(serde_json::json!({
        "session": session,
        "artifacts": state.provisioner.artifacts(),
    }))
}
