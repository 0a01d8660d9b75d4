// SPDX-License-Identifier: MPL-2.0

//! Request handlers of the control plane

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method};
use serde_json::{Value, json};
use tracing::debug;

use super::AppState;
use super::auth::authenticate;
use crate::errors::LeaseError;
use crate::lease::{LeaseRequest, LeaseResponse};
use crate::stats::StatusSnapshot;

/// Lease endpoint: authenticate, require POST, then grant/renew/end
pub async fn camera(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LeaseResponse>, LeaseError> {
    let username = authenticate(&headers, state.credentials.as_ref())?;

    if method != Method::POST {
        return Err(LeaseError::MethodNotAllowed(method.to_string()));
    }

    let request: LeaseRequest = serde_json::from_slice(&body)
        .map_err(|e| LeaseError::InvalidRequest(e.to_string()))?;
    debug!(user = %username, request = ?request, "Lease request");

    let grant = state.leases.lock().handle_request(&username, &request)?;
    Ok(Json(grant.into()))
}

pub async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.stats.snapshot())
}

pub async fn index() -> Json<Value> {
    Json(json!({ "result": "Hello World!" }))
}
