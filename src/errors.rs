// SPDX-License-Identifier: MPL-2.0

//! Error types for the streaming server

use std::io;
use std::path::PathBuf;

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::pipeline::graph::GraphState;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Failures reported by a media graph backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("failed to build stage {stage}: {reason}")]
    BuildFailed { stage: String, reason: String },

    #[error("stage {0} does not exist")]
    StageNotFound(String),

    #[error("stage {0} already exists")]
    StageExists(String),

    #[error("stage {stage} could not be added to the graph: {reason}")]
    AddFailed { stage: String, reason: String },

    #[error("stage {stage} could not be removed from the graph: {reason}")]
    RemoveFailed { stage: String, reason: String },

    #[error("failed to link {upstream} -> {downstream}")]
    LinkFailed {
        upstream: String,
        downstream: String,
    },

    #[error("failed to unlink {upstream} -> {downstream}")]
    UnlinkFailed {
        upstream: String,
        downstream: String,
    },

    #[error("failed to move {target} to {state}")]
    StateChange { target: String, state: GraphState },

    #[error("state query failed: {0}")]
    StateQuery(String),

    #[error("{signal} on {target} failed: {reason}")]
    Signal {
        target: String,
        signal: String,
        reason: String,
    },

    #[error("graph library error: {0}")]
    Backend(String),
}

/// Recording directory and quota errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("recording directory {} does not exist and creation is disabled", .0.display())]
    MissingDirectory(PathBuf),

    #[error("recording directory {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised by the pipeline engine
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot {0}: pipeline is not constructed")]
    NotConstructed(&'static str),

    #[error("branch {0} already has a parent")]
    BranchHasParent(String),

    #[error("branch {0} is not attached")]
    BranchNotAttached(String),

    #[error("fan-out stage is missing")]
    FanOutMissing,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors produced while serving a lease request
///
/// Each variant maps onto one HTTP status code of the control endpoint.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("unauthorized user {0}")]
    Unauthorized(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("unknown lease {0}")]
    UnknownLease(String),

    #[error("user {username} already holds {max} leases")]
    LimitReached { username: String, max: usize },

    #[error("pipeline failure: {0}")]
    Pipeline(#[from] PipelineError),
}

impl LeaseError {
    pub fn status(&self) -> StatusCode {
        match self {
            LeaseError::MissingCredentials | LeaseError::Unauthorized(_) => {
                StatusCode::UNAUTHORIZED
            }
            LeaseError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            LeaseError::InvalidRequest(_) | LeaseError::UnknownLease(_) => StatusCode::BAD_REQUEST,
            LeaseError::LimitReached { .. } => StatusCode::FORBIDDEN,
            LeaseError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            LeaseError::MissingCredentials | LeaseError::Unauthorized(_) => "unauthorized",
            LeaseError::MethodNotAllowed(_) => "method_not_allowed",
            LeaseError::InvalidRequest(_) => "invalid_request",
            LeaseError::UnknownLease(_) => "unknown_lease",
            LeaseError::LimitReached { .. } => "lease_limit_reached",
            LeaseError::Pipeline(_) => "internal_error",
        }
    }
}

impl IntoResponse for LeaseError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            LeaseError::InvalidRequest(_)
            | LeaseError::UnknownLease(_)
            | LeaseError::MethodNotAllowed(_) => warn!(status = %status, error = %self, "Rejected request"),
            _ => error!(status = %status, error = %self, "Request failed"),
        }

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        if status == StatusCode::METHOD_NOT_ALLOWED {
            (status, [(header::ALLOW, "POST")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unsupported user database location {0}")]
    UnsupportedUserDb(String),
}

/// Main application error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("media graph construction failed: {0}")]
    Construction(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("control server error: {0}")]
    Server(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_errors_map_to_status_codes() {
        assert_eq!(
            LeaseError::MissingCredentials.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            LeaseError::MethodNotAllowed("GET".into()).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            LeaseError::UnknownLease("abc".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LeaseError::LimitReached {
                username: "alice".into(),
                max: 2
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            LeaseError::Pipeline(PipelineError::FanOutMissing).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
