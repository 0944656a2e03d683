//! Core error types and the wire error body shared by dispatch and ingress.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("invalid openapi document: {0}")]
    InvalidDocument(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("signing error: {0}")]
    Signing(#[from] gateway_auth::AuthError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// System tag carried in every wire-level error body.
const ERROR_SYSTEM: &str = "mcp-gateway";

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
    system: &'static str,
}

/// Build the `{error: {code, message, system}}` response used for every
/// ingress-level failure (unknown server, bad token, expired permission).
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                code,
                message,
                system: ERROR_SYSTEM,
            },
        }),
    )
        .into_response()
}
