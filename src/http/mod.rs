//! HTTP ingress: `{serverName}/sse`, `{serverName}/messages`,
//! `{serverName}/mcp`.
//!
//! Every request is authenticated before it reaches the registry:
//! missing/invalid/unverified JWT -> 401, unknown server -> 400, absent or
//! expired permission -> 403. Verified requests carry a [`RequestScope`]
//! to the tool handlers via request extensions and a task-local.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::Response,
    routing::any,
    Router,
};
use gateway_auth::TrustDelegation;
use gateway_mcp::{error_response, with_scope, McpProxy, RequestScope};
use tracing::{debug, warn};

use crate::storage::ConfigStore;

/// Header carrying the gateway-issued JWT.
const JWT_HEADER: &str = "x-bkapi-jwt";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything an HTTP handler needs, constructed once at startup and
/// injected by reference. No globals.
pub struct AppContext {
    pub proxy: Arc<McpProxy>,
    pub store: Arc<dyn ConfigStore>,
    /// Well-known gateway name resolving the JWT key pair.
    pub gateway_name: String,
    pub call_timeout: Duration,
    /// Inbound header names (lowercase) copied onto backend requests.
    pub passthrough_headers: Vec<String>,
}

pub fn router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/{server_name}/sse", any(dispatch))
        .route("/{server_name}/messages", any(dispatch))
        .route("/{server_name}/mcp", any(dispatch))
        .with_state(context)
}

async fn dispatch(
    State(context): State<Arc<AppContext>>,
    Path(server_name): Path<String>,
    mut request: Request,
) -> Response {
    let token = request
        .headers()
        .get(JWT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if token.is_empty() {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing X-Bkapi-Jwt header",
        );
    }

    // Cheap structural rejection before any collaborator lookup: a token
    // without a verified app can never pass full verification.
    match TrustDelegation::peek(&token) {
        Ok(claims) => {
            let app = claims.app.unwrap_or_default();
            if app.app_code.is_empty() {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "app code missing from token",
                );
            }
            if !app.verified {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "app is not verified",
                );
            }
        }
        Err(err) => {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized", &err.to_string());
        }
    }

    let keys = match context
        .store
        .jwt_keys_by_gateway_name(&context.gateway_name)
        .await
    {
        Ok(keys) => keys,
        Err(err) => {
            warn!(gateway = %context.gateway_name, error = %err, "jwt key lookup failed");
            return error_response(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "gateway keys unavailable",
            );
        }
    };

    let identity = match TrustDelegation::verify(&token, &keys, &context.gateway_name) {
        Ok(identity) => identity,
        Err(err) => {
            debug!(error = %err, "inbound jwt rejected");
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized", &err.to_string());
        }
    };
    let app_code = identity
        .claims()
        .map(|claims| claims.app_code.clone())
        .unwrap_or_default();

    let Some(server) = context.proxy.get_server(&server_name) else {
        // Dispatch answers unknown names directly; backends are untouched.
        return context.proxy.dispatch(&server_name, request).await;
    };

    match context
        .store
        .get_permission(&app_code, server.identity().id)
        .await
    {
        Ok(Some(permission)) if permission.is_expired() => {
            return error_response(
                StatusCode::FORBIDDEN,
                "permission_expired",
                &format!("permission of {} for {} has expired", app_code, server_name),
            );
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::FORBIDDEN,
                "permission_denied",
                &format!("{} has no permission for {}", app_code, server_name),
            );
        }
        Err(err) => {
            warn!(server = %server_name, error = %err, "permission lookup failed");
            return error_response(
                StatusCode::FORBIDDEN,
                "permission_denied",
                "permission unavailable",
            );
        }
    }

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let passthrough = context
        .passthrough_headers
        .iter()
        .filter_map(|name| {
            request
                .headers()
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(|value| (name.clone(), value.to_string()))
        })
        .collect();

    let scope = RequestScope::new(request_id, identity)
        .with_call_timeout(context.call_timeout)
        .with_passthrough_headers(passthrough);

    // The scope travels both ways the protocol layer can read it: on the
    // request itself and as a task-local around the dispatch future.
    request.extensions_mut().insert(scope.clone());
    with_scope(scope, context.proxy.dispatch(&server_name, request)).await
}
