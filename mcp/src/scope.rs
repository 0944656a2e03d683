//! Request-scoped values carried from ingress to tool handlers.
//!
//! The HTTP layer builds one [`RequestScope`] per verified inbound request
//! and threads it to the protocol layer two ways: as an extension on the
//! forwarded request (the SDK surfaces the request parts to handlers) and
//! as a task-local around the dispatch future. Nothing request-scoped is
//! ever stored in shared state.

use std::time::Duration;

use gateway_auth::TrustDelegation;

/// Default outbound call timeout when the request context carries none.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RequestScope {
    /// Correlation id, propagated to the backend and the audit log.
    pub request_id: String,
    /// Verified-but-unsigned delegation state for this request.
    pub identity: TrustDelegation,
    /// Resolved per-call timeout for outbound backend requests.
    pub call_timeout: Duration,
    /// Allow-listed inbound headers to copy onto outbound requests.
    pub passthrough_headers: Vec<(String, String)>,
}

impl RequestScope {
    pub fn new(request_id: impl Into<String>, identity: TrustDelegation) -> Self {
        Self {
            request_id: request_id.into(),
            identity,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            passthrough_headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_passthrough_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.passthrough_headers = headers;
        self
    }
}

tokio::task_local! {
    static REQUEST_SCOPE: RequestScope;
}

/// Run `fut` with `scope` installed as the current request scope.
pub async fn with_scope<F>(scope: RequestScope, fut: F) -> F::Output
where
    F: std::future::Future,
{
    REQUEST_SCOPE.scope(scope, fut).await
}

/// The current request scope, if the caller runs under [`with_scope`].
pub fn current_scope() -> Option<RequestScope> {
    REQUEST_SCOPE.try_with(|scope| scope.clone()).ok()
}
