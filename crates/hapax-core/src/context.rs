use std::time::Duration;
use uuid::Uuid;

/// Per-request context propagated through the middleware chain and into the
/// provider manager (§2 cross-cutting concerns): a request ID for log
/// correlation and the `X-Request-ID` response header, plus an optional
/// test-only timeout override so integration tests can force a deadline
/// without reconfiguring the whole server.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub test_timeout: Option<Duration>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            test_timeout: None,
        }
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = Some(timeout);
        self
    }

    pub fn request_id_string(&self) -> String {
        self.request_id.to_string()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
