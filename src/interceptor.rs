use http::{HeaderMap, StatusCode};

use crate::InvokeResult;
use crate::auth::Credentials;
use crate::error::InvokeError;
use crate::request::Request;

/// Status line and headers of a wire response, as seen by interceptors.
#[derive(Clone, Debug)]
pub struct ResponseSummary {
    status: StatusCode,
    headers: HeaderMap,
    attempt: usize,
}

impl ResponseSummary {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, attempt: usize) -> Self {
        Self {
            status,
            headers,
            attempt,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Zero-based attempt that produced this response.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Receives the resolved credentials before `before_request` runs.
pub trait CredentialsConsumer: Send + Sync {
    fn set_credentials(&self, credentials: &Credentials);
}

/// Per-attempt hooks around request dispatch.
///
/// `before_request` runs on every attempt after credentials are resolved and
/// before signing; returning an error fails the attempt. Exactly one of
/// `after_response` or `after_error` runs per dispatched attempt.
pub trait Interceptor: Send + Sync {
    fn before_request(&self, _request: &mut Request) -> InvokeResult<()> {
        Ok(())
    }

    fn after_response(&self, _request: &Request, _response: &ResponseSummary) {}

    fn after_error(
        &self,
        _request: &Request,
        _response: Option<&ResponseSummary>,
        _error: &InvokeError,
    ) {
    }

    fn credentials_consumer(&self) -> Option<&dyn CredentialsConsumer> {
        None
    }
}
