use std::collections::BTreeMap;

use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    /// Waiting for a free connection slot in the pooled client.
    PoolAcquire,
    /// Waiting for the response head after the request was written.
    ResponseHead,
    /// Reading the response body.
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::PoolAcquire => "pool_acquire",
            Self::ResponseHead => "response_head",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

/// What went wrong locally, for errors of the client class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientErrorKind {
    Credentials,
    Signing,
    Interceptor,
    Serialize,
    RequestBuild,
    ResponseHandler,
    ReadBody,
    Other,
}

impl std::fmt::Display for ClientErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Credentials => "credentials",
            Self::Signing => "signing",
            Self::Interceptor => "interceptor",
            Self::Serialize => "serialize",
            Self::RequestBuild => "request_build",
            Self::ResponseHandler => "response_handler",
            Self::ReadBody => "read_body",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Broad family an [`InvokeError`] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Local failure that did not originate from a server response.
    Client,
    /// Structured error decoded from a non-2xx response.
    Service,
    /// Fatal setup problem; never retried.
    Configuration,
}

/// Who the service blames for a [`ServiceError`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceErrorType {
    Client,
    Service,
    #[default]
    Unknown,
}

impl std::fmt::Display for ServiceErrorType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Client => "client",
            Self::Service => "service",
            Self::Unknown => "unknown",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServiceError {
    pub status: u16,
    pub service_name: Option<String>,
    pub error_code: Option<String>,
    pub error_type: ServiceErrorType,
    pub message: String,
    pub request_id: Option<String>,
    /// Server-suggested wait before the next attempt, from `Retry-After`.
    pub retry_after_ms: Option<u64>,
    /// Provider-specific fields that the error rules did not consume.
    pub fields: BTreeMap<String, String>,
}

impl ServiceError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    pub fn with_error_type(mut self, error_type: ServiceErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn set_service_name(&mut self, service_name: impl Into<String>) {
        self.service_name = Some(service_name.into());
    }

    pub fn is_throttling(&self) -> bool {
        if self.status == 429 {
            return true;
        }
        matches!(
            self.error_code.as_deref(),
            Some(
                "Throttling"
                    | "ThrottlingException"
                    | "ThrottledException"
                    | "ProvisionedThroughputExceededException"
                    | "RequestLimitExceeded"
                    | "RequestThrottled"
                    | "SlowDown"
                    | "TooManyRequestsException"
            )
        )
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{} (service: {}; status: {}; error code: {}; error type: {}; request id: {})",
            self.message,
            self.service_name.as_deref().unwrap_or("unknown"),
            self.status,
            self.error_code.as_deref().unwrap_or("none"),
            self.error_type,
            self.request_id.as_deref().unwrap_or("none"),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Client,
    Service,
    Configuration,
    InvalidUri,
    Transport,
    Timeout,
    ResponseBodyTooLarge,
    DecodeContentEncoding,
    RedirectLimitExceeded,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Service => "service",
            Self::Configuration => "configuration",
            Self::InvalidUri => "invalid_uri",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvokeError {
    #[error("client error ({kind}): {message}")]
    Client {
        kind: ClientErrorKind,
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("service error: {0}")]
    Service(Box<ServiceError>),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
}

impl InvokeError {
    pub fn client(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self::Client {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn client_with_source(
        kind: ClientErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Client {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Wraps a failure from outside the crate's error family.
    pub fn from_foreign(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        match source.downcast::<InvokeError>() {
            Ok(error) => *error,
            Err(source) => Self::Client {
                kind: ClientErrorKind::Other,
                message: source.to_string(),
                source: Some(source),
            },
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn service(error: ServiceError) -> Self {
        Self::Service(Box::new(error))
    }

    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Service(_) => ErrorClass::Service,
            Self::Configuration { .. } => ErrorClass::Configuration,
            _ => ErrorClass::Client,
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Client { .. } => ErrorCode::Client,
            Self::Service(_) => ErrorCode::Service,
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
        }
    }

    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(error) => Some(error),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.service_error().map(|error| error.status)
    }

    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<ServiceError> for InvokeError {
    fn from(error: ServiceError) -> Self {
        Self::service(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_foreign_keeps_errors_already_in_family() {
        let original = InvokeError::configuration("unknown protocol: ftp");
        let boxed: BoxError = Box::new(original);
        let error = InvokeError::from_foreign(boxed);
        assert!(error.is_configuration());
    }

    #[test]
    fn from_foreign_wraps_other_errors_as_client_errors() {
        let io = std::io::Error::other("disk on fire");
        let error = InvokeError::from_foreign(io);
        assert_eq!(error.class(), ErrorClass::Client);
        match error {
            InvokeError::Client { kind, message, .. } => {
                assert_eq!(kind, ClientErrorKind::Other);
                assert_eq!(message, "disk on fire");
            }
            other => panic!("unexpected error variant: {other}"),
        }
    }

    #[test]
    fn transport_errors_are_client_class() {
        let error = InvokeError::Transport {
            kind: TransportErrorKind::Connect,
            method: Method::GET,
            uri: "http://127.0.0.1:1/".to_owned(),
            source: "refused".into(),
        };
        assert_eq!(error.class(), ErrorClass::Client);
        assert_eq!(error.code().as_str(), "transport");
    }

    #[test]
    fn service_error_display_names_service_and_code() {
        let mut error = ServiceError::new(400, "bad metric")
            .with_error_code("InvalidParameterValue")
            .with_error_type(ServiceErrorType::Client);
        error.set_service_name("AmazonCloudWatch");
        let text = InvokeError::service(error).to_string();
        assert!(text.contains("AmazonCloudWatch"));
        assert!(text.contains("InvalidParameterValue"));
        assert!(text.contains("status: 400"));
    }

    #[test]
    fn throttling_detected_from_status_or_code() {
        assert!(ServiceError::new(429, "slow down").is_throttling());
        assert!(
            ServiceError::new(400, "x")
                .with_error_code("ThrottlingException")
                .is_throttling()
        );
        assert!(!ServiceError::new(400, "x").is_throttling());
    }
}
