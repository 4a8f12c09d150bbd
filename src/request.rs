use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use indexmap::IndexMap;

use crate::InvokeResult;
use crate::auth::Credentials;
use crate::body::ReqBody;
use crate::util::{parse_header_name, parse_header_value};

/// Default replay window for request content, matching the SDK's
/// request client options.
pub const DEFAULT_READ_LIMIT: usize = 128 * 1024 + 1;

/// The caller's immutable logical request, shared by every attempt.
#[derive(Clone, Debug)]
pub struct OriginalRequest {
    request_credentials: Option<Credentials>,
    read_limit: usize,
    custom_headers: Vec<(HeaderName, HeaderValue)>,
}

impl Default for OriginalRequest {
    fn default() -> Self {
        Self {
            request_credentials: None,
            read_limit: DEFAULT_READ_LIMIT,
            custom_headers: Vec::new(),
        }
    }
}

impl OriginalRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials used instead of the client's provider for this request only.
    pub fn request_credentials(mut self, credentials: Credentials) -> Self {
        self.request_credentials = Some(credentials);
        self
    }

    /// Largest content length that may be replayed on retry.
    pub fn read_limit(mut self, read_limit: usize) -> Self {
        self.read_limit = read_limit;
        self
    }

    pub fn custom_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.custom_headers.push((name, value));
        self
    }

    pub fn try_custom_header(self, name: &str, value: &str) -> InvokeResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.custom_header(name, value))
    }

    pub fn get_request_credentials(&self) -> Option<&Credentials> {
        self.request_credentials.as_ref()
    }

    pub fn get_read_limit(&self) -> usize {
        self.read_limit
    }

    pub fn custom_headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.custom_headers
    }
}

pub enum RequestContent {
    /// In-memory content; can be sent again on retry.
    Buffered(Bytes),
    /// One-shot streaming content.
    Streaming(ReqBody),
}

impl std::fmt::Debug for RequestContent {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => formatter
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            Self::Streaming(_) => formatter.write_str("Streaming"),
        }
    }
}

/// A request as it travels through the invocation engine.
///
/// Preparation mutates headers, endpoint and time offset on every attempt;
/// the orchestrator restores parameters, headers and content from a
/// [`PristineRequest`] before each retry.
#[derive(Debug)]
pub struct Request {
    service_name: String,
    method: Method,
    resource_path: String,
    parameters: IndexMap<String, Vec<String>>,
    headers: HeaderMap,
    content: Option<RequestContent>,
    endpoint: Option<Uri>,
    time_offset: i64,
    original: Arc<OriginalRequest>,
}

impl Request {
    pub fn new(service_name: impl Into<String>, method: Method) -> Self {
        Self::with_original(service_name, method, OriginalRequest::default())
    }

    pub fn with_original(
        service_name: impl Into<String>,
        method: Method,
        original: OriginalRequest,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method,
            resource_path: String::new(),
            parameters: IndexMap::new(),
            headers: HeaderMap::new(),
            content: None,
            endpoint: None,
            time_offset: 0,
            original: Arc::new(original),
        }
    }

    pub fn resource_path(mut self, resource_path: impl Into<String>) -> Self {
        self.resource_path = resource_path.into();
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_parameter(name, value);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> InvokeResult<Self> {
        self.add_header(name, value)?;
        Ok(self)
    }

    pub fn content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = Some(RequestContent::Buffered(content.into()));
        self
    }

    pub fn streaming_content(mut self, body: ReqBody) -> Self {
        self.content = Some(RequestContent::Streaming(body));
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn get_resource_path(&self) -> &str {
        &self.resource_path
    }

    /// Parameters in the order they were first added.
    pub fn parameters(&self) -> &IndexMap<String, Vec<String>> {
        &self.parameters
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> InvokeResult<()> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn get_content(&self) -> Option<&RequestContent> {
        self.content.as_ref()
    }

    pub(crate) fn take_content(&mut self) -> Option<RequestContent> {
        self.content.take()
    }

    pub fn endpoint(&self) -> Option<&Uri> {
        self.endpoint.as_ref()
    }

    pub fn set_endpoint(&mut self, endpoint: Uri) {
        self.endpoint = Some(endpoint);
    }

    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn set_time_offset(&mut self, time_offset: i64) {
        self.time_offset = time_offset;
    }

    pub fn original(&self) -> &OriginalRequest {
        &self.original
    }

    pub(crate) fn original_arc(&self) -> Arc<OriginalRequest> {
        Arc::clone(&self.original)
    }

    /// Captures parameters, headers and content as they are before the first
    /// attempt. Content is marked replayable only when it is buffered and fits
    /// within the original request's read limit.
    pub(crate) fn snapshot(&self) -> PristineRequest {
        let content = match &self.content {
            None => PristineContent::Empty,
            Some(RequestContent::Buffered(bytes)) if bytes.len() <= self.original.read_limit => {
                PristineContent::Replayable(bytes.clone())
            }
            Some(_) => PristineContent::NotReplayable,
        };
        PristineRequest {
            parameters: self.parameters.clone(),
            headers: self.headers.clone(),
            content,
        }
    }

    pub(crate) fn restore(&mut self, pristine: &PristineRequest) {
        self.parameters = pristine.parameters.clone();
        self.headers = pristine.headers.clone();
        self.content = match &pristine.content {
            PristineContent::Replayable(bytes) => Some(RequestContent::Buffered(bytes.clone())),
            PristineContent::Empty | PristineContent::NotReplayable => None,
        };
    }
}

#[derive(Clone, Debug)]
pub(crate) enum PristineContent {
    Empty,
    Replayable(Bytes),
    NotReplayable,
}

#[derive(Clone, Debug)]
pub(crate) struct PristineRequest {
    parameters: IndexMap<String, Vec<String>>,
    headers: HeaderMap,
    content: PristineContent,
}

impl PristineRequest {
    pub(crate) fn is_replayable(&self) -> bool {
        !matches!(self.content, PristineContent::NotReplayable)
    }
}
