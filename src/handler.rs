use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::InvokeResult;
use crate::error::{ClientErrorKind, InvokeError, ServiceError, ServiceErrorType};
use crate::pool::WireResponse;
use crate::util::{parse_retry_after, truncate_body};

const ERROR_TYPE_HEADER: &str = "x-amzn-ErrorType";
const REQUEST_ID_HEADER: &str = "x-amzn-RequestId";

/// Converts a 2xx response into the caller's result type.
pub trait ResponseHandler<X>: Send + Sync {
    fn handle(&self, response: WireResponse) -> BoxFuture<'_, InvokeResult<X>>;
}

/// Converts a non-2xx response into a [`ServiceError`].
pub trait ErrorResponseHandler: Send + Sync {
    fn handle(&self, response: WireResponse) -> BoxFuture<'_, InvokeResult<ServiceError>>;
}

/// Deserializes the response body as JSON. An empty body reads as `null`.
pub struct JsonResponseHandler<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonResponseHandler<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonResponseHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonResponseHandler<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("JsonResponseHandler")
    }
}

impl<T> ResponseHandler<T> for JsonResponseHandler<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn handle(&self, response: WireResponse) -> BoxFuture<'_, InvokeResult<T>> {
        Box::pin(async move {
            let body = response.body();
            let body = if body.iter().all(u8::is_ascii_whitespace) {
                &b"null"[..]
            } else {
                body
            };
            serde_json::from_slice(body).map_err(|source| {
                InvokeError::client_with_source(
                    ClientErrorKind::ResponseHandler,
                    format!(
                        "failed to deserialize json response: {}",
                        truncate_body(response.body())
                    ),
                    source,
                )
            })
        })
    }
}

/// Maps one service error code to the party it blames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonErrorRule {
    error_code: String,
    error_type: ServiceErrorType,
}

impl JsonErrorRule {
    pub fn new(error_code: impl Into<String>, error_type: ServiceErrorType) -> Self {
        Self {
            error_code: error_code.into(),
            error_type,
        }
    }

    pub fn matches(&self, error_code: &str) -> bool {
        self.error_code == error_code
    }
}

/// Decodes JSON error documents of the form
/// `{"__type": "...#Code", "message": "..."}`.
///
/// The error code comes from the `x-amzn-ErrorType` header when present,
/// then `__type`, then `code`. Codes without a matching rule are blamed on
/// the service for 5xx statuses and on the client otherwise.
#[derive(Clone, Debug, Default)]
pub struct JsonErrorResponseHandler {
    rules: Vec<JsonErrorRule>,
}

impl JsonErrorResponseHandler {
    pub fn new(rules: Vec<JsonErrorRule>) -> Self {
        Self { rules }
    }

    pub fn rule(mut self, rule: JsonErrorRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn decode(&self, response: &WireResponse) -> ServiceError {
        let status = response.status();
        let mut document = match serde_json::from_slice::<Value>(response.body()) {
            Ok(Value::Object(document)) => document,
            _ => Map::new(),
        };

        let header_code = response
            .header(ERROR_TYPE_HEADER)
            .and_then(|value| value.split(':').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);
        let body_code = take_string(&mut document, &["__type", "code", "Code"])
            .map(|value| match value.rsplit_once('#') {
                Some((_, code)) => code.to_owned(),
                None => value,
            });
        let error_code = header_code.or(body_code);

        let message = take_string(&mut document, &["message", "Message", "errorMessage"])
            .unwrap_or_else(|| {
                if response.body().is_empty() {
                    status.canonical_reason().unwrap_or("unknown error").to_owned()
                } else {
                    truncate_body(response.body())
                }
            });

        let error_type = error_code
            .as_deref()
            .and_then(|code| self.rules.iter().find(|rule| rule.matches(code)))
            .map(|rule| rule.error_type)
            .unwrap_or_else(|| blame_by_status(status));

        let mut error = ServiceError::new(status.as_u16(), message).with_error_type(error_type);
        error.error_code = error_code;
        error.request_id = response.header(REQUEST_ID_HEADER).map(ToOwned::to_owned);
        error.retry_after_ms = parse_retry_after(response.headers(), SystemTime::now())
            .map(|delay| delay.as_millis().min(u64::MAX as u128) as u64);
        error.fields = document
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::String(text) => Some((name, text)),
                Value::Number(number) => Some((name, number.to_string())),
                Value::Bool(flag) => Some((name, flag.to_string())),
                _ => None,
            })
            .collect();
        error
    }
}

fn blame_by_status(status: http::StatusCode) -> ServiceErrorType {
    if status.is_server_error() {
        ServiceErrorType::Service
    } else {
        ServiceErrorType::Client
    }
}

fn take_string(document: &mut Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match document.remove(*name) {
        Some(Value::String(text)) => Some(text),
        _ => None,
    })
}

impl ErrorResponseHandler for JsonErrorResponseHandler {
    fn handle(&self, response: WireResponse) -> BoxFuture<'_, InvokeResult<ServiceError>> {
        Box::pin(async move { Ok(self.decode(&response)) })
    }
}

/// Hands the UTF-8 response body to an XML unmarshaller.
pub struct XmlResponseHandler<F> {
    unmarshaller: F,
}

impl<F> XmlResponseHandler<F> {
    pub fn new(unmarshaller: F) -> Self {
        Self { unmarshaller }
    }
}

impl<F> std::fmt::Debug for XmlResponseHandler<F> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("XmlResponseHandler")
    }
}

impl<X, F> ResponseHandler<X> for XmlResponseHandler<F>
where
    F: Fn(&str) -> InvokeResult<X> + Send + Sync,
    X: Send,
{
    fn handle(&self, response: WireResponse) -> BoxFuture<'_, InvokeResult<X>> {
        Box::pin(async move {
            let text = std::str::from_utf8(response.body()).map_err(|source| {
                InvokeError::client_with_source(
                    ClientErrorKind::ResponseHandler,
                    "xml response is not valid utf-8",
                    source,
                )
            })?;
            (self.unmarshaller)(text)
        })
    }
}

/// Maps one XML error code to the party it blames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlErrorRule {
    error_code: String,
    error_type: ServiceErrorType,
}

impl XmlErrorRule {
    pub fn new(error_code: impl Into<String>, error_type: ServiceErrorType) -> Self {
        Self {
            error_code: error_code.into(),
            error_type,
        }
    }

    pub fn matches(&self, error_code: &str) -> bool {
        self.error_code == error_code
    }
}

/// Decodes query-protocol error documents:
///
/// ```xml
/// <ErrorResponse>
///   <Error><Type>Sender</Type><Code>Throttling</Code><Message>slow down</Message></Error>
///   <RequestId>4d5c...</RequestId>
/// </ErrorResponse>
/// ```
///
/// Bare `<Error>` roots and `<Response><Errors><Error>` wrappers read the
/// same way; only the first `<Error>` counts. Blame comes from a matching
/// rule, then `<Type>` (`Sender` or `Receiver`), then the status.
#[derive(Clone, Debug, Default)]
pub struct XmlErrorResponseHandler {
    rules: Vec<XmlErrorRule>,
}

#[derive(Debug, Default)]
struct XmlErrorDocument {
    code: Option<String>,
    message: Option<String>,
    fault: Option<String>,
    request_id: Option<String>,
    fields: BTreeMap<String, String>,
}

impl XmlErrorDocument {
    fn parse(body: &str) -> Result<Self, quick_xml::Error> {
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(true);

        let mut document = Self::default();
        let mut path: Vec<String> = Vec::new();
        let mut errors_opened = 0_usize;
        loop {
            match reader.read_event()? {
                Event::Start(element) => {
                    let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                    if name == "Error" {
                        errors_opened += 1;
                    }
                    path.push(name);
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(text) => {
                    let value = text.unescape()?.into_owned();
                    document.record(&path, errors_opened, value);
                }
                Event::Eof => return Ok(document),
                _ => {}
            }
        }
    }

    fn record(&mut self, path: &[String], errors_opened: usize, value: String) {
        let Some((name, parents)) = path.split_last() else {
            return;
        };
        if name == "RequestId" || name == "RequestID" {
            self.request_id.get_or_insert(value);
            return;
        }
        let in_first_error =
            errors_opened == 1 && parents.last().is_some_and(|parent| parent == "Error");
        if !in_first_error {
            return;
        }
        match name.as_str() {
            "Code" => self.code = Some(value),
            "Message" => self.message = Some(value),
            "Type" => self.fault = Some(value),
            _ => {
                self.fields.insert(name.clone(), value);
            }
        }
    }
}

impl XmlErrorResponseHandler {
    pub fn new(rules: Vec<XmlErrorRule>) -> Self {
        Self { rules }
    }

    pub fn rule(mut self, rule: XmlErrorRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn decode(&self, response: &WireResponse) -> ServiceError {
        let status = response.status();
        let document = std::str::from_utf8(response.body())
            .ok()
            .and_then(|body| XmlErrorDocument::parse(body).ok())
            .unwrap_or_default();

        let message = document.message.unwrap_or_else(|| {
            if response.body().is_empty() {
                status.canonical_reason().unwrap_or("unknown error").to_owned()
            } else {
                truncate_body(response.body())
            }
        });
        let error_type = document
            .code
            .as_deref()
            .and_then(|code| self.rules.iter().find(|rule| rule.matches(code)))
            .map(|rule| rule.error_type)
            .or(match document.fault.as_deref() {
                Some("Sender") => Some(ServiceErrorType::Client),
                Some("Receiver") => Some(ServiceErrorType::Service),
                _ => None,
            })
            .unwrap_or_else(|| blame_by_status(status));

        let mut error = ServiceError::new(status.as_u16(), message).with_error_type(error_type);
        error.error_code = document.code;
        error.request_id = document
            .request_id
            .or_else(|| response.header(REQUEST_ID_HEADER).map(ToOwned::to_owned));
        error.retry_after_ms = parse_retry_after(response.headers(), SystemTime::now())
            .map(|delay| delay.as_millis().min(u64::MAX as u128) as u64);
        error.fields = document.fields;
        error
    }
}

impl ErrorResponseHandler for XmlErrorResponseHandler {
    fn handle(&self, response: WireResponse) -> BoxFuture<'_, InvokeResult<ServiceError>> {
        Box::pin(async move { Ok(self.decode(&response)) })
    }
}
