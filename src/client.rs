use std::sync::Arc;
use std::time::Instant;

use http::Uri;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};

use crate::InvokeResult;
use crate::auth::CredentialsProvider;
use crate::config::{ClientConfiguration, Protocol};
use crate::context::ExecutionContext;
use crate::error::{ClientErrorKind, InvokeError};
use crate::execute::execute;
use crate::handler::{
    ErrorResponseHandler, JsonErrorResponseHandler, JsonErrorRule, JsonResponseHandler,
    ResponseHandler, XmlErrorResponseHandler, XmlErrorRule, XmlResponseHandler,
};
use crate::interceptor::Interceptor;
use crate::metrics::{InvokeMetrics, InvokeMetricsSnapshot};
use crate::pool::{ConnectionPoolManager, pool_key};
use crate::prepare::RequestPreparer;
use crate::request::Request;
use crate::retry::backoff_delay;
use crate::signer::SignerRegistry;

const DEFAULT_CLIENT_NAME: &str = "sdkcall";

pub struct InvokeClientBuilder {
    client_name: String,
    config: ClientConfiguration,
    credentials_provider: Option<Arc<dyn CredentialsProvider>>,
    signers: Option<Arc<SignerRegistry>>,
    pool: Option<Arc<ConnectionPoolManager>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    metrics_enabled: bool,
}

impl Default for InvokeClientBuilder {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            config: ClientConfiguration::default(),
            credentials_provider: None,
            signers: None,
            pool: None,
            interceptors: Vec::new(),
            metrics_enabled: false,
        }
    }
}

impl InvokeClientBuilder {
    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn configuration(mut self, config: ClientConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn credentials_provider<P>(self, provider: P) -> Self
    where
        P: CredentialsProvider + 'static,
    {
        self.credentials_provider_arc(Arc::new(provider))
    }

    pub fn credentials_provider_arc(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    /// Signer registry to resolve signers from; defaults to a fresh registry
    /// with only the no-op signer registered.
    pub fn signer_registry(mut self, signers: Arc<SignerRegistry>) -> Self {
        self.signers = Some(signers);
        self
    }

    /// Connection pool registry; defaults to [`ConnectionPoolManager::global`].
    pub fn pool_manager(mut self, pool: Arc<ConnectionPoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn interceptor<I>(self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> InvokeResult<InvokeClient> {
        let endpoint = resolve_endpoint(&self.config)?;
        pool_key(&endpoint)?;
        let credentials_provider = self.credentials_provider.ok_or_else(|| {
            InvokeError::configuration("a credentials provider is required")
        })?;
        let signers = self
            .signers
            .unwrap_or_else(|| Arc::new(SignerRegistry::new()));
        let preparer = RequestPreparer::new(endpoint, &self.config, credentials_provider, signers)?;

        Ok(InvokeClient {
            client_name: self.client_name,
            config: self.config,
            preparer: Arc::new(preparer),
            pool: self.pool.unwrap_or_else(ConnectionPoolManager::global),
            interceptors: self.interceptors,
            metrics: if self.metrics_enabled {
                InvokeMetrics::enabled()
            } else {
                InvokeMetrics::disabled()
            },
        })
    }

    #[track_caller]
    pub fn build(self) -> InvokeClient {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build sdkcall client: {error}; use try_build() to handle configuration errors")
        })
    }
}

/// Turns the configured endpoint into an absolute URI. A bare host gets the
/// configured protocol; an explicit scheme must be http or https and must
/// match the protocol when one was configured.
fn resolve_endpoint(config: &ClientConfiguration) -> InvokeResult<Uri> {
    let endpoint = config
        .get_endpoint()
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| InvokeError::configuration("an endpoint is required"))?;
    let text = match endpoint.split_once("://") {
        Some((scheme, _)) => {
            let scheme_protocol = scheme.parse::<Protocol>()?;
            if let Some(configured) = config.explicit_protocol()
                && configured != scheme_protocol
            {
                return Err(InvokeError::configuration(format!(
                    "endpoint scheme {scheme_protocol} conflicts with configured protocol {configured}"
                )));
            }
            endpoint.to_owned()
        }
        None => format!("{}://{endpoint}", config.get_protocol()),
    };
    text.parse::<Uri>().map_err(|_| InvokeError::InvalidUri { uri: text.clone() })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InvocationState {
    NotStarted,
    Preparing,
    Backoff,
    Executing,
    Succeeded,
    Retrying,
    Exhausted,
}

impl InvocationState {
    fn can_move_to(self, next: Self) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (NotStarted | Retrying, Preparing)
                | (Preparing, Backoff | Retrying | Exhausted)
                | (Backoff, Executing)
                | (Executing, Succeeded | Retrying | Exhausted)
                | (Retrying, Exhausted)
        )
    }

    fn advance(&mut self, next: Self) {
        debug_assert!(
            self.can_move_to(next),
            "illegal invocation transition {self:?} -> {next:?}"
        );
        *self = next;
    }
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: usize,
    last_error: Option<InvokeError>,
}

/// Counts one attempt when dropped, whichever way the attempt ends.
struct AttemptScope<'a> {
    attempts: &'a mut usize,
}

impl<'a> AttemptScope<'a> {
    fn enter(attempts: &'a mut usize) -> Self {
        Self { attempts }
    }
}

impl Drop for AttemptScope<'_> {
    fn drop(&mut self) {
        *self.attempts += 1;
    }
}

#[derive(Clone)]
pub struct InvokeClient {
    client_name: String,
    config: ClientConfiguration,
    preparer: Arc<RequestPreparer>,
    pool: Arc<ConnectionPoolManager>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    metrics: InvokeMetrics,
}

impl std::fmt::Debug for InvokeClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InvokeClient")
            .field("client_name", &self.client_name)
            .field("endpoint", self.preparer.endpoint())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl InvokeClient {
    pub fn builder() -> InvokeClientBuilder {
        InvokeClientBuilder::default()
    }

    pub fn configuration(&self) -> &ClientConfiguration {
        &self.config
    }

    pub fn endpoint(&self) -> &Uri {
        self.preparer.endpoint()
    }

    pub fn pool_manager(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    pub fn metrics_snapshot(&self) -> InvokeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// A fresh per-invocation context carrying the client's interceptors and
    /// metrics sink.
    pub fn execution_context(&self) -> ExecutionContext {
        ExecutionContext::new()
            .interceptors(self.interceptors.iter().cloned())
            .metrics(self.metrics.clone())
    }

    /// Sends `request` with the JSON success handler and a JSON error handler
    /// built from `error_rules`. Error codes are read from the
    /// `x-amzn-ErrorType` header first, so this serves both JSON protocol
    /// generations.
    pub async fn invoke_json<T>(
        &self,
        request: Request,
        error_rules: Vec<JsonErrorRule>,
        context: &mut ExecutionContext,
    ) -> InvokeResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let response_handler = JsonResponseHandler::<T>::new();
        let error_handler = JsonErrorResponseHandler::new(error_rules);
        self.invoke(request, &response_handler, &error_handler, context)
            .await
    }

    /// Sends `request` for a query-protocol service: `unmarshaller` reads the
    /// XML success body and `error_rules` classify `<Error><Code>` values.
    pub async fn invoke_xml<X, F>(
        &self,
        request: Request,
        unmarshaller: F,
        error_rules: Vec<XmlErrorRule>,
        context: &mut ExecutionContext,
    ) -> InvokeResult<X>
    where
        F: Fn(&str) -> InvokeResult<X> + Send + Sync,
        X: Send,
    {
        let response_handler = XmlResponseHandler::new(unmarshaller);
        let error_handler = XmlErrorResponseHandler::new(error_rules);
        self.invoke(request, &response_handler, &error_handler, context)
            .await
    }

    /// Runs one invocation: prepare, back off, dispatch, and retry failed
    /// attempts while the retry policy allows.
    ///
    /// Every retry starts from the parameters, headers and content the
    /// request had before the first attempt. Content that cannot be replayed
    /// (streaming, or larger than the read limit) gets exactly one attempt.
    pub async fn invoke<X>(
        &self,
        mut request: Request,
        response_handler: &dyn ResponseHandler<X>,
        error_handler: &dyn ErrorResponseHandler,
        context: &mut ExecutionContext,
    ) -> InvokeResult<X> {
        let metrics = context.get_metrics().clone();
        metrics.record_invocation_started();
        let _in_flight = metrics.enter_in_flight();
        let started = Instant::now();

        let policy = self.config.get_retry_policy();
        let original = request.original_arc();
        let pristine = request.snapshot();
        let retries_enabled = pristine.is_replayable();
        if !retries_enabled && policy.get_max_error_retry() > 0 {
            warn!(
                client = %self.client_name,
                service = %request.service_name(),
                "request content cannot be replayed; retries are disabled for this invocation"
            );
        }
        let max_attempts = if retries_enabled {
            policy.get_max_error_retry() + 1
        } else {
            1
        };

        let mut state = InvocationState::NotStarted;
        let mut retry = RetryState::default();
        let result = loop {
            let attempt = retry.attempts;
            let retrying = state == InvocationState::Retrying;
            let proceed = !retrying
                || (retries_enabled
                    && policy.allows_attempt(&original, retry.last_error.as_ref(), attempt));
            if !proceed {
                state.advance(InvocationState::Exhausted);
                break Err(retry.last_error.take().unwrap_or_else(|| {
                    InvokeError::client(ClientErrorKind::Other, "retries exhausted")
                }));
            }

            let scope = AttemptScope::enter(&mut retry.attempts);
            if retrying {
                request.restore(&pristine);
                metrics.record_retry();
            }
            metrics.record_attempt();
            let span = info_span!(
                "sdkcall.attempt",
                client = %self.client_name,
                service = %request.service_name(),
                method = %request.method(),
                attempt = attempt,
                max_attempts = max_attempts
            );
            let outcome = self
                .run_attempt(
                    &mut request,
                    response_handler,
                    error_handler,
                    context,
                    attempt,
                    retry.last_error.as_ref(),
                    &mut state,
                )
                .instrument(span)
                .await;
            drop(scope);

            match outcome {
                Ok(value) => {
                    retry.last_error = None;
                    state.advance(InvocationState::Succeeded);
                    break Ok(value);
                }
                Err(error) => {
                    metrics.record_attempt_error(&error);
                    if error.is_configuration() {
                        state.advance(InvocationState::Exhausted);
                        break Err(error);
                    }
                    debug!(
                        client = %self.client_name,
                        attempt = attempt,
                        error = %error,
                        "attempt failed"
                    );
                    retry.last_error = Some(error);
                    state.advance(InvocationState::Retrying);
                }
            }
        };

        debug!(
            client = %self.client_name,
            state = ?state,
            attempts = retry.attempts,
            "invocation finished"
        );
        metrics.record_invocation_completed(result.is_ok(), started.elapsed());
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt<X>(
        &self,
        request: &mut Request,
        response_handler: &dyn ResponseHandler<X>,
        error_handler: &dyn ErrorResponseHandler,
        context: &mut ExecutionContext,
        attempt: usize,
        last_error: Option<&InvokeError>,
        state: &mut InvocationState,
    ) -> InvokeResult<X> {
        state.advance(InvocationState::Preparing);
        if let Err(error) = self.preparer.prepare(request, context).await {
            run_error_interceptors(context, request, &error);
            return Err(error);
        }

        state.advance(InvocationState::Backoff);
        let delay = backoff_delay(
            self.config.get_retry_policy(),
            request.original(),
            last_error,
            attempt,
        );
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
            sleep(delay).await;
        }

        state.advance(InvocationState::Executing);
        let pooled = match self.pool.client_for(self.preparer.endpoint(), &self.config) {
            Ok(pooled) => pooled,
            Err(error) => {
                run_error_interceptors(context, request, &error);
                return Err(error);
            }
        };
        execute(
            request,
            &pooled,
            response_handler,
            error_handler,
            context,
            attempt,
        )
        .await
    }
}

fn run_error_interceptors(context: &ExecutionContext, request: &Request, error: &InvokeError) {
    for interceptor in context.get_interceptors() {
        interceptor.after_error(request, None, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credentials, StaticCredentialsProvider};

    fn builder() -> InvokeClientBuilder {
        InvokeClient::builder()
            .credentials_provider(StaticCredentialsProvider::new(Credentials::new("id", "secret")))
            .pool_manager(Arc::new(ConnectionPoolManager::new()))
    }

    #[test]
    fn attempt_scope_counts_on_every_exit() {
        let mut attempts = 0;
        {
            let _scope = AttemptScope::enter(&mut attempts);
        }
        let run = |attempts: &mut usize| -> Result<(), ()> {
            let _scope = AttemptScope::enter(attempts);
            Err(())
        };
        assert!(run(&mut attempts).is_err());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn invocation_states_only_move_forward() {
        use InvocationState::*;
        let mut state = NotStarted;
        for next in [Preparing, Backoff, Executing, Retrying, Preparing, Exhausted] {
            assert!(state.can_move_to(next), "{state:?} -> {next:?}");
            state.advance(next);
        }
        assert!(!NotStarted.can_move_to(Executing));
        assert!(!Succeeded.can_move_to(Preparing));
        assert!(!Exhausted.can_move_to(Retrying));
        assert!(!Backoff.can_move_to(Succeeded));
    }

    #[test]
    fn bare_endpoint_uses_configured_protocol() {
        let client = builder()
            .configuration(
                ClientConfiguration::new()
                    .protocol(Protocol::Http)
                    .endpoint("127.0.0.1:8080"),
            )
            .try_build()
            .expect("client");
        assert_eq!(client.endpoint().to_string(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn endpoint_scheme_must_agree_with_configured_protocol() {
        let error = builder()
            .configuration(
                ClientConfiguration::new()
                    .protocol(Protocol::Https)
                    .endpoint("http://127.0.0.1:8080"),
            )
            .try_build()
            .expect_err("http endpoint with https protocol");
        assert!(error.is_configuration());
        assert!(error.to_string().contains("conflicts with configured protocol"));

        let client = builder()
            .configuration(
                ClientConfiguration::new()
                    .protocol(Protocol::Http)
                    .endpoint("http://127.0.0.1:8080"),
            )
            .try_build()
            .expect("matching scheme");
        assert_eq!(client.endpoint().scheme_str(), Some("http"));

        let client = builder()
            .configuration(ClientConfiguration::new().endpoint("http://127.0.0.1:8080"))
            .try_build()
            .expect("scheme alone decides when no protocol is configured");
        assert_eq!(client.endpoint().scheme_str(), Some("http"));
    }

    #[test]
    fn unknown_endpoint_scheme_fails_before_any_attempt() {
        let error = builder()
            .configuration(ClientConfiguration::new().endpoint("gopher://example.com"))
            .try_build()
            .expect_err("gopher is not supported");
        assert!(error.is_configuration());
    }

    #[test]
    fn missing_endpoint_or_credentials_is_a_configuration_error() {
        let error = builder()
            .try_build()
            .expect_err("endpoint is required");
        assert!(error.is_configuration());

        let error = InvokeClient::builder()
            .configuration(ClientConfiguration::new().endpoint("https://sqs.amazonaws.com"))
            .try_build()
            .expect_err("credentials are required");
        assert!(error.is_configuration());
    }
}
