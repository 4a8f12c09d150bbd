use std::sync::Arc;

use crate::auth::Credentials;
use crate::interceptor::Interceptor;
use crate::metrics::InvokeMetrics;

/// Per-invocation state: resolved credentials, ordered interceptors and the
/// metrics sink. Not shared between invocations.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    credentials: Option<Credentials>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    metrics: InvokeMetrics,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExecutionContext")
            .field("credentials", &self.credentials)
            .field("interceptors", &self.interceptors.len())
            .field("metrics_enabled", &self.metrics.is_enabled())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptors(mut self, interceptors: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    pub fn metrics(mut self, metrics: InvokeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn get_credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    pub fn get_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    pub fn get_metrics(&self) -> &InvokeMetrics {
        &self.metrics
    }
}
