use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{ErrorClass, InvokeError};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default)]
pub struct InvokeMetricsSnapshot {
    pub invocations_started: u64,
    pub invocations_succeeded: u64,
    pub invocations_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub service_errors: u64,
    pub client_errors: u64,
    pub configuration_errors: u64,
    pub connections_discarded: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Invocation counters shared by a client and its execution contexts.
///
/// Disabled metrics are free: every recorder returns immediately.
#[derive(Clone, Debug, Default)]
pub struct InvokeMetrics {
    inner: Option<Arc<InvokeMetricsInner>>,
}

#[derive(Debug, Default)]
struct InvokeMetricsInner {
    invocations_started: AtomicU64,
    invocations_succeeded: AtomicU64,
    invocations_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    service_errors: AtomicU64,
    client_errors: AtomicU64,
    configuration_errors: AtomicU64,
    connections_discarded: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<InvokeMetricsInner>>,
}

impl InvokeMetrics {
    pub fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(InvokeMetricsInner::default())),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub(crate) fn record_invocation_started(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.invocations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_attempt(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_status(&self, status: u16) {
        self.add_status_count(status);
    }

    pub(crate) fn record_connections_discarded(&self, count: usize) {
        let Some(inner) = &self.inner else {
            return;
        };
        if count > 0 {
            inner
                .connections_discarded
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Classifies one failed attempt.
    pub(crate) fn record_attempt_error(&self, error: &InvokeError) {
        let Some(inner) = &self.inner else {
            return;
        };
        match error.class() {
            ErrorClass::Service => {
                inner.service_errors.fetch_add(1, Ordering::Relaxed);
            }
            ErrorClass::Client => {
                inner.client_errors.fetch_add(1, Ordering::Relaxed);
            }
            ErrorClass::Configuration => {
                inner.configuration_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        let key = match error {
            InvokeError::Client { kind, .. } => format!("client:{kind}"),
            InvokeError::Transport { kind, .. } => format!("transport:{kind}"),
            InvokeError::Timeout { phase, .. } => format!("timeout:{phase}"),
            InvokeError::Service(service_error) => match &service_error.error_code {
                Some(code) => format!("service:{code}"),
                None => format!("service:{}", service_error.status),
            },
            other => other.code().as_str().to_owned(),
        };
        self.add_error_count(key);
    }

    pub(crate) fn record_invocation_completed(&self, succeeded: bool, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        if succeeded {
            inner.invocations_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.invocations_failed.fetch_add(1, Ordering::Relaxed);
        }
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    pub fn snapshot(&self) -> InvokeMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return InvokeMetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        InvokeMetricsSnapshot {
            invocations_started: inner.invocations_started.load(Ordering::Relaxed),
            invocations_succeeded: inner.invocations_succeeded.load(Ordering::Relaxed),
            invocations_failed: inner.invocations_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            service_errors: inner.service_errors.load(Ordering::Relaxed),
            client_errors: inner.client_errors.load(Ordering::Relaxed),
            configuration_errors: inner.configuration_errors.load(Ordering::Relaxed),
            connections_discarded: inner.connections_discarded.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn add_status_count(&self, status: u16) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut status_counts = lock_unpoisoned(&inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
