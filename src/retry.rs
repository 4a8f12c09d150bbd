use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{ClientErrorKind, InvokeError, TransportErrorKind};
use crate::request::OriginalRequest;

/// Decides whether another attempt is warranted after a failure.
pub trait RetryCondition: Send + Sync {
    fn should_retry(
        &self,
        original: &OriginalRequest,
        last_error: Option<&InvokeError>,
        attempts: usize,
    ) -> bool;
}

/// Computes the wait before the next attempt.
pub trait BackoffStrategy: Send + Sync {
    fn delay_before_next_retry(
        &self,
        original: &OriginalRequest,
        last_error: Option<&InvokeError>,
        attempts: usize,
    ) -> Duration;
}

/// Retries transient transport failures, timeouts, throttling, 5xx and
/// clock-skew rejections. Configuration errors are never retried.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryCondition;

const CLOCK_SKEW_ERROR_CODES: &[&str] = &[
    "RequestTimeTooSkewed",
    "RequestExpired",
    "InvalidSignatureException",
    "SignatureDoesNotMatch",
    "AuthFailure",
    "RequestInTheFuture",
];

impl RetryCondition for DefaultRetryCondition {
    fn should_retry(
        &self,
        _original: &OriginalRequest,
        last_error: Option<&InvokeError>,
        _attempts: usize,
    ) -> bool {
        let Some(error) = last_error else {
            return false;
        };
        match error {
            InvokeError::Configuration { .. } => false,
            InvokeError::Transport { kind, .. } => matches!(
                kind,
                TransportErrorKind::Dns | TransportErrorKind::Connect | TransportErrorKind::Read
            ),
            InvokeError::Timeout { .. } => true,
            InvokeError::Client { kind, .. } => matches!(kind, ClientErrorKind::ReadBody),
            InvokeError::Service(service) => {
                service.status >= 500
                    || service.is_throttling()
                    || service
                        .error_code
                        .as_deref()
                        .is_some_and(|code| CLOCK_SKEW_ERROR_CODES.contains(&code))
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NeverRetry;

impl RetryCondition for NeverRetry {
    fn should_retry(
        &self,
        _original: &OriginalRequest,
        _last_error: Option<&InvokeError>,
        _attempts: usize,
    ) -> bool {
        false
    }
}

/// Capped exponential backoff with symmetric jitter. Throttling errors start
/// from a larger base delay; a server `Retry-After` hint is honored when it
/// asks for a longer wait.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    throttled_base_delay: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            throttled_base_delay: Duration::from_millis(500),
            max_backoff: Duration::from_secs(20),
            jitter_ratio: 0.2,
        }
    }
}

impl ExponentialBackoff {
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay.max(Duration::from_millis(1));
        if self.max_backoff < self.base_delay {
            self.max_backoff = self.base_delay;
        }
        self
    }

    pub fn throttled_base_delay(mut self, throttled_base_delay: Duration) -> Self {
        self.throttled_base_delay = throttled_base_delay.max(Duration::from_millis(1));
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_delay);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    fn exponential_delay(&self, base: Duration, attempts: usize) -> Duration {
        let capped_exponent = attempts.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = base.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay_before_next_retry(
        &self,
        _original: &OriginalRequest,
        last_error: Option<&InvokeError>,
        attempts: usize,
    ) -> Duration {
        let service = last_error.and_then(InvokeError::service_error);
        let throttled = service.is_some_and(|error| error.is_throttling());
        let base = if throttled {
            self.throttled_base_delay
        } else {
            self.base_delay
        };
        let computed = self.exponential_delay(base, attempts);
        match service.and_then(|error| error.retry_after_ms) {
            Some(retry_after_ms) => computed.max(Duration::from_millis(retry_after_ms)),
            None => computed,
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_error_retry: usize,
    retry_condition: Arc<dyn RetryCondition>,
    exponential_backoff: ExponentialBackoff,
    custom_backoff: Option<Arc<dyn BackoffStrategy>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_error_retry", &self.max_error_retry)
            .field("exponential_backoff", &self.exponential_backoff)
            .field("custom_backoff", &self.custom_backoff.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_error_retry: 3,
            retry_condition: Arc::new(DefaultRetryCondition),
            exponential_backoff: ExponentialBackoff::default(),
            custom_backoff: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            max_error_retry: 0,
            retry_condition: Arc::new(NeverRetry),
            exponential_backoff: ExponentialBackoff::default(),
            custom_backoff: None,
        }
    }

    /// Number of retries allowed after the first attempt.
    pub fn max_error_retry(mut self, max_error_retry: usize) -> Self {
        self.max_error_retry = max_error_retry;
        self
    }

    pub fn retry_condition(mut self, retry_condition: Arc<dyn RetryCondition>) -> Self {
        self.retry_condition = retry_condition;
        self
    }

    pub fn backoff_strategy(mut self, backoff_strategy: Arc<dyn BackoffStrategy>) -> Self {
        self.custom_backoff = Some(backoff_strategy);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.exponential_backoff = self.exponential_backoff.base_delay(base_delay);
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.exponential_backoff = self.exponential_backoff.max_backoff(max_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.exponential_backoff = self.exponential_backoff.jitter_ratio(jitter_ratio);
        self
    }

    pub fn get_max_error_retry(&self) -> usize {
        self.max_error_retry
    }

    pub fn get_retry_condition(&self) -> &dyn RetryCondition {
        self.retry_condition.as_ref()
    }

    pub fn get_backoff_strategy(&self) -> &dyn BackoffStrategy {
        match &self.custom_backoff {
            Some(strategy) => strategy.as_ref(),
            None => &self.exponential_backoff,
        }
    }

    /// Whether attempt number `attempts` (zero-based) may be dispatched.
    pub(crate) fn allows_attempt(
        &self,
        original: &OriginalRequest,
        last_error: Option<&InvokeError>,
        attempts: usize,
    ) -> bool {
        if attempts == 0 {
            return true;
        }
        if last_error.is_some_and(InvokeError::is_configuration) {
            return false;
        }
        attempts <= self.max_error_retry
            && self
                .retry_condition
                .should_retry(original, last_error, attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Delay before attempt number `attempts`; the first attempt never waits.
pub(crate) fn backoff_delay(
    policy: &RetryPolicy,
    original: &OriginalRequest,
    last_error: Option<&InvokeError>,
    attempts: usize,
) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    policy
        .get_backoff_strategy()
        .delay_before_next_retry(original, last_error, attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use http::Method;

    fn service_error(status: u16, code: Option<&str>) -> InvokeError {
        let mut error = ServiceError::new(status, "boom");
        error.error_code = code.map(ToOwned::to_owned);
        InvokeError::service(error)
    }

    #[test]
    fn first_attempt_has_no_backoff() {
        let policy = RetryPolicy::standard();
        let original = OriginalRequest::default();
        assert_eq!(
            backoff_delay(&policy, &original, None, 0),
            Duration::ZERO
        );
    }

    #[test]
    fn exponential_backoff_doubles_and_caps_without_jitter() {
        let backoff = ExponentialBackoff::default()
            .base_delay(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(350))
            .jitter_ratio(0.0);
        let original = OriginalRequest::default();
        let delays: Vec<_> = (1..=4)
            .map(|attempt| backoff.delay_before_next_retry(&original, None, attempt))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn jittered_backoff_never_exceeds_configured_max_backoff() {
        let backoff = ExponentialBackoff::default()
            .base_delay(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(120))
            .jitter_ratio(1.0);
        let original = OriginalRequest::default();
        for _ in 0..256 {
            let delay = backoff.delay_before_next_retry(&original, None, 3);
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[test]
    fn throttling_uses_larger_base_and_honors_retry_after() {
        let backoff = ExponentialBackoff::default()
            .base_delay(Duration::from_millis(10))
            .throttled_base_delay(Duration::from_millis(40))
            .jitter_ratio(0.0);
        let original = OriginalRequest::default();
        let throttled = service_error(429, None);
        assert_eq!(
            backoff.delay_before_next_retry(&original, Some(&throttled), 1),
            Duration::from_millis(40)
        );

        let mut hinted = ServiceError::new(503, "busy");
        hinted.retry_after_ms = Some(2_000);
        let hinted = InvokeError::service(hinted);
        assert_eq!(
            backoff.delay_before_next_retry(&original, Some(&hinted), 1),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn default_condition_classifies_errors() {
        let condition = DefaultRetryCondition;
        let original = OriginalRequest::default();
        let retry = |error: InvokeError| condition.should_retry(&original, Some(&error), 1);

        assert!(retry(service_error(500, None)));
        assert!(retry(service_error(400, Some("ThrottlingException"))));
        assert!(retry(service_error(403, Some("RequestTimeTooSkewed"))));
        assert!(!retry(service_error(404, Some("ResourceNotFound"))));
        assert!(!retry(InvokeError::configuration("unknown protocol: ftp")));
        assert!(retry(InvokeError::Transport {
            kind: TransportErrorKind::Connect,
            method: Method::GET,
            uri: "http://localhost/".to_owned(),
            source: "refused".into(),
        }));
        assert!(!retry(InvokeError::Transport {
            kind: TransportErrorKind::Tls,
            method: Method::GET,
            uri: "https://localhost/".to_owned(),
            source: "bad cert".into(),
        }));
        assert!(!retry(InvokeError::client(ClientErrorKind::Signing, "no key")));
        assert!(!condition.should_retry(&original, None, 1));
    }

    #[test]
    fn allows_attempt_bounds_retries_by_max_error_retry() {
        let policy = RetryPolicy::standard().max_error_retry(2);
        let original = OriginalRequest::default();
        let error = service_error(503, None);
        assert!(policy.allows_attempt(&original, None, 0));
        assert!(policy.allows_attempt(&original, Some(&error), 1));
        assert!(policy.allows_attempt(&original, Some(&error), 2));
        assert!(!policy.allows_attempt(&original, Some(&error), 3));
    }

    #[test]
    fn allows_attempt_never_retries_configuration_errors() {
        let policy = RetryPolicy::standard()
            .retry_condition(Arc::new(AlwaysRetry))
            .max_error_retry(5);
        let original = OriginalRequest::default();
        let error = InvokeError::configuration("unknown signer type");
        assert!(!policy.allows_attempt(&original, Some(&error), 1));
    }

    #[test]
    fn disabled_policy_allows_only_the_first_attempt() {
        let policy = RetryPolicy::disabled();
        let original = OriginalRequest::default();
        let error = service_error(500, None);
        assert!(policy.allows_attempt(&original, None, 0));
        assert!(!policy.allows_attempt(&original, Some(&error), 1));
    }

    struct AlwaysRetry;

    impl RetryCondition for AlwaysRetry {
        fn should_retry(
            &self,
            _original: &OriginalRequest,
            _last_error: Option<&InvokeError>,
            _attempts: usize,
        ) -> bool {
            true
        }
    }
}
