use std::str::FromStr;
use std::time::Duration;

use crate::InvokeResult;
use crate::error::InvokeError;
use crate::retry::RetryPolicy;

pub(crate) const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(50);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub(crate) const DEFAULT_USER_AGENT: &str = "sdkcall/0.1";
pub(crate) const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
/// Idle pooled connections are closed after this long, regardless of configuration.
pub(crate) const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Longest wait for a free connection slot once `max_connections` are busy.
pub(crate) const CONNECTION_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub const fn is_secure(self) -> bool {
        matches!(self, Self::Https)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = InvokeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => Err(InvokeError::configuration(format!(
                "unknown protocol: {text}"
            ))),
        }
    }
}

/// Root certificates a secure pooled client trusts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsTrust {
    #[default]
    WebPki,
    System,
}

#[derive(Clone, Debug)]
pub struct ClientConfiguration {
    protocol: Option<Protocol>,
    endpoint: Option<String>,
    socket_timeout: Duration,
    connect_timeout: Duration,
    max_connections: usize,
    connection_ttl: Option<Duration>,
    use_gzip: bool,
    user_agent: String,
    time_offset: i64,
    default_region: Option<String>,
    max_response_body_bytes: usize,
    tls_trust: TlsTrust,
    retry_policy: RetryPolicy,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        ClientProfile::default().configuration()
    }
}

impl ClientConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme for a bare-host endpoint. When the endpoint carries its own
    /// scheme, the two must agree or the client fails to build.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Parses the protocol from text; anything other than http/https is rejected.
    pub fn try_protocol(self, protocol: &str) -> InvokeResult<Self> {
        let protocol = protocol.parse()?;
        Ok(self.protocol(protocol))
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = socket_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Connections active for longer than `ttl` are discarded when released.
    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = Some(ttl);
        self
    }

    pub fn clear_connection_ttl(mut self) -> Self {
        self.connection_ttl = None;
        self
    }

    pub fn use_gzip(mut self, use_gzip: bool) -> Self {
        self.use_gzip = use_gzip;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Clock skew in seconds applied to signing timestamps.
    pub fn time_offset(mut self, time_offset: i64) -> Self {
        self.time_offset = time_offset;
        self
    }

    pub fn default_region(mut self, region: impl Into<String>) -> Self {
        self.default_region = Some(region.into());
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn tls_trust(mut self, tls_trust: TlsTrust) -> Self {
        self.tls_trust = tls_trust;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// The configured protocol, `https` when none was set.
    pub fn get_protocol(&self) -> Protocol {
        self.protocol.unwrap_or(Protocol::Https)
    }

    pub(crate) fn explicit_protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn get_endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn get_socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn get_connection_ttl(&self) -> Option<Duration> {
        self.connection_ttl
    }

    pub fn get_use_gzip(&self) -> bool {
        self.use_gzip
    }

    pub fn get_user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn get_time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn get_default_region(&self) -> Option<&str> {
        self.default_region.as_deref()
    }

    pub fn get_max_response_body_bytes(&self) -> usize {
        self.max_response_body_bytes
    }

    pub fn get_tls_trust(&self) -> TlsTrust {
        self.tls_trust
    }

    pub fn get_retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    HighThroughput,
}

impl ClientProfile {
    pub fn configuration(self) -> ClientConfiguration {
        let base = ClientConfiguration {
            protocol: None,
            endpoint: None,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_ttl: None,
            use_gzip: false,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            time_offset: 0,
            default_region: None,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            tls_trust: TlsTrust::WebPki,
            retry_policy: RetryPolicy::standard(),
        };
        match self {
            Self::StandardSdk => base,
            Self::LowLatency => ClientConfiguration {
                socket_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(1),
                max_response_body_bytes: 2 * 1024 * 1024,
                retry_policy: RetryPolicy::standard()
                    .max_error_retry(1)
                    .base_delay(Duration::from_millis(50))
                    .max_backoff(Duration::from_millis(300)),
                ..base
            },
            Self::HighThroughput => ClientConfiguration {
                socket_timeout: Duration::from_secs(20),
                max_connections: 200,
                connection_ttl: Some(Duration::from_secs(60)),
                use_gzip: true,
                max_response_body_bytes: 32 * 1024 * 1024,
                retry_policy: RetryPolicy::standard()
                    .max_error_retry(4)
                    .base_delay(Duration::from_millis(150))
                    .max_backoff(Duration::from_secs(3)),
                ..base
            },
        }
    }
}
