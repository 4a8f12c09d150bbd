use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{CaptureConnection, capture_connection};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::InvokeResult;
use crate::body::{
    ReadBodyError, ReqBody, buffered_req_body, build_http_request, empty_req_body,
    read_all_body_limited,
};
use crate::config::{
    CONNECTION_ACQUIRE_TIMEOUT, ClientConfiguration, POOL_IDLE_TIMEOUT, Protocol, TlsTrust,
};
use crate::content_encoding::{DecodeContentEncodingError, decode_body_limited, should_decode};
use crate::error::{ClientErrorKind, InvokeError, TimeoutPhase};
use crate::lifetime::{ConnectionLifetime, LifetimeConnector, Release};
use crate::request::RequestContent;
use crate::redirect::{MAX_REDIRECTS, next_hop};
use crate::util::{
    classify_transport_error, read_unpoisoned, redact_uri_for_logs, write_unpoisoned,
};

type TransportClient = Client<HttpsConnector<LifetimeConnector>, ReqBody>;

/// A request ready for the wire: absolute URI, final headers, optional body.
#[derive(Debug)]
pub struct WireRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<RequestContent>,
}

impl WireRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: RequestContent) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn get_headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// A fully buffered, decoded response.
#[derive(Clone, Debug)]
pub struct WireResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    connections_discarded: usize,
}

impl WireResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            connections_discarded: 0,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether a connection used for this response, redirect hops included,
    /// outlived its TTL and was dropped from the pool.
    pub fn connection_discarded(&self) -> bool {
        self.connections_discarded > 0
    }

    pub fn connections_discarded(&self) -> usize {
        self.connections_discarded
    }
}

/// Long-lived transport client bound to one `protocol|host` key.
pub struct PooledClient {
    key: String,
    protocol: Protocol,
    transport: TransportClient,
    permits: Arc<Semaphore>,
    socket_timeout: Duration,
    max_response_body_bytes: usize,
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PooledClient")
            .field("key", &self.key)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl PooledClient {
    fn build(key: String, protocol: Protocol, config: &ClientConfiguration) -> InvokeResult<Self> {
        let connector = LifetimeConnector::new(
            config.get_connect_timeout(),
            config.get_connection_ttl(),
        );
        let tls_config = build_rustls_tls_config(config.get_tls_trust())?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let transport = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(config.get_max_connections())
            .pool_timer(TokioTimer::new())
            .build(https);

        debug!(pool = %key, "created pooled client");
        Ok(Self {
            key,
            protocol,
            transport,
            permits: Arc::new(Semaphore::new(config.get_max_connections())),
            socket_timeout: config.get_socket_timeout(),
            max_response_body_bytes: config.get_max_response_body_bytes(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn acquire_permit(&self, method: &Method, uri: &str) -> InvokeResult<OwnedSemaphorePermit> {
        match timeout(
            CONNECTION_ACQUIRE_TIMEOUT,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(InvokeError::client(
                ClientErrorKind::Other,
                format!("connection pool {} is closed", self.key),
            )),
            Err(_) => Err(InvokeError::Timeout {
                phase: TimeoutPhase::PoolAcquire,
                timeout_ms: CONNECTION_ACQUIRE_TIMEOUT.as_millis(),
                method: method.clone(),
                uri: uri.to_owned(),
            }),
        }
    }

    /// Sends one request, following redirects, and buffers the decoded body.
    pub async fn submit(&self, request: WireRequest) -> InvokeResult<WireResponse> {
        let WireRequest {
            mut method,
            mut uri,
            mut headers,
            body,
        } = request;
        let (mut buffered_body, mut streaming_body) = match body {
            None => (None, None),
            Some(RequestContent::Buffered(bytes)) => (Some(bytes), None),
            Some(RequestContent::Streaming(stream)) => (None, Some(stream)),
        };
        let sent_streaming_body = streaming_body.is_some();
        let mut redacted_uri = redact_uri_for_logs(&uri);
        let _permit = self.acquire_permit(&method, &redacted_uri).await?;
        let mut redirect_count = 0_usize;
        let mut connections_discarded = 0_usize;

        loop {
            let request_body = match &buffered_body {
                Some(bytes) => buffered_req_body(bytes.clone()),
                None => streaming_body.take().unwrap_or_else(empty_req_body),
            };
            let mut http_request =
                build_http_request(method.clone(), uri.clone(), &headers, request_body)?;
            let captured = capture_connection(&mut http_request);

            debug!(pool = %self.key, %method, uri = %redacted_uri, "sending wire request");
            let response = match timeout(self.socket_timeout, self.transport.request(http_request))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(source)) => {
                    return Err(InvokeError::Transport {
                        kind: classify_transport_error(&source),
                        method,
                        uri: redacted_uri,
                        source: Box::new(source),
                    });
                }
                Err(_) => {
                    return Err(InvokeError::Timeout {
                        phase: TimeoutPhase::ResponseHead,
                        timeout_ms: self.socket_timeout.as_millis(),
                        method,
                        uri: redacted_uri,
                    });
                }
            };

            let status = response.status();
            if let Some(hop) = next_hop(
                &method,
                &uri,
                status,
                response.headers(),
                !sent_streaming_body,
            ) {
                if redirect_count >= MAX_REDIRECTS {
                    return Err(InvokeError::RedirectLimitExceeded {
                        max_redirects: MAX_REDIRECTS,
                        method,
                        uri: redacted_uri,
                    });
                }
                // The hop's connection goes back to the pool only once its
                // body is drained, so it gets the same lifetime check.
                let _ = timeout(
                    self.socket_timeout,
                    read_all_body_limited(response.into_body(), self.max_response_body_bytes),
                )
                .await;
                connections_discarded += usize::from(self.release_connection(&captured));
                hop.scrub(&mut headers);
                if hop.body_dropped {
                    buffered_body = None;
                }
                redirect_count += 1;
                method = hop.method;
                uri = hop.uri;
                redacted_uri = redact_uri_for_logs(&uri);
                debug!(
                    pool = %self.key,
                    status = status.as_u16(),
                    redirect_count,
                    uri = %redacted_uri,
                    "following redirect"
                );
                continue;
            }

            let mut response_headers = response.headers().clone();
            let body = match timeout(
                self.socket_timeout,
                read_all_body_limited(response.into_body(), self.max_response_body_bytes),
            )
            .await
            {
                Ok(Ok(body)) => body,
                Ok(Err(ReadBodyError::Read(source))) => {
                    return Err(InvokeError::client_with_source(
                        ClientErrorKind::ReadBody,
                        format!("failed to read response body for {method} {redacted_uri}"),
                        source,
                    ));
                }
                Ok(Err(ReadBodyError::TooLarge { actual_bytes })) => {
                    return Err(InvokeError::ResponseBodyTooLarge {
                        limit_bytes: self.max_response_body_bytes,
                        actual_bytes,
                        method,
                        uri: redacted_uri,
                    });
                }
                Err(_) => {
                    return Err(InvokeError::Timeout {
                        phase: TimeoutPhase::ResponseBody,
                        timeout_ms: self.socket_timeout.as_millis(),
                        method,
                        uri: redacted_uri,
                    });
                }
            };
            connections_discarded += usize::from(self.release_connection(&captured));

            let body = if should_decode(&method, status, body.len()) {
                decode_body_limited(body, &mut response_headers, self.max_response_body_bytes)
                    .map_err(|error| match error {
                        DecodeContentEncodingError::Decode { encoding, message } => {
                            InvokeError::DecodeContentEncoding {
                                encoding,
                                method: method.clone(),
                                uri: redacted_uri.clone(),
                                message,
                            }
                        }
                        DecodeContentEncodingError::TooLarge { actual_bytes } => {
                            InvokeError::ResponseBodyTooLarge {
                                limit_bytes: self.max_response_body_bytes,
                                actual_bytes,
                                method: method.clone(),
                                uri: redacted_uri.clone(),
                            }
                        }
                    })?
            } else {
                body
            };

            return Ok(WireResponse {
                status,
                headers: response_headers,
                body,
                connections_discarded,
            });
        }
    }

    /// Runs the lifetime check for the connection that served a completed
    /// response; an expired connection is poisoned so the pool drops it.
    fn release_connection(&self, captured: &CaptureConnection) -> bool {
        let metadata = captured.connection_metadata();
        let Some(connected) = metadata.as_ref() else {
            return false;
        };
        let mut extras = http::Extensions::new();
        connected.get_extras(&mut extras);
        let Some(lifetime) = extras.get::<ConnectionLifetime>() else {
            return false;
        };
        if lifetime.release(Instant::now()) == Release::Discard {
            connected.poison();
            debug!(pool = %self.key, "connection outlived its ttl; discarding");
            return true;
        }
        false
    }
}

fn build_rustls_root_store(tls_trust: TlsTrust) -> InvokeResult<rustls::RootCertStore> {
    match tls_trust {
        TlsTrust::WebPki => Ok(rustls::RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        )),
        TlsTrust::System => {
            let mut root_store = rustls::RootCertStore::empty();
            let loaded = rustls_native_certs::load_native_certs();
            if !loaded.errors.is_empty() {
                warn!(
                    error_count = loaded.errors.len(),
                    "system root certificate loading returned partial errors"
                );
            }
            let (added, _ignored) = root_store.add_parsable_certificates(loaded.certs);
            if added == 0 {
                return Err(InvokeError::configuration(
                    "failed to load system root certificates",
                ));
            }
            Ok(root_store)
        }
    }
}

fn build_rustls_tls_config(tls_trust: TlsTrust) -> InvokeResult<rustls::ClientConfig> {
    let root_store = build_rustls_root_store(tls_trust)?;
    let config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|source| {
                InvokeError::configuration(format!("failed to initialize rustls: {source}"))
            })?
            .with_root_certificates(root_store)
            .with_no_client_auth();
    Ok(config)
}

/// Registry key and protocol for an endpoint. An explicit port becomes part
/// of the host component; any scheme besides http/https is rejected.
pub(crate) fn pool_key(endpoint: &Uri) -> InvokeResult<(Protocol, String)> {
    let scheme = endpoint.scheme_str().ok_or_else(|| InvokeError::InvalidUri {
        uri: endpoint.to_string(),
    })?;
    let protocol: Protocol = scheme.parse()?;
    let host = endpoint
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| InvokeError::InvalidUri {
            uri: endpoint.to_string(),
        })?
        .to_ascii_lowercase();
    let key = match endpoint.port_u16() {
        Some(port) => format!("{protocol}|{host}:{port}"),
        None => format!("{protocol}|{host}"),
    };
    Ok((protocol, key))
}

/// Registry of pooled clients keyed by `protocol|host`.
///
/// Entries are created lazily and never removed. When two callers race to
/// create the same entry, the first insert wins and the other client is
/// dropped.
#[derive(Debug, Default)]
pub struct ConnectionPoolManager {
    clients: RwLock<BTreeMap<String, Arc<PooledClient>>>,
}

static GLOBAL_POOL: OnceLock<Arc<ConnectionPoolManager>> = OnceLock::new();

impl ConnectionPoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry shared by clients that were not given their own.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Returns the pooled client for `endpoint`, creating it from `config` on
    /// first use. Later lookups ignore `config`.
    pub fn client_for(
        &self,
        endpoint: &Uri,
        config: &ClientConfiguration,
    ) -> InvokeResult<Arc<PooledClient>> {
        let (protocol, key) = pool_key(endpoint)?;
        if let Some(client) = read_unpoisoned(&self.clients).get(&key) {
            return Ok(Arc::clone(client));
        }

        let created = Arc::new(PooledClient::build(key.clone(), protocol, config)?);
        let mut clients = write_unpoisoned(&self.clients);
        Ok(Arc::clone(clients.entry(key).or_insert(created)))
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.clients).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
