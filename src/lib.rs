//! `sdkcall` is the invocation engine behind request/response service SDKs:
//! it signs a logical request, dispatches it over a pooled HTTP/1.1 + HTTP/2
//! connection, classifies the outcome and retries failed attempts under a
//! pluggable retry policy.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use http::Method;
//! use sdkcall::prelude::{
//!     ClientConfiguration, Credentials, InvokeClient, Request, RetryPolicy,
//!     StaticCredentialsProvider,
//! };
//! use sdkcall::{NO_OP_SIGNER_TYPE, SignerRegistry};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct ListQueuesResponse {
//!     #[serde(rename = "QueueUrls")]
//!     queue_urls: Vec<String>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = InvokeClient::builder()
//!         .client_name("queue-sdk")
//!         .configuration(
//!             ClientConfiguration::new()
//!                 .endpoint("https://sqs.eu-west-1.amazonaws.com")
//!                 .use_gzip(true)
//!                 .retry_policy(RetryPolicy::standard().max_error_retry(2)),
//!         )
//!         .credentials_provider(StaticCredentialsProvider::new(Credentials::new(
//!             "AKIDEXAMPLE",
//!             "secret",
//!         )))
//!         .signer_registry(Arc::new(SignerRegistry::with_default_signer_type(
//!             NO_OP_SIGNER_TYPE,
//!         )))
//!         .try_build()?;
//!
//!     let request = Request::new("AmazonSQS", Method::POST).parameter("Action", "ListQueues");
//!     let mut context = client.execution_context();
//!     let queues: ListQueuesResponse = client.invoke_json(request, Vec::new(), &mut context).await?;
//!     println!("{} queues", queues.queue_urls.len());
//!     Ok(())
//! }
//! ```
//!
//! # Retries
//!
//! - Attempts never exceed `max_error_retry + 1`.
//! - Each retry replays the parameters, headers and content captured before
//!   the first attempt, then prepares and signs the request again.
//! - Configuration errors end the invocation immediately.

mod auth;
mod body;
mod client;
mod config;
mod content_encoding;
mod context;
mod error;
mod execute;
mod handler;
mod interceptor;
mod lifetime;
mod metrics;
mod pool;
mod prepare;
mod redirect;
mod request;
mod retry;
mod signer;
mod util;

pub use crate::auth::{Credentials, CredentialsProvider, StaticCredentialsProvider};
pub use crate::body::{ReqBody, stream_body};
pub use crate::client::{InvokeClient, InvokeClientBuilder};
pub use crate::config::{ClientConfiguration, ClientProfile, Protocol, TlsTrust};
pub use crate::context::ExecutionContext;
pub use crate::error::{
    ClientErrorKind, ErrorClass, ErrorCode, InvokeError, ServiceError, ServiceErrorType,
    TimeoutPhase, TransportErrorKind,
};
pub use crate::handler::{
    ErrorResponseHandler, JsonErrorResponseHandler, JsonErrorRule, JsonResponseHandler,
    ResponseHandler, XmlErrorResponseHandler, XmlErrorRule, XmlResponseHandler,
};
pub use crate::interceptor::{CredentialsConsumer, Interceptor, ResponseSummary};
pub use crate::lifetime::{ConnectionLifetimeTracker, Release};
pub use crate::metrics::{InvokeMetrics, InvokeMetricsSnapshot};
pub use crate::pool::{ConnectionPoolManager, PooledClient, WireRequest, WireResponse};
pub use crate::request::{DEFAULT_READ_LIMIT, OriginalRequest, Request, RequestContent};
pub use crate::retry::{
    BackoffStrategy, DefaultRetryCondition, ExponentialBackoff, NeverRetry, RetryCondition,
    RetryPolicy,
};
pub use crate::signer::{
    AWS4_SIGNER_TYPE, NO_OP_SIGNER_TYPE, NoOpSigner, Signer, SignerFactory, SignerRegistry,
    parse_region_name, signing_service_name,
};

pub type InvokeResult<T> = std::result::Result<T, InvokeError>;

pub mod prelude {
    pub use crate::{
        ClientConfiguration, ClientProfile, Credentials, CredentialsProvider,
        ErrorResponseHandler, ExecutionContext, Interceptor, InvokeClient, InvokeError,
        InvokeResult, JsonErrorRule, OriginalRequest, Protocol, Request, ResponseHandler,
        RetryPolicy, ServiceError, StaticCredentialsProvider, WireResponse, XmlErrorRule,
    };
}
