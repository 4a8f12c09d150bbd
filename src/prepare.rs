use std::sync::Arc;

use http::header::{ACCEPT_ENCODING, HeaderValue, USER_AGENT};
use http::Uri;
use tracing::debug;

use crate::InvokeResult;
use crate::auth::CredentialsProvider;
use crate::config::ClientConfiguration;
use crate::context::ExecutionContext;
use crate::error::{ClientErrorKind, InvokeError};
use crate::request::Request;
use crate::signer::{SignerRegistry, parse_region_name, signing_service_name};

const USER_AGENT_PREFIX: &str = "rx-";

/// Readies a request for one attempt: endpoint and clock skew, fixed
/// headers, credentials, interceptors and finally the signature.
pub(crate) struct RequestPreparer {
    endpoint: Uri,
    user_agent: HeaderValue,
    use_gzip: bool,
    time_offset: i64,
    default_region: Option<String>,
    credentials_provider: Arc<dyn CredentialsProvider>,
    signers: Arc<SignerRegistry>,
}

impl RequestPreparer {
    pub(crate) fn new(
        endpoint: Uri,
        config: &ClientConfiguration,
        credentials_provider: Arc<dyn CredentialsProvider>,
        signers: Arc<SignerRegistry>,
    ) -> InvokeResult<Self> {
        let user_agent = format!("{USER_AGENT_PREFIX}{}", config.get_user_agent());
        let user_agent = HeaderValue::from_str(&user_agent).map_err(|_| {
            InvokeError::configuration(format!("invalid user agent: {user_agent}"))
        })?;
        Ok(Self {
            endpoint,
            user_agent,
            use_gzip: config.get_use_gzip(),
            time_offset: config.get_time_offset(),
            default_region: config.get_default_region().map(ToOwned::to_owned),
            credentials_provider,
            signers,
        })
    }

    pub(crate) fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    pub(crate) async fn prepare(
        &self,
        request: &mut Request,
        context: &mut ExecutionContext,
    ) -> InvokeResult<()> {
        request.set_endpoint(self.endpoint.clone());
        request.set_time_offset(self.time_offset);

        let custom_headers = request.original().custom_headers().to_vec();
        let headers = request.headers_mut();
        for (name, value) in custom_headers {
            headers.insert(name, value);
        }
        headers.insert(USER_AGENT, self.user_agent.clone());
        if self.use_gzip {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let credentials = match request.original().get_request_credentials() {
            Some(credentials) => credentials.clone(),
            None => self.credentials_provider.credentials().await.map_err(|error| {
                match error {
                    InvokeError::Configuration { .. } | InvokeError::Client { .. } => error,
                    other => InvokeError::client_with_source(
                        ClientErrorKind::Credentials,
                        "failed to resolve credentials",
                        other,
                    ),
                }
            })?,
        };
        context.set_credentials(credentials.clone());

        for interceptor in context.get_interceptors() {
            if let Some(consumer) = interceptor.credentials_consumer() {
                consumer.set_credentials(&credentials);
            }
            interceptor.before_request(request)?;
        }

        let service_name = signing_service_name(request.service_name());
        let host = self.endpoint.host().unwrap_or_default();
        let region_name = parse_region_name(host, &service_name, self.default_region.as_deref());
        debug!(service = %service_name, region = %region_name, "signing request");
        let signer = self.signers.signer(&service_name, &region_name)?;
        signer.sign(request, &credentials)
    }
}
