use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::uri::PathAndQuery;
use http::Uri;
use tracing::debug;

use crate::InvokeResult;
use crate::context::ExecutionContext;
use crate::error::InvokeError;
use crate::handler::{ErrorResponseHandler, ResponseHandler};
use crate::interceptor::ResponseSummary;
use crate::pool::{PooledClient, WireRequest};
use crate::request::{Request, RequestContent};
use crate::util::{encode_parameters, uses_payload_for_query_parameters};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Builds the absolute request URI from the endpoint, resource path and an
/// optional query string. An empty resource path maps to the root.
pub(crate) fn request_uri(endpoint: &Uri, resource_path: &str, query: Option<&str>) -> InvokeResult<Uri> {
    let base_path = endpoint.path().trim_end_matches('/');
    let resource_path = resource_path.trim_start_matches('/');
    let mut path_and_query = format!("{base_path}/{resource_path}");
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let invalid = || InvokeError::InvalidUri {
        uri: format!("{endpoint}{resource_path}"),
    };
    let path_and_query = path_and_query
        .parse::<PathAndQuery>()
        .map_err(|_| invalid())?;
    let mut parts = endpoint.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).map_err(|_| invalid())
}

/// Dispatches one prepared attempt and classifies the response.
///
/// `after_response` or `after_error` runs here for every outcome once the
/// wire call has been attempted.
pub(crate) async fn execute<X>(
    request: &mut Request,
    pool: &PooledClient,
    response_handler: &dyn ResponseHandler<X>,
    error_handler: &dyn ErrorResponseHandler,
    context: &ExecutionContext,
    attempt: usize,
) -> InvokeResult<X> {
    let result = dispatch(request, pool, response_handler, error_handler, context, attempt).await;
    if let Err((error, summary)) = &result {
        for interceptor in context.get_interceptors() {
            interceptor.after_error(request, summary.as_ref(), error);
        }
    }
    result.map_err(|(error, _)| error)
}

type AttemptFailure = (InvokeError, Option<ResponseSummary>);

async fn dispatch<X>(
    request: &mut Request,
    pool: &PooledClient,
    response_handler: &dyn ResponseHandler<X>,
    error_handler: &dyn ErrorResponseHandler,
    context: &ExecutionContext,
    attempt: usize,
) -> Result<X, AttemptFailure> {
    let wire_request = wire_request(request).map_err(|error| (error, None))?;
    let metrics = context.get_metrics();

    let response = pool
        .submit(wire_request)
        .await
        .map_err(|error| (error, None))?;
    metrics.record_connections_discarded(response.connections_discarded());
    let status = response.status();
    metrics.record_status(status.as_u16());
    let summary = ResponseSummary::new(status, response.headers().clone(), attempt);
    debug!(status = status.as_u16(), "received response");

    if status.is_success() {
        return match response_handler.handle(response).await {
            Ok(result) => {
                for interceptor in context.get_interceptors() {
                    interceptor.after_response(request, &summary);
                }
                Ok(result)
            }
            Err(error) => Err((error, Some(summary))),
        };
    }

    match error_handler.handle(response).await {
        Ok(mut service_error) => {
            service_error.set_service_name(request.service_name());
            Err((InvokeError::service(service_error), Some(summary)))
        }
        Err(error) => Err((error, Some(summary))),
    }
}

fn wire_request(request: &mut Request) -> InvokeResult<WireRequest> {
    let endpoint = request
        .endpoint()
        .cloned()
        .ok_or_else(|| InvokeError::configuration("request has no endpoint"))?;
    let mut content = request.take_content();
    let query = encode_parameters(request.parameters());
    let mut headers = request.headers().clone();

    let uri = if uses_payload_for_query_parameters(request.method(), content.is_some())
        && let Some(query) = query.as_ref()
    {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
        content = Some(RequestContent::Buffered(Bytes::from(query.clone())));
        request_uri(&endpoint, request.get_resource_path(), None)?
    } else {
        request_uri(&endpoint, request.get_resource_path(), query.as_deref())?
    };

    let wire = WireRequest::new(request.method().clone(), uri).headers(headers);
    Ok(match content {
        Some(content) => wire.body(content),
        None => wire,
    })
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;

    fn endpoint(text: &str) -> Uri {
        text.parse().expect("uri")
    }

    #[test]
    fn empty_resource_path_maps_to_root() {
        let uri = request_uri(&endpoint("https://sqs.us-east-1.amazonaws.com"), "", None)
            .expect("uri");
        assert_eq!(uri.to_string(), "https://sqs.us-east-1.amazonaws.com/");
    }

    #[test]
    fn resource_path_and_query_are_joined() {
        let uri = request_uri(
            &endpoint("http://127.0.0.1:8080/base/"),
            "/queues/q1",
            Some("Action=List&Max=5"),
        )
        .expect("uri");
        assert_eq!(uri.to_string(), "http://127.0.0.1:8080/base/queues/q1?Action=List&Max=5");
    }

    #[test]
    fn content_less_post_moves_parameters_into_form_body() {
        let mut request = Request::new("AmazonCloudWatch", Method::POST)
            .parameter("Action", "ListMetrics")
            .parameter("Version", "2010-08-01");
        request.set_endpoint(endpoint("https://monitoring.us-east-1.amazonaws.com"));

        let wire = wire_request(&mut request).expect("wire request");
        assert_eq!(wire.uri().query(), None);
        assert_eq!(
            wire.get_headers().get(CONTENT_TYPE).map(HeaderValue::as_bytes),
            Some(FORM_CONTENT_TYPE.as_bytes())
        );
        assert!(format!("{wire:?}").contains("Buffered"));
    }

    #[test]
    fn get_parameters_go_into_the_query_string() {
        let mut request = Request::new("AmazonSQS", Method::GET)
            .resource_path("/q")
            .parameter("Action", "ReceiveMessage");
        request.set_endpoint(endpoint("https://sqs.us-east-1.amazonaws.com"));

        let wire = wire_request(&mut request).expect("wire request");
        assert_eq!(wire.uri().path(), "/q");
        assert_eq!(wire.uri().query(), Some("Action=ReceiveMessage"));
        assert!(wire.get_headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn query_string_keeps_parameter_insertion_order() {
        let mut request = Request::new("AmazonSQS", Method::GET)
            .parameter("Version", "2012-11-05")
            .parameter("Action", "ListQueues");
        request.set_endpoint(endpoint("https://sqs.us-east-1.amazonaws.com"));

        let wire = wire_request(&mut request).expect("wire request");
        assert_eq!(
            wire.uri().query(),
            Some("Version=2012-11-05&Action=ListQueues")
        );
    }

    #[test]
    fn post_with_content_keeps_parameters_in_query() {
        let mut request = Request::new("svc", Method::POST)
            .parameter("uploadId", "7")
            .content("payload");
        request.set_endpoint(endpoint("http://localhost"));

        let wire = wire_request(&mut request).expect("wire request");
        assert_eq!(wire.uri().query(), Some("uploadId=7"));
        assert!(request.get_content().is_none());
    }

    #[test]
    fn missing_endpoint_is_a_configuration_error() {
        let mut request = Request::new("svc", Method::GET);
        let error = wire_request(&mut request).expect_err("no endpoint");
        assert!(error.is_configuration());
    }
}
