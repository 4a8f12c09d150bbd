use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::InvokeResult;
use crate::auth::Credentials;
use crate::error::InvokeError;
use crate::request::Request;
use crate::util::{read_unpoisoned, write_unpoisoned};

pub const AWS4_SIGNER_TYPE: &str = "AWS4SignerType";
pub const NO_OP_SIGNER_TYPE: &str = "NoOpSignerType";

const DEFAULT_REGION: &str = "us-east-1";
const AMAZONAWS_SUFFIX: &str = ".amazonaws.com";

/// Signs a prepared request in place, typically by adding an authorization
/// header. A failure aborts the current attempt.
pub trait Signer: Send + Sync {
    fn sign(&self, request: &mut Request, credentials: &Credentials) -> InvokeResult<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpSigner;

impl Signer for NoOpSigner {
    fn sign(&self, _request: &mut Request, _credentials: &Credentials) -> InvokeResult<()> {
        Ok(())
    }
}

/// Builds a signer for a `(service, region)` pair.
pub type SignerFactory = Arc<dyn Fn(&str, &str) -> Arc<dyn Signer> + Send + Sync>;

/// Maps signer type identifiers to factories and services to signer types.
///
/// Custom signer types must be registered before the first request that
/// needs them; resolving an unregistered type is a configuration error.
pub struct SignerRegistry {
    factories: RwLock<BTreeMap<String, SignerFactory>>,
    service_signer_types: RwLock<BTreeMap<String, String>>,
    default_signer_type: String,
}

impl std::fmt::Debug for SignerRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<String> = read_unpoisoned(&self.factories).keys().cloned().collect();
        formatter
            .debug_struct("SignerRegistry")
            .field("registered", &registered)
            .field("default_signer_type", &self.default_signer_type)
            .finish()
    }
}

impl Default for SignerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerRegistry {
    pub fn new() -> Self {
        Self::with_default_signer_type(AWS4_SIGNER_TYPE)
    }

    pub fn with_default_signer_type(default_signer_type: impl Into<String>) -> Self {
        let registry = Self {
            factories: RwLock::new(BTreeMap::new()),
            service_signer_types: RwLock::new(BTreeMap::new()),
            default_signer_type: default_signer_type.into(),
        };
        registry.register_signer(NO_OP_SIGNER_TYPE, |_, _| Arc::new(NoOpSigner) as Arc<dyn Signer>);
        registry
    }

    pub fn register_signer<F>(&self, signer_type: impl Into<String>, factory: F)
    where
        F: Fn(&str, &str) -> Arc<dyn Signer> + Send + Sync + 'static,
    {
        write_unpoisoned(&self.factories).insert(signer_type.into(), Arc::new(factory));
    }

    /// Routes one signing service to a specific signer type.
    pub fn set_service_signer_type(
        &self,
        service_name: impl Into<String>,
        signer_type: impl Into<String>,
    ) {
        write_unpoisoned(&self.service_signer_types)
            .insert(service_name.into(), signer_type.into());
    }

    pub fn signer(&self, service_name: &str, region_name: &str) -> InvokeResult<Arc<dyn Signer>> {
        let signer_type = read_unpoisoned(&self.service_signer_types)
            .get(service_name)
            .cloned()
            .unwrap_or_else(|| self.default_signer_type.clone());
        let factory = read_unpoisoned(&self.factories)
            .get(&signer_type)
            .cloned()
            .ok_or_else(|| {
                InvokeError::configuration(format!(
                    "signer type {signer_type} is not registered (service {service_name})"
                ))
            })?;
        Ok(factory(service_name, region_name))
    }
}

/// Derives the signing service identity from a declared client service name:
/// the `Amazon` vendor prefix and a trailing `v2` are dropped, the result is
/// lowercased, and `cloudwatch` signs as `monitoring`.
pub fn signing_service_name(declared: &str) -> String {
    let trimmed = declared.strip_prefix("Amazon").unwrap_or(declared);
    let mut service = trimmed.to_ascii_lowercase();
    if let Some(stripped) = service.strip_suffix("v2") {
        service = stripped.to_owned();
    }
    if service == "cloudwatch" {
        service = "monitoring".to_owned();
    }
    service
}

/// Extracts the region from an endpoint host, falling back to
/// `default_region` (or `us-east-1`) when the host carries none.
pub fn parse_region_name(host: &str, service_hint: &str, default_region: Option<&str>) -> String {
    let fallback = || default_region.unwrap_or(DEFAULT_REGION).to_owned();
    let host = host.to_ascii_lowercase();

    if let Some(fragment) = host.strip_suffix(AMAZONAWS_SUFFIX) {
        return parse_standard_region_name(fragment).unwrap_or_else(fallback);
    }

    if !service_hint.is_empty()
        && let Some(region) = region_after_label(&host, service_hint)
    {
        return region;
    }
    fallback()
}

fn is_region_label(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-')
}

fn parse_standard_region_name(fragment: &str) -> Option<String> {
    if let Some(region) = s3_region(fragment) {
        return Some(region);
    }
    let (_, region) = fragment.rsplit_once('.')?;
    match region {
        "s3" => None,
        "us-gov" => Some("us-gov-west-1".to_owned()),
        region => Some(region.to_owned()),
    }
}

/// `[bucket.]s3-<region>` or `[bucket.]s3.<region>`.
fn s3_region(fragment: &str) -> Option<String> {
    let labels: Vec<&str> = fragment.split('.').collect();
    if let Some(last) = labels.last()
        && let Some(region) = last.strip_prefix("s3-")
        && is_region_label(region)
    {
        return Some(region.to_owned());
    }
    if labels.len() >= 2 && labels[labels.len() - 2] == "s3" {
        let region = labels[labels.len() - 1];
        if is_region_label(region) {
            return Some(region.to_owned());
        }
    }
    None
}

/// `[prefix.]<service>[.-]<region>.<rest>` for non-AWS style hosts.
fn region_after_label(host: &str, service: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(offset) = host[search_from..].find(service) {
        let start = search_from + offset;
        let at_label_start = start == 0 || host.as_bytes()[start - 1] == b'.';
        let rest = &host[start + service.len()..];
        if at_label_start
            && let Some(after_separator) = rest.strip_prefix('.').or_else(|| rest.strip_prefix('-'))
            && let Some((region, _)) = after_separator.split_once('.')
            && is_region_label(region)
        {
            return Some(region.to_owned());
        }
        search_from = start + service.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn signing_service_name_normalizes_aliases() {
        assert_eq!(signing_service_name("AmazonCloudWatch"), "monitoring");
        assert_eq!(signing_service_name("AmazonEC2"), "ec2");
        assert_eq!(signing_service_name("AmazonSQSv2"), "sqs");
        assert_eq!(signing_service_name("AmazonDynamoDBv2"), "dynamodb");
        assert_eq!(signing_service_name("custom"), "custom");
    }

    #[test]
    fn region_parsed_from_standard_endpoints() {
        assert_eq!(
            parse_region_name("monitoring.eu-west-1.amazonaws.com", "monitoring", None),
            "eu-west-1"
        );
        assert_eq!(
            parse_region_name("ec2.us-gov.amazonaws.com", "ec2", None),
            "us-gov-west-1"
        );
        assert_eq!(
            parse_region_name("sqs.amazonaws.com", "sqs", None),
            "us-east-1"
        );
    }

    #[test]
    fn region_parsed_from_s3_endpoints() {
        assert_eq!(
            parse_region_name("bucket.s3-us-west-2.amazonaws.com", "s3", None),
            "us-west-2"
        );
        assert_eq!(
            parse_region_name("bucket.s3.ap-south-1.amazonaws.com", "s3", None),
            "ap-south-1"
        );
        assert_eq!(
            parse_region_name("bucket.s3.amazonaws.com", "s3", None),
            "us-east-1"
        );
    }

    #[test]
    fn region_parsed_from_custom_hosts_using_service_hint() {
        assert_eq!(
            parse_region_name("monitoring.us-west-1.example.internal", "monitoring", None),
            "us-west-1"
        );
        assert_eq!(
            parse_region_name("127.0.0.1", "monitoring", Some("eu-central-1")),
            "eu-central-1"
        );
        assert_eq!(parse_region_name("localhost", "sqs", None), "us-east-1");
    }

    struct TaggingSigner {
        tag: String,
    }

    impl Signer for TaggingSigner {
        fn sign(&self, request: &mut Request, _credentials: &Credentials) -> InvokeResult<()> {
            request.add_header("x-signed-by", &self.tag)
        }
    }

    #[test]
    fn registry_resolves_registered_signer_types() {
        let registry = SignerRegistry::new();
        registry.register_signer(AWS4_SIGNER_TYPE, |service, region| {
            Arc::new(TaggingSigner {
                tag: format!("{service}/{region}"),
            }) as Arc<dyn Signer>
        });

        let signer = registry
            .signer("monitoring", "us-west-2")
            .expect("registered signer");
        let mut request = Request::new("AmazonCloudWatch", Method::GET);
        signer
            .sign(&mut request, &Credentials::new("id", "secret"))
            .expect("signing should succeed");
        assert_eq!(
            request.headers().get("x-signed-by").map(|v| v.as_bytes()),
            Some(&b"monitoring/us-west-2"[..])
        );
    }

    #[test]
    fn registry_routes_services_to_specific_signer_types() {
        let registry = SignerRegistry::new();
        registry.set_service_signer_type("sqs", NO_OP_SIGNER_TYPE);
        assert!(registry.signer("sqs", "us-east-1").is_ok());
        let error = match registry.signer("ec2", "us-east-1") {
            Ok(_) => panic!("AWS4SignerType is not registered"),
            Err(error) => error,
        };
        assert!(error.is_configuration());
    }
}
