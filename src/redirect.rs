use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::config::Protocol;

pub(crate) const MAX_REDIRECTS: usize = 10;

/// Where a redirect response sends the next request, and what must not
/// follow it there.
#[derive(Debug)]
pub(crate) struct RedirectHop {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) body_dropped: bool,
    pub(crate) cross_origin: bool,
}

impl RedirectHop {
    /// Strips body headers when the body is dropped and credentials when the
    /// hop leaves the origin.
    pub(crate) fn scrub(&self, headers: &mut HeaderMap) {
        if self.body_dropped {
            for name in [CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING] {
                headers.remove(name);
            }
        }
        if self.cross_origin {
            headers.remove(AUTHORIZATION);
            headers.remove(COOKIE);
        }
    }
}

/// Decides whether a response redirects, and to where.
///
/// `None` leaves the response as the final answer: not a redirect status, no
/// usable `Location`, or a body that would have to be sent again but cannot.
pub(crate) fn next_hop(
    method: &Method,
    current: &Uri,
    status: StatusCode,
    headers: &HeaderMap,
    body_replayable: bool,
) -> Option<RedirectHop> {
    let rewrite_to_get = match status {
        StatusCode::SEE_OTHER => *method != Method::GET && *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => *method == Method::POST,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => false,
        _ => return None,
    };
    if !rewrite_to_get && !body_replayable {
        return None;
    }

    let location = headers.get(LOCATION)?.to_str().ok()?;
    let target = url::Url::parse(&current.to_string())
        .ok()?
        .join(location)
        .ok()?;
    let uri: Uri = target.as_str().parse().ok()?;
    Some(RedirectHop {
        method: if rewrite_to_get {
            Method::GET
        } else {
            method.clone()
        },
        cross_origin: !same_origin(current, &uri),
        uri,
        body_dropped: rewrite_to_get,
    })
}

fn origin(uri: &Uri) -> Option<(Protocol, String, u16)> {
    let protocol: Protocol = uri.scheme_str()?.parse().ok()?;
    let host = uri.host()?.to_ascii_lowercase();
    let port = uri.port_u16().unwrap_or(protocol.default_port());
    Some((protocol, host, port))
}

fn same_origin(left: &Uri, right: &Uri) -> bool {
    match (origin(left), origin(right)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}
