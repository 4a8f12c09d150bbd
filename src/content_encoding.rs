use std::io::Read;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};

#[derive(Debug)]
pub(crate) enum DecodeContentEncodingError {
    Decode { encoding: String, message: String },
    TooLarge { actual_bytes: usize },
}

impl DecodeContentEncodingError {
    fn decode(encoding: &str, message: impl ToString) -> Self {
        Self::Decode {
            encoding: encoding.to_owned(),
            message: message.to_string(),
        }
    }
}

/// Responses that carry no entity body are passed through untouched.
pub(crate) fn should_decode(method: &Method, status: StatusCode, body_len: usize) -> bool {
    body_len > 0
        && *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// `None` for `identity`; an error for anything besides gzip and deflate.
fn decoder<'a>(
    encoding: &str,
    body: &'a [u8],
) -> Result<Option<Box<dyn Read + 'a>>, DecodeContentEncodingError> {
    match encoding {
        "identity" => Ok(None),
        "gzip" | "x-gzip" => Ok(Some(Box::new(GzDecoder::new(body)))),
        "deflate" => Ok(Some(Box::new(ZlibDecoder::new(body)))),
        other => Err(DecodeContentEncodingError::decode(
            other,
            "unsupported content-encoding",
        )),
    }
}

/// Undoes `Content-Encoding` layers, last applied first, never producing
/// more than `max_bytes`. On success the encoding and length headers no
/// longer describe the body and are removed.
pub(crate) fn decode_body_limited(
    body: Bytes,
    headers: &mut HeaderMap,
    max_bytes: usize,
) -> Result<Bytes, DecodeContentEncodingError> {
    let Some(header) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };
    let header = header
        .to_str()
        .map_err(|error| DecodeContentEncodingError::decode("content-encoding", error))?;
    let layers: Vec<String> = header
        .split(',')
        .map(|layer| layer.trim().to_ascii_lowercase())
        .filter(|layer| !layer.is_empty())
        .collect();

    let max_bytes = max_bytes.max(1);
    let mut current = body;
    for layer in layers.iter().rev() {
        let Some(reader) = decoder(layer, &current)? else {
            continue;
        };
        let mut decoded = Vec::new();
        reader
            .take(max_bytes as u64 + 1)
            .read_to_end(&mut decoded)
            .map_err(|error| DecodeContentEncodingError::decode(layer, error))?;
        if decoded.len() > max_bytes {
            return Err(DecodeContentEncodingError::TooLarge {
                actual_bytes: decoded.len(),
            });
        }
        current = Bytes::from(decoded);
    }
    if current.len() > max_bytes {
        return Err(DecodeContentEncodingError::TooLarge {
            actual_bytes: current.len(),
        });
    }

    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    Ok(current)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::HeaderValue;

    use super::*;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("gzip write");
        Bytes::from(encoder.finish().expect("gzip finish"))
    }

    #[test]
    fn gzip_body_is_decoded_and_headers_cleared() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("99"));
        let decoded = decode_body_limited(gzip(b"{\"ok\":true}"), &mut headers, 1024)
            .expect("gzip should decode");
        assert_eq!(decoded.as_ref(), b"{\"ok\":true}");
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn decoded_body_respects_limit() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let error = decode_body_limited(gzip(&[b'a'; 4096]), &mut headers, 128)
            .expect_err("limit should apply");
        assert!(matches!(error, DecodeContentEncodingError::TooLarge { .. }));
    }

    #[test]
    fn unsupported_encoding_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        let error = decode_body_limited(Bytes::from_static(b"xx"), &mut headers, 128)
            .expect_err("br is not supported");
        assert!(matches!(
            error,
            DecodeContentEncodingError::Decode { ref encoding, .. } if encoding == "br"
        ));
    }

    #[test]
    fn head_and_empty_responses_are_not_decoded() {
        assert!(!should_decode(&Method::HEAD, StatusCode::OK, 10));
        assert!(!should_decode(&Method::GET, StatusCode::NO_CONTENT, 10));
        assert!(!should_decode(&Method::GET, StatusCode::OK, 0));
        assert!(should_decode(&Method::GET, StatusCode::OK, 10));
    }
}
