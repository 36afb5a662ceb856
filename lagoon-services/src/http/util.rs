//! Small response helpers shared by the HTTP services.

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use lagoon_core::http::body::HttpBody;

use super::CLOSE_VALUE;

/// A plain response for `status` with the canonical reason as its body.
/// With `close` set the response also asks the peer to drop the
/// connection.
pub(crate) fn generate_response(status: StatusCode, close: bool) -> Response<HttpBody> {
    let reason = status.canonical_reason().unwrap_or("");
    let mut resp = Response::new(HttpBody::full(Bytes::from_static(reason.as_bytes())));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if close {
        headers.insert(header::CONNECTION, CLOSE_VALUE);
    }
    resp
}

/// Truncate an error rendering for a verbose 5xx body.
pub(crate) fn truncate_error(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated)", &text[..cut])
}
