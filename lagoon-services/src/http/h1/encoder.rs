//! HTTP/1.1 response serialization.
//!
//! The encoder owns the write half of the connection and the
//! response-correlation counters: it refuses to write more responses than
//! requests were decoded, suppresses bodies for HEAD and bodiless
//! statuses, strips `Transfer-Encoding` from CONNECT 2xx, and frames
//! streamed bodies as chunked (HTTP/1.1) or raw-until-close (HTTP/1.0).
//! A 101 response switches the encoder to raw passthrough for tunnels.

use std::{io, time::SystemTime};

use bytes::{Bytes, BytesMut};
use http::{header, Method, Response, StatusCode, Version};
use lagoon_core::http::body::{HttpBody, StreamHint};
use monoio::io::{AsyncWriteRent, AsyncWriteRentExt};

/// Per-response context the drive loop hands the encoder.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub request_method: Method,
    pub version: Version,
    pub close: bool,
}

/// How the response body goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyPlan {
    /// No body bytes and no framing headers (1xx, 204, 304, CONNECT 2xx).
    None,
    /// `Content-Length` framing; for HEAD the length is declared but the
    /// bytes are suppressed.
    Sized { length: usize, suppress: bool },
    Chunked,
    /// Unframed bytes until the connection closes (HTTP/1.0 streaming,
    /// tunnels after 101).
    Raw,
}

fn plan_body(meta: &ResponseMeta, status: StatusCode, body: &HttpBody) -> BodyPlan {
    if status == StatusCode::SWITCHING_PROTOCOLS {
        return BodyPlan::Raw;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return BodyPlan::None;
    }
    if meta.request_method == Method::CONNECT && status.is_success() {
        return BodyPlan::None;
    }
    let suppress = meta.request_method == Method::HEAD;
    match body.stream_hint() {
        StreamHint::None => BodyPlan::Sized {
            length: 0,
            suppress,
        },
        StreamHint::Fixed => BodyPlan::Sized {
            length: body.content_length().unwrap_or(0),
            suppress,
        },
        StreamHint::Stream => {
            if suppress {
                // HEAD never carries the stream; declare nothing.
                BodyPlan::Sized {
                    length: 0,
                    suppress: true,
                }
            } else if meta.version == Version::HTTP_10 {
                BodyPlan::Raw
            } else {
                BodyPlan::Chunked
            }
        }
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn encode_head(dst: &mut BytesMut, status: StatusCode, meta: &ResponseMeta, resp: &Response<HttpBody>, plan: BodyPlan) {
    dst.extend_from_slice(version_str(meta.version).as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.extend_from_slice(b"\r\n");

    for (name, value) in resp.headers() {
        // Framing is computed here, never trusted from the handler.
        if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if !resp.headers().contains_key(header::DATE) && !status.is_informational() {
        dst.extend_from_slice(b"date: ");
        dst.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    if meta.close
        && !resp.headers().contains_key(header::CONNECTION)
        && status != StatusCode::SWITCHING_PROTOCOLS
    {
        dst.extend_from_slice(b"connection: close\r\n");
    }

    match plan {
        BodyPlan::None | BodyPlan::Raw => {}
        BodyPlan::Sized { length, .. } => {
            dst.extend_from_slice(b"content-length: ");
            dst.extend_from_slice(length.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        BodyPlan::Chunked => {
            dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
    }
    dst.extend_from_slice(b"\r\n");
}

pub struct ResponseEncoder<W> {
    io: W,
    requests_seen: usize,
    responses_sent: usize,
    tunneling: bool,
}

impl<W: AsyncWriteRent> ResponseEncoder<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            requests_seen: 0,
            responses_sent: 0,
            tunneling: false,
        }
    }

    /// Account one decoded request; responses may never outnumber these.
    pub fn on_request(&mut self) {
        self.requests_seen += 1;
    }

    pub fn responses_sent(&self) -> usize {
        self.responses_sent
    }

    pub fn is_tunneling(&self) -> bool {
        self.tunneling
    }

    async fn write_all(&mut self, buf: BytesMut) -> io::Result<()> {
        let (res, _) = self.io.write_all(buf).await;
        res?;
        Ok(())
    }

    /// A bare informational response (e.g. `100 Continue`); does not count
    /// against response correlation.
    pub async fn send_informational(&mut self, status: StatusCode) -> io::Result<()> {
        debug_assert!(status.is_informational());
        let mut head = BytesMut::with_capacity(48);
        head.extend_from_slice(b"HTTP/1.1 ");
        head.extend_from_slice(status.as_str().as_bytes());
        head.extend_from_slice(b" ");
        head.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
        head.extend_from_slice(b"\r\n\r\n");
        self.write_all(head).await?;
        self.io.flush().await
    }

    /// Serialize one response, driving a streamed body to completion.
    ///
    /// A 101 returns its body to the caller: those bytes belong to the
    /// tunnel and are relayed unframed by the drive loop.
    pub async fn send_response(
        &mut self,
        resp: Response<HttpBody>,
        meta: ResponseMeta,
    ) -> io::Result<Option<HttpBody>> {
        if self.responses_sent >= self.requests_seen {
            // One response per request; a second one means internal state
            // desynced and the connection cannot be trusted.
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response without a pending request",
            ));
        }
        let status = resp.status();
        let plan = plan_body(&meta, status, resp.body());

        let mut head = BytesMut::with_capacity(256);
        encode_head(&mut head, status, &meta, &resp, plan);
        self.write_all(head).await?;

        let mut body = resp.into_body();
        let mut tunnel_body = None;
        match plan {
            BodyPlan::None => {}
            BodyPlan::Sized { suppress, .. } => {
                if !suppress {
                    while let Some(chunk) = body.next_data().await {
                        let chunk = chunk
                            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                        let (res, _) = self.io.write_all(chunk).await;
                        res?;
                    }
                }
            }
            BodyPlan::Chunked => {
                while let Some(chunk) = body.next_data().await {
                    let chunk =
                        chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                    if chunk.is_empty() {
                        continue;
                    }
                    let mut framed = BytesMut::with_capacity(chunk.len() + 16);
                    framed.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                    framed.extend_from_slice(&chunk);
                    framed.extend_from_slice(b"\r\n");
                    self.write_all(framed).await?;
                }
                let mut tail = BytesMut::with_capacity(64);
                tail.extend_from_slice(b"0\r\n");
                if let Some(trailers) = body.take_trailers() {
                    for (name, value) in trailers.iter() {
                        tail.extend_from_slice(name.as_str().as_bytes());
                        tail.extend_from_slice(b": ");
                        tail.extend_from_slice(value.as_bytes());
                        tail.extend_from_slice(b"\r\n");
                    }
                }
                tail.extend_from_slice(b"\r\n");
                self.write_all(tail).await?;
            }
            BodyPlan::Raw => {
                if status == StatusCode::SWITCHING_PROTOCOLS {
                    self.tunneling = true;
                    tunnel_body = Some(body);
                } else {
                    while let Some(chunk) = body.next_data().await {
                        let chunk =
                            chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                        let (res, _) = self.io.write_all(chunk).await;
                        res?;
                    }
                }
            }
        }
        self.responses_sent += 1;
        self.io.flush().await?;
        Ok(tunnel_body)
    }

    /// Unframed bytes for an established tunnel.
    pub async fn send_raw(&mut self, data: Bytes) -> io::Result<()> {
        let (res, _) = self.io.write_all(data).await;
        res?;
        self.io.flush().await
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn meta(method: Method, version: Version, close: bool) -> ResponseMeta {
        ResponseMeta {
            request_method: method,
            version,
            close,
        }
    }

    #[test]
    fn test_head_suppresses_body_but_keeps_length() {
        let body = HttpBody::from("hello");
        let plan = plan_body(&meta(Method::HEAD, Version::HTTP_11, false), StatusCode::OK, &body);
        assert_eq!(
            plan,
            BodyPlan::Sized {
                length: 5,
                suppress: true
            }
        );
    }

    #[test]
    fn test_bodiless_statuses() {
        let body = HttpBody::from("x");
        for status in [
            StatusCode::NO_CONTENT,
            StatusCode::NOT_MODIFIED,
            StatusCode::CONTINUE,
        ] {
            assert_eq!(
                plan_body(&meta(Method::GET, Version::HTTP_11, false), status, &body),
                BodyPlan::None
            );
        }
    }

    #[test]
    fn test_connect_2xx_has_no_framing() {
        let body = HttpBody::empty();
        assert_eq!(
            plan_body(
                &meta(Method::CONNECT, Version::HTTP_11, false),
                StatusCode::OK,
                &body
            ),
            BodyPlan::None
        );
    }

    #[test]
    fn test_streamed_body_framing_by_version() {
        let (_tx, rx) = lagoon_core::http::body::body_channel(
            lagoon_core::http::body::StreamMeta { id: 1, stream_id: 1 },
            1024,
        );
        let body = HttpBody::streamed(rx);
        assert_eq!(
            plan_body(&meta(Method::GET, Version::HTTP_11, false), StatusCode::OK, &body),
            BodyPlan::Chunked
        );
        assert_eq!(
            plan_body(&meta(Method::GET, Version::HTTP_10, false), StatusCode::OK, &body),
            BodyPlan::Raw
        );
    }

    #[test]
    fn test_encode_head_framing_and_close() {
        let resp = Response::new(HttpBody::from("hello"));
        let mut dst = BytesMut::new();
        encode_head(
            &mut dst,
            StatusCode::OK,
            &meta(Method::GET, Version::HTTP_11, true),
            &resp,
            BodyPlan::Sized {
                length: 5,
                suppress: false,
            },
        );
        let text = String::from_utf8(dst.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.contains("date: "));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_head_overrides_handler_framing() {
        let mut resp = Response::new(HttpBody::empty());
        resp.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        resp.headers_mut().insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        let mut dst = BytesMut::new();
        encode_head(
            &mut dst,
            StatusCode::OK,
            &meta(Method::GET, Version::HTTP_11, false),
            &resp,
            BodyPlan::Sized {
                length: 0,
                suppress: false,
            },
        );
        let text = String::from_utf8(dst.to_vec()).unwrap();
        assert!(text.contains("content-length: 0\r\n"));
        assert!(!text.contains("999"));
        assert!(!text.contains("transfer-encoding"));
    }

}
