//! HTTP abstractions shared by the decoders and the dispatch layer.
//!
//! The connection services decode wire bytes into `http::Request<HttpBody>`
//! values plus a [`RoutingContext`](crate::routing::RoutingContext), and hand
//! both to an [`HttpHandler`] chain. Handlers reply with a response and a
//! keep-alive verdict ([`ResponseWithContinue`]).

pub mod body;
pub mod service;

use std::{borrow::Cow, future::Future};

use http::{Request, Response, StatusCode};

use crate::routing::RoutingContext;

/// (is_http2, io, connection context) accepted by the core HTTP service.
pub type HttpAccept<Stream, CX> = (bool, Stream, CX);

/// Response plus whether the connection may serve another request.
pub type ResponseWithContinue<B> = (Response<B>, bool);

/// Request handler used to build the per-connection processing chain.
///
/// `CX` is the connection context (a `certain_map` context in practice),
/// `B` the request body type. Implemented automatically for any
/// `service_async::Service` over the matching tuple.
pub trait HttpHandler<CX, B> {
    type Body;
    type Error;

    fn handle(
        &self,
        request: Request<B>,
        routing: RoutingContext,
        ctx: CX,
    ) -> impl Future<Output = Result<ResponseWithContinue<Self::Body>, Self::Error>>;
}

impl<T, CX, B, B2, E> HttpHandler<CX, B> for T
where
    T: service_async::Service<
        (Request<B>, RoutingContext, CX),
        Response = ResponseWithContinue<B2>,
        Error = E,
    >,
{
    type Body = B2;
    type Error = E;

    fn handle(
        &self,
        request: Request<B>,
        routing: RoutingContext,
        ctx: CX,
    ) -> impl Future<Output = Result<ResponseWithContinue<Self::Body>, Self::Error>> {
        self.call((request, routing, ctx))
    }
}

/// Errors that know how to render themselves as an HTTP response.
///
/// Returning `None` marks the error as fatal to the connection: no response
/// can be written and the transport must be closed.
pub trait HttpError<B> {
    fn to_response(&self) -> Option<Response<B>>;
}

/// Marker wrapper for errors that must tear the connection down.
#[derive(thiserror::Error, Debug)]
#[error("fatal error: {0:?}")]
pub struct HttpFatalError<E: std::fmt::Debug>(pub E);

impl<B, E: std::fmt::Debug> HttpError<B> for HttpFatalError<E> {
    fn to_response(&self) -> Option<Response<B>> {
        None
    }
}

/// The single "abort with status" primitive.
///
/// Produced wherever processing must stop with a concrete HTTP status:
/// routing deferrals (405/406/415), policy rejections (413/414/417/431) and
/// user services that bail out early. Also the payload of the deferred
/// status slot on [`RoutingContext`].
#[derive(thiserror::Error, Debug, Clone)]
#[error("{status}: {message}")]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub message: Cow<'static, str>,
}

impl HttpStatusError {
    pub fn new(status: StatusCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Status-only error; the message falls back to the canonical reason.
    pub fn of(status: StatusCode) -> Self {
        Self {
            status,
            message: Cow::Borrowed(status.canonical_reason().unwrap_or("")),
        }
    }
}

impl HttpError<body::HttpBody> for HttpStatusError {
    fn to_response(&self) -> Option<Response<body::HttpBody>> {
        let mut resp = Response::new(body::HttpBody::full(bytes::Bytes::copy_from_slice(
            self.message.as_bytes(),
        )));
        *resp.status_mut() = self.status;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Some(resp)
    }
}
