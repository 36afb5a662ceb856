//! HTTP connection persistence across protocol versions.
//!
//! The decoder is the single authority on whether the peer asked for
//! keep-alive: its verdict travels as a [`PeerKeepalive`] request
//! extension because the hop-by-hop headers it was derived from are
//! stripped during header conversion. This handler combines that verdict
//! with the inner chain's continue flag, presents legacy HTTP/1.0
//! requests to the chain as 1.1, and stamps the outgoing `Connection`
//! header to match the final decision. A 101 response is passed through
//! untouched: its `Connection: upgrade` header is load-bearing.

use http::{Request, StatusCode, Version};
use lagoon_core::{
    http::{body::HttpBody, HttpHandler, ResponseWithContinue},
    routing::RoutingContext,
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Service,
};
use tracing::debug;

use crate::http::{CLOSE_VALUE, KEEPALIVE_VALUE};

/// The decoder's keep-alive verdict for one request.
#[derive(Debug, Clone, Copy)]
pub struct PeerKeepalive(pub bool);

#[derive(Clone)]
pub struct ConnectionReuseHandler<H> {
    inner: H,
}

impl<H> ConnectionReuseHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H, CX> Service<(Request<HttpBody>, RoutingContext, CX)> for ConnectionReuseHandler<H>
where
    H: HttpHandler<CX, HttpBody, Body = HttpBody>,
{
    type Response = ResponseWithContinue<HttpBody>;
    type Error = H::Error;

    async fn call(
        &self,
        (mut request, routing, ctx): (Request<HttpBody>, RoutingContext, CX),
    ) -> Result<Self::Response, Self::Error> {
        let version = request.version();
        let peer_keepalive = request
            .extensions()
            .get::<PeerKeepalive>()
            .map(|k| k.0)
            // Without a decoder verdict, fall back to what the version
            // implies: persistent for 1.1 and 2, one-shot otherwise.
            .unwrap_or(matches!(version, Version::HTTP_11 | Version::HTTP_2));
        debug!("frontend keepalive {:?}", peer_keepalive);

        // The chain only ever sees 1.1 semantics for legacy requests.
        let downgrade = version == Version::HTTP_10;
        if downgrade {
            *request.version_mut() = Version::HTTP_11;
        }

        let (mut response, inner_cont) = self.inner.handle(request, routing, ctx).await?;

        let cont = match version {
            // HTTP/2 persistence is stream-level; the connection stays.
            Version::HTTP_2 => true,
            Version::HTTP_10 | Version::HTTP_11 => inner_cont && peer_keepalive,
            // HTTP/0.9 and friends get one exchange.
            _ => false,
        };
        if downgrade {
            *response.version_mut() = Version::HTTP_10;
        }
        annotate_persistence(&mut response, version, cont);
        Ok((response, cont))
    }
}

/// Make the response's `Connection` header agree with the verdict.
/// HTTP/1.0 must opt in to reuse explicitly; HTTP/1.1 must opt out.
fn annotate_persistence(response: &mut http::Response<HttpBody>, version: Version, cont: bool) {
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return;
    }
    response.headers_mut().remove(http::header::CONNECTION);
    match (version, cont) {
        (Version::HTTP_10, true) => {
            response
                .headers_mut()
                .insert(http::header::CONNECTION, KEEPALIVE_VALUE);
        }
        (Version::HTTP_11, false) => {
            response
                .headers_mut()
                .insert(http::header::CONNECTION, CLOSE_VALUE);
        }
        _ => {}
    }
}

impl<F: MakeService> MakeService for ConnectionReuseHandler<F> {
    type Service = ConnectionReuseHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionReuseHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for ConnectionReuseHandler<F> {
    type Service = ConnectionReuseHandler<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionReuseHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

impl<F> ConnectionReuseHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| Self { inner })
    }
}
