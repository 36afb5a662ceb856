//! Accept-time context assembly.
//!
//! The accept path hands the connection stack an [`Accepted`] triple: the
//! raw io, the peer address, and the TLS server name when the listener
//! terminated TLS with SNI. [`ContextService`] turns that into the typed
//! `certain_map` context the rest of the stack demands: `PeerAddr` feeds
//! connection logging, `ServerName` takes precedence over the `Host`
//! header for virtual-host selection in the drive loops.

use std::net::SocketAddr;

use lagoon_core::context::keys::{PeerAddr, ServerName};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, ParamSet, Service,
};

/// What the accept path produces for each connection.
pub type Accepted<S> = (S, SocketAddr, Option<ServerName>);

#[derive(Debug, Clone, Copy)]
pub struct ContextService<CX, T> {
    pub inner: T,
    pub ctx: CX,
}

impl<R, T, CX> Service<Accepted<R>> for ContextService<CX, T>
where
    CX: ParamSet<PeerAddr> + Clone,
    CX::Transformed: ParamSet<Option<ServerName>>,
    T: Service<(
        R,
        <CX::Transformed as ParamSet<Option<ServerName>>>::Transformed,
    )>,
{
    type Response = T::Response;
    type Error = T::Error;

    async fn call(
        &self,
        (req, addr, server_name): Accepted<R>,
    ) -> Result<Self::Response, Self::Error> {
        let ctx = self
            .ctx
            .clone()
            .param_set(PeerAddr(addr))
            .param_set(server_name);
        self.inner.call((req, ctx)).await
    }
}

impl<CX, F> ContextService<CX, F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        CX: Default,
    {
        layer_fn(|_: &C, inner| ContextService {
            inner,
            ctx: Default::default(),
        })
    }
}

impl<CX: Clone, F: MakeService> MakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            ctx: self.ctx.clone(),
            inner: self
                .inner
                .make_via_ref(old.map(|o| &o.inner))
                .map_err(Into::into)?,
        })
    }
}

impl<CX: Clone, F: AsyncMakeService> AsyncMakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            ctx: self.ctx.clone(),
            inner: self
                .inner
                .make_via_ref(old.map(|o| &o.inner))
                .await
                .map_err(Into::into)?,
        })
    }
}
