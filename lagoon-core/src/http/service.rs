//! Service traits for routed HTTP services.
//!
//! A user service implements [`HttpService`]; virtual-host construction
//! erases it behind [`BoxHttpService`] so heterogeneous services can share a
//! router. Erasure boxes futures locally (services run on one worker and
//! need not be `Send`).

use std::{fmt, future::Future, rc::Rc, time::Duration};

use futures::future::LocalBoxFuture;
use http::{Request, Response};

use crate::{
    config::{DEFAULT_MAX_REQUEST_LENGTH, DEFAULT_REQUEST_TIMEOUT_SECS},
    routing::{PathPattern, Route, RoutingResult},
    AnyError,
};

use super::body::HttpBody;

/// Per-binding policy knobs carried by a service config.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub request_timeout: Duration,
    pub max_request_length: usize,
    pub verbose_responses: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_request_length: DEFAULT_MAX_REQUEST_LENGTH,
            verbose_responses: false,
        }
    }
}

/// What a service sees for one matched request.
pub struct ServiceContext<'a> {
    pub routing: &'a RoutingResult,
    pub options: &'a ServiceOptions,
}

impl ServiceContext<'_> {
    /// Decoded path parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.routing.path_params.get(name).map(String::as_str)
    }
}

/// Passed to [`HttpService::service_added`] when the service is bound.
pub struct ServiceBinding<'a> {
    pub route: &'a Route,
    pub options: &'a ServiceOptions,
}

/// A routed HTTP service.
pub trait HttpService {
    fn serve(
        &self,
        cx: ServiceContext<'_>,
        req: Request<HttpBody>,
    ) -> impl Future<Output = Result<Response<HttpBody>, AnyError>>;

    /// Called exactly once when the service is bound into a virtual host.
    fn service_added(&mut self, _binding: &ServiceBinding<'_>) {}

    /// Whether a lookup for `path` may be stored in the routing cache.
    /// The default caches only exact mappings with no query string.
    fn should_cache_path(&self, _path: &str, query: Option<&str>, route: &Route) -> bool {
        query.is_none() && matches!(route.pattern(), PathPattern::Exact(_))
    }

    /// Opt-in for WebSocket upgrades; validated at decode time.
    fn supports_websocket(&self) -> bool {
        false
    }

    /// Opt-in for serving CORS preflight requests.
    fn handles_cors_preflight(&self) -> bool {
        false
    }
}

trait ErasedHttpService {
    fn serve<'a>(
        &'a self,
        cx: ServiceContext<'a>,
        req: Request<HttpBody>,
    ) -> LocalBoxFuture<'a, Result<Response<HttpBody>, AnyError>>;
    fn should_cache_path(&self, path: &str, query: Option<&str>, route: &Route) -> bool;
    fn supports_websocket(&self) -> bool;
    fn handles_cors_preflight(&self) -> bool;
}

impl<S: HttpService> ErasedHttpService for S {
    fn serve<'a>(
        &'a self,
        cx: ServiceContext<'a>,
        req: Request<HttpBody>,
    ) -> LocalBoxFuture<'a, Result<Response<HttpBody>, AnyError>> {
        Box::pin(HttpService::serve(self, cx, req))
    }

    fn should_cache_path(&self, path: &str, query: Option<&str>, route: &Route) -> bool {
        HttpService::should_cache_path(self, path, query, route)
    }

    fn supports_websocket(&self) -> bool {
        HttpService::supports_websocket(self)
    }

    fn handles_cors_preflight(&self) -> bool {
        HttpService::handles_cors_preflight(self)
    }
}

/// Reference-counted, type-erased [`HttpService`].
#[derive(Clone)]
pub struct BoxHttpService {
    inner: Rc<dyn ErasedHttpService>,
}

impl BoxHttpService {
    pub fn new<S: HttpService + 'static>(service: S) -> Self {
        Self {
            inner: Rc::new(service),
        }
    }

    pub async fn serve(
        &self,
        cx: ServiceContext<'_>,
        req: Request<HttpBody>,
    ) -> Result<Response<HttpBody>, AnyError> {
        self.inner.serve(cx, req).await
    }

    pub fn should_cache_path(&self, path: &str, query: Option<&str>, route: &Route) -> bool {
        self.inner.should_cache_path(path, query, route)
    }

    pub fn supports_websocket(&self) -> bool {
        self.inner.supports_websocket()
    }

    pub fn handles_cors_preflight(&self) -> bool {
        self.inner.handles_cors_preflight()
    }
}

impl fmt::Debug for BoxHttpService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxHttpService")
    }
}

/// Wrap a plain function as a service; handy for tests and fallbacks.
pub fn service_fn<F>(f: F) -> ServiceFn<F>
where
    F: Fn(ServiceContext<'_>, Request<HttpBody>) -> Response<HttpBody>,
{
    ServiceFn(f)
}

pub struct ServiceFn<F>(F);

impl<F> HttpService for ServiceFn<F>
where
    F: Fn(ServiceContext<'_>, Request<HttpBody>) -> Response<HttpBody>,
{
    async fn serve(
        &self,
        cx: ServiceContext<'_>,
        req: Request<HttpBody>,
    ) -> Result<Response<HttpBody>, AnyError> {
        Ok((self.0)(cx, req))
    }
}
