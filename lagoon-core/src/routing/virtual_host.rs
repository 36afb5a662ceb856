//! Virtual hosts: hostname-scoped routing tables and service configs.
//!
//! A server owns a set of virtual hosts selected per request by hostname
//! (TLS SNI or the `Host` header), with `*.suffix` wildcards resolved by
//! longest suffix and a default host as the final catch-all. Each host
//! owns its service configs, a cached router over them, and a fallback
//! config that surfaces deferred 4xx statuses (or 404) when nothing
//! matched.

use std::rc::Rc;

use http::{Method, StatusCode};
use tracing::debug;

use crate::{
    http::{
        body::HttpBody,
        service::{BoxHttpService, HttpService, ServiceBinding, ServiceContext, ServiceOptions},
        HttpStatusError,
    },
    AnyResult,
};

use super::{
    cache::{CachedRouter, DEFAULT_CACHE_CAPACITY},
    context::RoutingContext,
    result::RoutingResult,
    route::Route,
    router::{Routed, Router},
};

/// One service bound to one route inside exactly one virtual host.
pub struct ServiceConfig {
    pub route: Route,
    pub service: BoxHttpService,
    pub options: ServiceOptions,
}

/// Hostname pattern: exact, `*.suffix` wildcard, or the match-all default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostnamePattern {
    Any,
    Exact(String),
    Wildcard(String),
}

impl HostnamePattern {
    pub fn parse(pattern: &str) -> Self {
        let lower = pattern.to_ascii_lowercase();
        if lower == "*" {
            HostnamePattern::Any
        } else if let Some(suffix) = lower.strip_prefix('*') {
            HostnamePattern::Wildcard(suffix.to_string())
        } else {
            HostnamePattern::Exact(lower)
        }
    }

    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            HostnamePattern::Any => true,
            HostnamePattern::Exact(h) => hostname.eq_ignore_ascii_case(h),
            HostnamePattern::Wildcard(suffix) => {
                hostname.len() > suffix.len()
                    && hostname.to_ascii_lowercase().ends_with(suffix.as_str())
            }
        }
    }

    /// Longer suffixes are more specific; exact matches beat wildcards.
    fn specificity(&self) -> usize {
        match self {
            HostnamePattern::Any => 0,
            HostnamePattern::Wildcard(suffix) => suffix.len() + 1,
            HostnamePattern::Exact(h) => h.len() + 1024,
        }
    }
}

/// A hostname-scoped container of routes and policy.
pub struct VirtualHost {
    pattern: HostnamePattern,
    router: CachedRouter<ServiceConfig>,
    fallback: ServiceConfig,
    defaults: ServiceOptions,
}

impl VirtualHost {
    pub fn builder(pattern: &str) -> VirtualHostBuilder {
        VirtualHostBuilder::new(pattern)
    }

    pub fn pattern(&self) -> &HostnamePattern {
        &self.pattern
    }

    pub fn defaults(&self) -> &ServiceOptions {
        &self.defaults
    }

    pub fn router(&self) -> &CachedRouter<ServiceConfig> {
        &self.router
    }

    pub fn fallback_config(&self) -> &ServiceConfig {
        &self.fallback
    }

    /// Resolve a service config for the context.
    ///
    /// On a plain miss a HEAD request is retried as GET (HEAD responses
    /// reuse GET routes with the body suppressed by the encoder). A CORS
    /// preflight only matches configs whose service advertises preflight
    /// handling. With `use_fallback` the fallback config is returned
    /// instead of `None`, carrying a synthetic routing result; the
    /// fallback service surfaces the context's deferred status.
    pub fn find_service_config(
        &self,
        ctx: &RoutingContext,
        use_fallback: bool,
    ) -> Option<Routed<'_, ServiceConfig>> {
        if ctx.is_cors_preflight() {
            if let Some(routed) = self.router.find(ctx) {
                if routed.value.service.handles_cors_preflight() {
                    return Some(routed);
                }
            }
        } else {
            if let Some(routed) = self.router.find(ctx) {
                return Some(routed);
            }
            if ctx.method() == Method::HEAD {
                let get_ctx = ctx.with_method(Method::GET);
                if let Some(routed) = self.router.find(&get_ctx) {
                    debug!(path = ctx.path(), "HEAD routed through GET mapping");
                    return Some(routed);
                }
                ctx.absorb_deferred(&get_ctx);
            }
        }

        if use_fallback {
            Some(Routed {
                index: usize::MAX,
                route: &self.fallback.route,
                value: &self.fallback,
                result: RoutingResult::fallback(ctx.path(), ctx.query().map(str::to_string)),
                fallback: true,
            })
        } else {
            None
        }
    }
}

/// Builds a [`VirtualHost`], calling each service's `service_added` hook
/// exactly once at bind time.
pub struct VirtualHostBuilder {
    pattern: HostnamePattern,
    defaults: ServiceOptions,
    cache_capacity: u64,
    bindings: Vec<ServiceConfig>,
    fallback: Option<ServiceConfig>,
}

impl VirtualHostBuilder {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: HostnamePattern::parse(pattern),
            defaults: ServiceOptions::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            bindings: Vec::new(),
            fallback: None,
        }
    }

    pub fn defaults(mut self, options: ServiceOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn route_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Bind a service under a route with the host's default options.
    pub fn service<S: HttpService + 'static>(self, route: Route, service: S) -> Self {
        let options = self.defaults.clone();
        self.service_with_options(route, service, options)
    }

    pub fn service_with_options<S: HttpService + 'static>(
        mut self,
        route: Route,
        mut service: S,
        options: ServiceOptions,
    ) -> Self {
        service.service_added(&ServiceBinding {
            route: &route,
            options: &options,
        });
        self.bindings.push(ServiceConfig {
            route,
            service: BoxHttpService::new(service),
            options,
        });
        self
    }

    /// Replace the synthetic fallback with a user-supplied service.
    pub fn fallback_service<S: HttpService + 'static>(mut self, mut service: S) -> Self {
        let route = fallback_route();
        let options = self.defaults.clone();
        service.service_added(&ServiceBinding {
            route: &route,
            options: &options,
        });
        self.fallback = Some(ServiceConfig {
            route,
            service: BoxHttpService::new(service),
            options,
        });
        self
    }

    pub fn build(self) -> AnyResult<VirtualHost> {
        let defaults = self.defaults;
        let fallback = match self.fallback {
            Some(fallback) => fallback,
            None => default_fallback_config(&defaults),
        };
        let routes = self
            .bindings
            .into_iter()
            .map(|cfg| (cfg.route.clone(), cfg))
            .collect();
        let router = CachedRouter::new(Router::build(routes)?, self.cache_capacity)
            .with_write_filter(|ctx, entry| {
                entry
                    .value
                    .service
                    .should_cache_path(ctx.path(), ctx.query(), &entry.route)
            });
        Ok(VirtualHost {
            pattern: self.pattern,
            router,
            fallback,
            defaults,
        })
    }
}

fn fallback_route() -> Route {
    Route::builder()
        .path("prefix:/")
        .any_method()
        .build()
        .expect("fallback route is statically valid")
}

/// The synthetic fallback: serves the context's deferred status when one
/// was recorded during routing, 404 otherwise.
pub fn default_fallback_config(defaults: &ServiceOptions) -> ServiceConfig {
    ServiceConfig {
        route: fallback_route(),
        service: BoxHttpService::new(DefaultFallbackService),
        options: defaults.clone(),
    }
}

/// Inserted into request extensions by the dispatcher so the fallback
/// service can observe what routing deferred.
#[derive(Debug, Clone)]
pub struct DeferredStatus(pub HttpStatusError);

struct DefaultFallbackService;

impl HttpService for DefaultFallbackService {
    async fn serve(
        &self,
        _cx: ServiceContext<'_>,
        req: http::Request<HttpBody>,
    ) -> AnyResult<http::Response<HttpBody>> {
        let status = req
            .extensions()
            .get::<DeferredStatus>()
            .map(|d| d.0.clone())
            .unwrap_or_else(|| HttpStatusError::of(StatusCode::NOT_FOUND));
        let mut resp = http::Response::new(HttpBody::from(status.message.to_string()));
        *resp.status_mut() = status.status;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Ok(resp)
    }

    fn handles_cors_preflight(&self) -> bool {
        // Preflights that matched nothing still need a response.
        true
    }
}

/// The per-server hostname → virtual host table.
pub struct VirtualHosts {
    hosts: Vec<Rc<VirtualHost>>,
    default_host: Rc<VirtualHost>,
}

impl VirtualHosts {
    pub fn builder() -> VirtualHostsBuilder {
        VirtualHostsBuilder::default()
    }

    /// Select the most specific host for a hostname: exact beats wildcard,
    /// longer wildcard suffixes beat shorter, the default host catches the
    /// rest.
    pub fn select(&self, hostname: &str) -> &VirtualHost {
        self.hosts
            .iter()
            .filter(|h| h.pattern.matches(hostname))
            .max_by_key(|h| h.pattern.specificity())
            .unwrap_or(&self.default_host)
    }

    pub fn default_host(&self) -> &VirtualHost {
        &self.default_host
    }
}

#[derive(Default)]
pub struct VirtualHostsBuilder {
    hosts: Vec<VirtualHost>,
    default_host: Option<VirtualHost>,
}

impl VirtualHostsBuilder {
    pub fn host(mut self, host: VirtualHost) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn default_host(mut self, host: VirtualHost) -> Self {
        self.default_host = Some(host);
        self
    }

    pub fn build(self) -> AnyResult<VirtualHosts> {
        let Some(default_host) = self.default_host else {
            crate::bail_into!("a default virtual host is required");
        };
        Ok(VirtualHosts {
            hosts: self.hosts.into_iter().map(Rc::new).collect(),
            default_host: Rc::new(default_host),
        })
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method};

    use crate::{
        http::service::service_fn,
        routing::context::SessionProtocol,
    };

    use super::*;

    fn ok_service() -> impl HttpService {
        service_fn(|_cx, _req| http::Response::new(HttpBody::from("ok")))
    }

    fn ctx(method: Method, target: &str) -> RoutingContext {
        RoutingContext::new(
            "a.example.com",
            method,
            target,
            HeaderMap::new(),
            SessionProtocol::Http1,
        )
    }

    fn host() -> VirtualHost {
        VirtualHost::builder("*.example.com")
            .service(
                Route::builder().path("/health").get().build().unwrap(),
                ok_service(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_hostname_patterns() {
        assert!(HostnamePattern::parse("*.example.com").matches("a.example.com"));
        assert!(!HostnamePattern::parse("*.example.com").matches("example.com"));
        assert!(HostnamePattern::parse("api.example.com").matches("API.example.com"));
        assert!(HostnamePattern::parse("*").matches("anything"));
    }

    #[test]
    fn test_head_retries_as_get() {
        let host = host();
        let routed = host
            .find_service_config(&ctx(Method::HEAD, "/health"), false)
            .unwrap();
        assert!(!routed.fallback);
    }

    #[test]
    fn test_fallback_carries_deferred_status() {
        let host = host();
        let c = ctx(Method::POST, "/health");
        let routed = host.find_service_config(&c, true).unwrap();
        assert!(routed.fallback);
        assert_eq!(
            c.deferred_status().unwrap().status,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_no_fallback_returns_none() {
        let host = host();
        assert!(host
            .find_service_config(&ctx(Method::GET, "/missing"), false)
            .is_none());
    }

    #[monoio::test]
    async fn test_default_fallback_serves_deferred_status() {
        let defaults = ServiceOptions::default();
        let fallback = default_fallback_config(&defaults);
        let mut req = http::Request::new(HttpBody::empty());
        req.extensions_mut().insert(DeferredStatus(HttpStatusError::of(
            StatusCode::METHOD_NOT_ALLOWED,
        )));
        let result = RoutingResult::fallback("/x", None);
        let resp = fallback
            .service
            .serve(
                ServiceContext {
                    routing: &result,
                    options: &defaults,
                },
                req,
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let resp = fallback
            .service
            .serve(
                ServiceContext {
                    routing: &result,
                    options: &defaults,
                },
                http::Request::new(HttpBody::empty()),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_select_prefers_specific_host() {
        let wildcard = host();
        let exact = VirtualHost::builder("a.example.com")
            .service(
                Route::builder().path("/health").get().build().unwrap(),
                ok_service(),
            )
            .build()
            .unwrap();
        let default_host = VirtualHost::builder("*").build().unwrap();
        let hosts = VirtualHosts::builder()
            .host(wildcard)
            .host(exact)
            .default_host(default_host)
            .build()
            .unwrap();

        assert_eq!(
            hosts.select("a.example.com").pattern(),
            &HostnamePattern::Exact("a.example.com".to_string())
        );
        assert!(matches!(
            hosts.select("b.example.com").pattern(),
            HostnamePattern::Wildcard(_)
        ));
        assert_eq!(hosts.select("other.host").pattern(), &HostnamePattern::Any);
    }
}
