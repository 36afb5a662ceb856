//! Virtual-host dispatch: the innermost handler of the chain.
//!
//! Selects the virtual host for the context's hostname, resolves the
//! service config (with HEAD→GET retry, CORS preflight handoff and the
//! fallback path), installs the matched service's request-length limit on
//! the live body stream, applies the per-route request timeout, and
//! translates failures into responses: `HttpStatusError` to its carried
//! status, a request timeout to 503, an over-length body to 413, anything
//! else to 500.

use std::{convert::Infallible, rc::Rc};

use http::{Request, StatusCode};
use lagoon_core::{
    http::{
        body::{BodyError, HttpBody},
        service::ServiceContext,
        HttpStatusError, ResponseWithContinue,
    },
    routing::{DeferredStatus, RoutingContext, VirtualHosts},
    AnyError,
};
use service_async::{AsyncMakeService, MakeService, Service};
use tracing::warn;

use crate::http::{generate_response, util::truncate_error};

const VERBOSE_BODY_LIMIT: usize = 8 * 1024;

#[derive(Clone)]
pub struct Dispatcher {
    hosts: Rc<VirtualHosts>,
}

impl Dispatcher {
    pub fn new(hosts: Rc<VirtualHosts>) -> Self {
        Self { hosts }
    }

    pub fn factory(hosts: Rc<VirtualHosts>) -> DispatcherFactory {
        DispatcherFactory { hosts }
    }
}

impl<CX> Service<(Request<HttpBody>, RoutingContext, CX)> for Dispatcher {
    type Response = ResponseWithContinue<HttpBody>;
    // Dispatch failures become responses; only the transport layer can
    // fail the connection.
    type Error = Infallible;

    async fn call(
        &self,
        (mut req, routing_ctx, _cx): (Request<HttpBody>, RoutingContext, CX),
    ) -> Result<Self::Response, Self::Error> {
        let host = self.hosts.select(routing_ctx.hostname());
        let Some(routed) = host.find_service_config(&routing_ctx, true) else {
            return Ok((generate_response(StatusCode::NOT_FOUND, false), true));
        };

        if routing_ctx.is_websocket_upgrade()
            && !routed.fallback
            && !routed.value.service.supports_websocket()
        {
            // The route exists but its service cannot speak WebSocket.
            return Ok((generate_response(StatusCode::BAD_REQUEST, false), true));
        }

        let options = &routed.value.options;
        let controller = match req.body() {
            HttpBody::Streamed(stream) => Some(stream.controller()),
            _ => None,
        };
        if let Some(controller) = &controller {
            controller.set_max_length(options.max_request_length);
        }

        if routed.fallback {
            if let Some(deferred) = routing_ctx.take_deferred_status() {
                req.extensions_mut().insert(DeferredStatus(deferred));
            }
        }

        let service_cx = ServiceContext {
            routing: &routed.result,
            options,
        };
        let served = monoio::time::timeout(
            options.request_timeout,
            routed.value.service.serve(service_cx, req),
        )
        .await;

        match served {
            Ok(Ok(resp)) => Ok((resp, true)),
            Ok(Err(err)) => Ok(error_response(err, options.verbose_responses)),
            Err(_) => {
                if let Some(controller) = &controller {
                    controller.cancel();
                }
                warn!(
                    path = routing_ctx.path(),
                    timeout_ms = options.request_timeout.as_millis() as u64,
                    "request timed out"
                );
                Ok((
                    generate_response(StatusCode::SERVICE_UNAVAILABLE, false),
                    true,
                ))
            }
        }
    }
}

fn error_response(err: AnyError, verbose: bool) -> ResponseWithContinue<HttpBody> {
    if let Some(status_err) = err.downcast_ref::<HttpStatusError>() {
        let mut resp = generate_response(status_err.status, false);
        *resp.body_mut() = HttpBody::from(status_err.message.to_string());
        return (resp, true);
    }
    if matches!(
        err.downcast_ref::<BodyError>(),
        Some(BodyError::ContentTooLarge)
    ) {
        // The decoder stopped delivering; this connection's framing is
        // unrecoverable.
        return (generate_response(StatusCode::PAYLOAD_TOO_LARGE, true), false);
    }
    warn!("service failed: {err:?}");
    let mut resp = generate_response(StatusCode::INTERNAL_SERVER_ERROR, false);
    if verbose {
        *resp.body_mut() = HttpBody::from(truncate_error(format!("{err:?}"), VERBOSE_BODY_LIMIT));
    }
    (resp, true)
}

pub struct DispatcherFactory {
    hosts: Rc<VirtualHosts>,
}

impl MakeService for DispatcherFactory {
    type Service = Dispatcher;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(Dispatcher::new(self.hosts.clone()))
    }
}

impl AsyncMakeService for DispatcherFactory {
    type Service = Dispatcher;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(Dispatcher::new(self.hosts.clone()))
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method, Response};
    use lagoon_core::{
        http::service::{service_fn, HttpService, ServiceOptions},
        routing::{Route, RoutingContext, SessionProtocol, VirtualHost},
    };

    use super::*;

    fn hosts() -> Rc<VirtualHosts> {
        let default_host = VirtualHost::builder("*")
            .service(
                Route::builder().path("/ok").get().build().unwrap(),
                service_fn(|_cx, _req| Response::new(HttpBody::from("hello"))),
            )
            .service(
                Route::builder().path("/fail").get().build().unwrap(),
                FailingService,
            )
            .service(
                Route::builder().path("/teapot").get().build().unwrap(),
                TeapotService,
            )
            .build()
            .unwrap();
        Rc::new(
            VirtualHosts::builder()
                .default_host(default_host)
                .build()
                .unwrap(),
        )
    }

    struct FailingService;
    impl HttpService for FailingService {
        async fn serve(
            &self,
            _cx: ServiceContext<'_>,
            _req: Request<HttpBody>,
        ) -> Result<Response<HttpBody>, AnyError> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct TeapotService;
    impl HttpService for TeapotService {
        async fn serve(
            &self,
            _cx: ServiceContext<'_>,
            _req: Request<HttpBody>,
        ) -> Result<Response<HttpBody>, AnyError> {
            Err(HttpStatusError::of(StatusCode::IM_A_TEAPOT).into())
        }
    }

    fn rctx(method: Method, target: &str) -> RoutingContext {
        RoutingContext::new("h", method, target, HeaderMap::new(), SessionProtocol::Http1)
    }

    async fn dispatch(method: Method, target: &str) -> ResponseWithContinue<HttpBody> {
        let dispatcher = Dispatcher::new(hosts());
        let req = Request::new(HttpBody::empty());
        dispatcher
            .call((req, rctx(method, target), ()))
            .await
            .unwrap()
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_matched_service_serves() {
        let (resp, cont) = dispatch(Method::GET, "/ok").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(cont);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_unmatched_falls_back_to_404() {
        let (resp, _) = dispatch(Method::GET, "/missing").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_deferred_405_surfaces() {
        let (resp, _) = dispatch(Method::POST, "/ok").await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_internal_error_becomes_500() {
        let (resp, cont) = dispatch(Method::GET, "/fail").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(cont);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_status_error_keeps_its_status() {
        let (resp, _) = dispatch(Method::GET, "/teapot").await;
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_verbose_500_body() {
        let options = ServiceOptions {
            verbose_responses: true,
            ..Default::default()
        };
        let default_host = VirtualHost::builder("*")
            .defaults(options)
            .service(
                Route::builder().path("/fail").get().build().unwrap(),
                FailingService,
            )
            .build()
            .unwrap();
        let hosts = Rc::new(
            VirtualHosts::builder()
                .default_host(default_host)
                .build()
                .unwrap(),
        );
        let dispatcher = Dispatcher::new(hosts);
        let (mut resp, _) = dispatcher
            .call((
                Request::new(HttpBody::empty()),
                rctx(Method::GET, "/fail"),
                (),
            ))
            .await
            .unwrap();
        let body = resp.body_mut().next_data().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("boom"));
    }
}
