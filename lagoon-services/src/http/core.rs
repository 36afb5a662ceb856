//! Core HTTP service driving decoded connections.
//!
//! One [`HttpCoreService`] call owns one downstream connection for its
//! whole life. HTTP/1.1 connections run the decode → route → serve →
//! encode loop below, one request at a time, with the body pump and the
//! handler chain driven concurrently so a service can respond while the
//! request body is still arriving. HTTP/2 connections are handed to the
//! frame adapter in [`super::h2`].
//!
//! The loop consults a [`ConnectionLifecycle`] for idle/age/request-count
//! policy, honors the drain signal between requests, answers
//! `Expect: 100-continue` before the body is pulled, and performs the
//! WebSocket handoff by flipping the decoder into tunnel mode after an
//! accepted 101.

use std::{convert::Infallible, fmt::Debug, time::Duration};

use http::{Method, Request, StatusCode, Version};
use lagoon_core::{
    config::{KeepaliveConfig, RequestLimits, ShutdownConfig},
    context::keys::{PeerAddr, ServerName},
    http::{
        body::{body_channel, BodyError, BodyWriter, HttpBody, StreamMeta},
        HttpAccept, HttpHandler,
    },
    routing::{RoutingContext, SessionProtocol},
};
use monoio::io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable};
use monoio_codec::FramedRead;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, ParamRef, Service,
};
use tracing::{error, info, warn};

use crate::common::DrainWatcher;

use super::{
    generate_response,
    h1::{
        decoder::{BodyKind, DecodeError, H1Frame, RequestDecoder, UpgradeKind},
        encoder::{ResponseEncoder, ResponseMeta},
    },
    h2,
    handlers::PeerKeepalive,
    keepalive::{ConnectionLifecycle, KeepalivePolicy, LifecycleEvent},
};

/// Read-side timeouts for the HTTP/1 decoder; the keep-alive idle timeout
/// lives in [`KeepalivePolicy`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HttpServerTimeout {
    /// Cap on receiving a full request head.
    pub read_header_timeout: Option<Duration>,
    /// Cap on each wait for the next body chunk.
    pub read_body_timeout: Option<Duration>,
}

/// Core HTTP service handler supporting HTTP/1.1 and HTTP/2.
#[derive(Clone)]
pub struct HttpCoreService<H> {
    handler_chain: H,
    http_timeout: HttpServerTimeout,
    limits: RequestLimits,
    keepalive: KeepalivePolicy,
    shutdown: ShutdownConfig,
    drain: DrainWatcher,
}

impl<H> HttpCoreService<H> {
    pub fn new(
        handler_chain: H,
        http_timeout: HttpServerTimeout,
        limits: RequestLimits,
        keepalive: KeepalivePolicy,
        shutdown: ShutdownConfig,
    ) -> Self {
        Self {
            handler_chain,
            http_timeout,
            limits,
            keepalive,
            shutdown,
            drain: DrainWatcher::disconnected(),
        }
    }

    /// Attach the worker's drain signal; connections outside a drain scope
    /// keep the default disconnected watcher.
    pub fn with_drain(mut self, drain: DrainWatcher) -> Self {
        self.drain = drain;
        self
    }

    async fn h1_svc<S, CX, Err>(&self, stream: S, ctx: CX)
    where
        CX: ParamRef<PeerAddr> + ParamRef<Option<ServerName>> + Clone,
        H: HttpHandler<CX, HttpBody, Body = HttpBody, Error = Err>,
        Err: Debug,
        S: Split + AsyncReadRent + AsyncWriteRent,
    {
        let (reader, writer) = stream.into_split();
        let mut framed = FramedRead::new(reader, RequestDecoder::new(self.limits));
        let mut encoder = ResponseEncoder::new(writer);
        let mut lifecycle = ConnectionLifecycle::new(self.keepalive.clone());
        let mut request_id: u32 = 0;

        loop {
            if lifecycle.should_close_after_response() {
                break;
            }

            let decoded = match wait_next_frame(
                &mut framed,
                &lifecycle,
                &self.drain,
                self.http_timeout.read_header_timeout,
            )
            .await
            {
                Waited::Frame(frame) => frame,
                Waited::Timeout(event) => {
                    info!(
                        "Connection {:?} reached {:?}",
                        ParamRef::<PeerAddr>::param_ref(&ctx),
                        event
                    );
                    break;
                }
                Waited::Drain => {
                    // Between requests; nothing in flight to wait for.
                    lifecycle.initiate_drain();
                    break;
                }
            };

            let head = match decoded {
                Some(Ok(H1Frame::Head(head))) => head,
                Some(Ok(_)) => {
                    warn!("body frame while idle; closing connection");
                    break;
                }
                Some(Err(err)) => {
                    warn!("decode request header failed: {err}");
                    if let Some(status) = err.status() {
                        encoder.on_request();
                        let _ = encoder
                            .send_response(
                                generate_response(status, true),
                                ResponseMeta {
                                    request_method: Method::GET,
                                    version: Version::HTTP_11,
                                    close: true,
                                },
                            )
                            .await;
                    }
                    break;
                }
                None => {
                    info!(
                        "Connection {:?} closed",
                        ParamRef::<PeerAddr>::param_ref(&ctx)
                    );
                    break;
                }
            };

            if !lifecycle.admit_request() {
                break;
            }
            encoder.on_request();
            request_id += 1;

            let hostname = match hostname_of(head.headers.get(http::header::HOST), head.version)
            {
                Ok(hostname) => hostname,
                Err(()) => {
                    let _ = encoder
                        .send_response(
                            generate_response(StatusCode::BAD_REQUEST, true),
                            ResponseMeta {
                                request_method: head.method.clone(),
                                version: head.version,
                                close: true,
                            },
                        )
                        .await;
                    break;
                }
            };
            // SNI wins over the Host header for virtual-host selection.
            let hostname = match ParamRef::<Option<ServerName>>::param_ref(&ctx) {
                Some(sni) => sni.0.to_ascii_lowercase(),
                None => hostname,
            };

            if head.expect_continue
                && encoder
                    .send_informational(StatusCode::CONTINUE)
                    .await
                    .is_err()
            {
                break;
            }

            // Body wiring. A WebSocket upgrade keeps its channel aside: the
            // inbound bytes only start flowing after an accepted 101.
            let meta = StreamMeta {
                id: request_id,
                stream_id: 1,
            };
            let is_websocket =
                head.upgrade == Some(UpgradeKind::WebSocket) && head.body == BodyKind::Empty;
            let mut tunnel_writer: Option<BodyWriter> = None;
            let mut body_writer: Option<BodyWriter> = None;
            let body = if is_websocket {
                let (writer, stream) = body_channel(meta, usize::MAX);
                tunnel_writer = Some(writer);
                HttpBody::streamed(stream)
            } else {
                match head.body {
                    BodyKind::Empty => HttpBody::empty(),
                    _ => {
                        let (writer, stream) =
                            body_channel(meta, self.limits.max_request_length);
                        body_writer = Some(writer);
                        HttpBody::streamed(stream)
                    }
                }
            };

            let mut routing_ctx = RoutingContext::new(
                hostname,
                head.method.clone(),
                &head.target,
                head.headers.clone(),
                SessionProtocol::Http1,
            );
            if is_websocket {
                routing_ctx.mark_websocket_upgrade();
            }

            let mut req = Request::new(body);
            *req.method_mut() = head.method.clone();
            *req.version_mut() = head.version;
            if let Ok(uri) = head.target.parse::<http::Uri>() {
                *req.uri_mut() = uri;
            }
            *req.headers_mut() = head.headers;
            req.extensions_mut().insert(PeerKeepalive(head.keepalive));

            // Drive the handler chain and the body pump together so a
            // service can answer before the body finished arriving.
            let handler_fut = self.handler_chain.handle(req, routing_ctx, ctx.clone());
            futures::pin_mut!(handler_fut);
            let mut pump_outcome: Option<PumpOutcome> = None;

            let handled = match body_writer {
                Some(writer) => {
                    let pump = pump_h1_body(
                        &mut framed,
                        writer,
                        self.http_timeout.read_body_timeout,
                        PumpMode::Message,
                    );
                    futures::pin_mut!(pump);
                    let out = loop {
                        monoio::select! {
                            out = &mut handler_fut => break out,
                            res = &mut pump, if pump_outcome.is_none() => {
                                pump_outcome = Some(res);
                            }
                        }
                    };
                    let (response, cont) = unwrap_handled(out);
                    let response_meta = ResponseMeta {
                        request_method: head.method.clone(),
                        version: head.version,
                        close: !cont || lifecycle.should_close_after_response(),
                    };
                    match pump_outcome {
                        Some(_) => encoder.send_response(response, response_meta).await,
                        None => {
                            let (sent, pumped) = futures::join!(
                                encoder.send_response(response, response_meta),
                                &mut pump
                            );
                            pump_outcome = Some(pumped);
                            sent
                        }
                    }
                    .map(|tunnel| (tunnel, cont))
                }
                None => {
                    let out = handler_fut.await;
                    let (mut response, cont) = unwrap_handled(out);
                    pump_outcome = Some(PumpOutcome::Completed);

                    let accepted_upgrade = response.status() == StatusCode::SWITCHING_PROTOCOLS;
                    if accepted_upgrade && tunnel_writer.is_none() {
                        // A 101 for a request that did not ask to upgrade
                        // is a handler bug.
                        error!("service answered 101 without an upgrade request");
                        response = generate_response(StatusCode::INTERNAL_SERVER_ERROR, true);
                    }
                    let response_meta = ResponseMeta {
                        request_method: head.method.clone(),
                        version: head.version,
                        close: !cont || lifecycle.should_close_after_response(),
                    };
                    encoder
                        .send_response(response, response_meta)
                        .await
                        .map(|tunnel| (tunnel, cont))
                }
            };

            let (tunnel_body, cont) = match handled {
                Ok(done) => done,
                Err(err) => {
                    warn!("error when encode and write response: {err}");
                    break;
                }
            };
            lifecycle.on_activity();

            if let Some(outbound) = tunnel_body {
                let Some(inbound) = tunnel_writer else {
                    break;
                };
                framed.decoder_mut().set_tunnel();
                lifecycle.enter_tunnel();
                info!(
                    "Connection {:?} upgraded to websocket",
                    ParamRef::<PeerAddr>::param_ref(&ctx)
                );
                run_tunnel(&mut framed, inbound, outbound, &mut encoder).await;
                break;
            }

            match pump_outcome {
                Some(PumpOutcome::Completed) => {}
                outcome => {
                    info!("request stream ended early: {outcome:?}");
                    break;
                }
            }
            if !cont {
                break;
            }
        }
    }
}

fn unwrap_handled<Err: Debug>(
    out: Result<(http::Response<HttpBody>, bool), Err>,
) -> (http::Response<HttpBody>, bool) {
    match out {
        Ok(handled) => handled,
        Err(err) => {
            // Not a service failure (the dispatcher absorbs those); the
            // chain itself broke.
            error!("error when processing request: {err:?}");
            (
                generate_response(StatusCode::INTERNAL_SERVER_ERROR, true),
                false,
            )
        }
    }
}

/// Hostname for virtual-host selection, from the `Host` header. Required
/// for HTTP/1.1; HTTP/1.0 requests without one select the default host.
fn hostname_of(
    host: Option<&http::HeaderValue>,
    version: Version,
) -> Result<String, ()> {
    let Some(host) = host else {
        return if version == Version::HTTP_10 {
            Ok(String::new())
        } else {
            Err(())
        };
    };
    let host = host.to_str().map_err(|_| ())?;
    let stripped = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal.
        rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest)
    } else {
        host.split_once(':').map(|(name, _)| name).unwrap_or(host)
    };
    Ok(stripped.trim().to_ascii_lowercase())
}

enum Waited {
    Frame(Option<Result<H1Frame, DecodeError>>),
    Timeout(LifecycleEvent),
    Drain,
}

async fn wait_next_frame<R: AsyncReadRent>(
    framed: &mut FramedRead<R, RequestDecoder>,
    lifecycle: &ConnectionLifecycle,
    drain: &DrainWatcher,
    read_header_timeout: Option<Duration>,
) -> Waited {
    // The header-read cap competes with whatever lifecycle timer is next.
    let mut next = lifecycle.next_event();
    if let Some(cap) = read_header_timeout {
        let replace = match next {
            Some((_, remaining)) => cap < remaining,
            None => true,
        };
        if replace {
            next = Some((LifecycleEvent::IdleTimeout, cap));
        }
    }
    match next {
        Some((event, remaining)) => {
            monoio::select! {
                frame = framed.next() => Waited::Frame(frame),
                _ = monoio::time::sleep(remaining) => Waited::Timeout(event),
                _ = drain.wait() => Waited::Drain,
            }
        }
        None => {
            monoio::select! {
                frame = framed.next() => Waited::Frame(frame),
                _ = drain.wait() => Waited::Drain,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpMode {
    /// Pump one message body; drain-and-discard after cancellation so the
    /// connection stays reusable.
    Message,
    /// Pump an upgraded tunnel; cancellation ends the pump.
    Tunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpOutcome {
    Completed,
    TooLarge,
    DecodeFailed,
    PeerClosed,
    Cancelled,
    BodyTimeout,
}

/// Feed decoder frames into the request stream, respecting the stream's
/// watermarks: no further socket read is issued while the consumer lags.
async fn pump_h1_body<R: AsyncReadRent>(
    framed: &mut FramedRead<R, RequestDecoder>,
    mut writer: BodyWriter,
    read_body_timeout: Option<Duration>,
    mode: PumpMode,
) -> PumpOutcome {
    let mut discarding = false;
    loop {
        if !discarding {
            match writer.writable().await {
                Ok(()) => {}
                Err(BodyError::ContentTooLarge) => return PumpOutcome::TooLarge,
                Err(_) => {
                    if mode == PumpMode::Tunnel {
                        return PumpOutcome::Cancelled;
                    }
                    discarding = true;
                }
            }
        }

        let frame = match read_body_timeout {
            Some(cap) => match monoio::time::timeout(cap, framed.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    writer.fail(BodyError::Incomplete);
                    return PumpOutcome::BodyTimeout;
                }
            },
            None => framed.next().await,
        };

        match frame {
            None => return PumpOutcome::PeerClosed,
            Some(Err(err)) => {
                warn!("error when decode request body: {err}");
                writer.fail(BodyError::Protocol("malformed body"));
                return PumpOutcome::DecodeFailed;
            }
            Some(Ok(H1Frame::Data(data))) => {
                if !discarding {
                    match writer.send(data) {
                        Ok(()) => {}
                        Err(BodyError::ContentTooLarge) => return PumpOutcome::TooLarge,
                        Err(_) => {
                            if mode == PumpMode::Tunnel {
                                return PumpOutcome::Cancelled;
                            }
                            discarding = true;
                        }
                    }
                }
            }
            Some(Ok(H1Frame::End(trailers))) => {
                if !discarding {
                    writer.finish(trailers);
                }
                return PumpOutcome::Completed;
            }
            Some(Ok(H1Frame::Head(_))) => {
                writer.fail(BodyError::Protocol("unexpected message head"));
                return PumpOutcome::DecodeFailed;
            }
        }
    }
}

/// Full-duplex relay for an accepted upgrade: inbound socket bytes become
/// the request stream, the response stream goes out unframed. Ends when
/// either side finishes.
async fn run_tunnel<R: AsyncReadRent, W: AsyncWriteRent>(
    framed: &mut FramedRead<R, RequestDecoder>,
    inbound: BodyWriter,
    mut outbound: HttpBody,
    encoder: &mut ResponseEncoder<W>,
) {
    let inbound_fut = pump_h1_body(framed, inbound, None, PumpMode::Tunnel);
    let outbound_fut = async {
        while let Some(chunk) = outbound.next_data().await {
            match chunk {
                Ok(data) => {
                    if encoder.send_raw(data).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };
    monoio::select! {
        outcome = inbound_fut => {
            info!("tunnel closed by peer: {outcome:?}");
        }
        _ = outbound_fut => {
            info!("tunnel closed by service");
        }
    }
}

impl<H, S, CX, Err> Service<HttpAccept<S, CX>> for HttpCoreService<H>
where
    CX: ParamRef<PeerAddr> + ParamRef<Option<ServerName>> + Clone + 'static,
    H: HttpHandler<CX, HttpBody, Body = HttpBody, Error = Err>,
    Err: Debug,
    S: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
{
    type Response = ();
    type Error = Infallible;

    async fn call(
        &self,
        (use_h2, stream, ctx): HttpAccept<S, CX>,
    ) -> Result<Self::Response, Self::Error> {
        if use_h2 {
            h2::serve_h2(
                stream,
                ctx,
                &self.handler_chain,
                &h2::H2Config {
                    limits: self.limits,
                    keepalive: self.keepalive.clone(),
                    grace_period: self.shutdown.grace_period(),
                },
                self.drain.clone(),
            )
            .await;
        } else {
            self.h1_svc(stream, ctx).await;
        }
        Ok(())
    }
}

impl<F: MakeService> MakeService for HttpCoreService<F> {
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))?,
            http_timeout: self.http_timeout,
            limits: self.limits,
            keepalive: self.keepalive.clone(),
            shutdown: self.shutdown,
            drain: self.drain.clone(),
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for HttpCoreService<F> {
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))
                .await?,
            http_timeout: self.http_timeout,
            limits: self.limits,
            keepalive: self.keepalive.clone(),
            shutdown: self.shutdown,
            drain: self.drain.clone(),
        })
    }
}

impl<F> HttpCoreService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<HttpServerTimeout>
            + Param<RequestLimits>
            + Param<KeepaliveConfig>
            + Param<ShutdownConfig>,
    {
        layer_fn(|c: &C, inner| {
            let keepalive_cfg: KeepaliveConfig = c.param();
            Self::new(
                inner,
                c.param(),
                c.param(),
                KeepalivePolicy::from(&keepalive_cfg),
                c.param(),
            )
        })
    }
}
