//! HTTP/2 frame-adapter: accepted streams become decoded requests.
//!
//! Sits on `monoio_http::h2::server`: the handshake yields a connection
//! whose `accept` produces `(Request<RecvStream>, SendResponse)` pairs.
//! Each stream gets a routing context and a backpressured request stream;
//! DATA is accounted against the request length limit (overflow resets
//! the stream with `ENHANCE_YOUR_CALM`), trailers merge-and-close, and a
//! peer reset cancels the decoded request without touching its neighbors.
//!
//! Keep-alive is PING-based on the configured interval; a missed pong
//! closes the connection. Shutdown is the two-phase GOAWAY: phase one
//! (`graceful_shutdown`) advertises `lastStreamId = 2^31 - 1` and keeps
//! serving in-flight streams, phase two closes abruptly once the grace
//! period runs out.

use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{stream::FuturesUnordered, StreamExt};
use http::{Request, StatusCode, Version};
use lagoon_core::{
    config::RequestLimits,
    context::keys::{PeerAddr, ServerName},
    http::{
        body::{body_channel, BodyError, BodyWriter, HttpBody, StreamMeta},
        HttpHandler,
    },
    routing::{RoutingContext, SessionProtocol},
};
use monoio::io::{AsyncReadRent, AsyncWriteRent, Split};
use monoio_http::h2::{
    server::{Builder, SendResponse},
    Ping, PingPong, Reason, RecvStream,
};
use service_async::ParamRef;
use tracing::{debug, error, info, warn};

use crate::common::DrainWatcher;

use super::{
    generate_response,
    keepalive::{ConnectionLifecycle, KeepalivePolicy, LifecycleEvent, Phase},
};

const INITIAL_WINDOW_SIZE: u32 = 1_000_000;
const MAX_CONCURRENT_STREAMS: u32 = 1000;
const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct H2Config {
    pub limits: RequestLimits,
    pub keepalive: KeepalivePolicy,
    pub grace_period: Duration,
}

pub(crate) async fn serve_h2<S, H, CX, Err>(
    stream: S,
    ctx: CX,
    handler_chain: &H,
    config: &H2Config,
    drain: DrainWatcher,
) where
    CX: ParamRef<PeerAddr> + ParamRef<Option<ServerName>> + Clone,
    H: HttpHandler<CX, HttpBody, Body = HttpBody, Error = Err>,
    Err: Debug,
    S: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
{
    let mut connection = match Builder::new()
        .initial_window_size(INITIAL_WINDOW_SIZE)
        .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
        .handshake::<S, Bytes>(stream)
        .await
    {
        Ok(connection) => {
            info!(
                "H2 handshake complete for {:?}",
                ParamRef::<PeerAddr>::param_ref(&ctx)
            );
            connection
        }
        Err(err) => {
            error!("h2 server build failed: {err:?}");
            return;
        }
    };

    let mut ping_pong = connection.ping_pong();
    let mut lifecycle = ConnectionLifecycle::new(config.keepalive.clone());
    // SNI fixes the virtual host for every stream on this connection.
    let sni_hostname: Option<String> = ParamRef::<Option<ServerName>>::param_ref(&ctx)
        .as_ref()
        .map(|s| s.0.to_ascii_lowercase());
    let mut stream_tasks = FuturesUnordered::new();
    let mut next_id: u32 = 0;
    let mut drain_requested = drain.is_triggered();
    let mut drain_started = false;
    let mut grace_deadline: Option<Instant> = None;
    let mut force_close = false;
    let mut accept_done = false;

    loop {
        // Connection-level transitions happen outside the select so the
        // accept future never competes for the `&mut connection` borrow.
        if (drain_requested || lifecycle.phase() != Phase::Active) && !drain_started {
            info!(
                "H2 connection {:?} draining",
                ParamRef::<PeerAddr>::param_ref(&ctx)
            );
            lifecycle.initiate_drain();
            connection.graceful_shutdown();
            drain_started = true;
            // A zero grace period means "wait for in-flight streams";
            // anything longer arms the abrupt phase-two close.
            if config.grace_period > Duration::ZERO {
                grace_deadline = Some(Instant::now() + config.grace_period);
            }
        }
        if force_close {
            connection.abrupt_shutdown(Reason::NO_ERROR);
            break;
        }
        if accept_done && stream_tasks.is_empty() {
            break;
        }

        let timer = lifecycle.next_event();
        let grace_remaining = grace_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        monoio::select! {
            _ = drain.wait(), if !drain_requested => {
                drain_requested = true;
            }
            _ = monoio::time::sleep(grace_remaining.unwrap_or_default()),
                if grace_remaining.is_some() && !stream_tasks.is_empty() => {
                warn!("grace period elapsed with streams in flight");
                force_close = true;
            }
            _ = monoio::time::sleep(timer.map(|(_, d)| d).unwrap_or_default()),
                if timer.is_some() && !drain_started => {
                match timer.map(|(e, _)| e) {
                    Some(LifecycleEvent::PingDue) => {
                        if let Some(pp) = ping_pong.as_mut() {
                            if ping(pp).await {
                                lifecycle.on_ping_sent();
                            } else {
                                force_close = true;
                            }
                        } else {
                            lifecycle.on_ping_sent();
                        }
                    }
                    Some(LifecycleEvent::IdleTimeout) => {
                        if stream_tasks.is_empty() {
                            info!(
                                "H2 connection {:?} idle timeout",
                                ParamRef::<PeerAddr>::param_ref(&ctx)
                            );
                            force_close = true;
                        } else {
                            lifecycle.on_activity();
                        }
                    }
                    Some(LifecycleEvent::MaxAgeReached) => {
                        lifecycle.initiate_drain();
                    }
                    None => {}
                }
            }
            accepted = connection.accept(), if !accept_done => {
                match accepted {
                    Some(Ok((request, respond))) => {
                        lifecycle.on_activity();
                        // Crossing the request budget flips the lifecycle
                        // into Draining; the GOAWAY goes out at loop top
                        // while this stream is still served.
                        let _ = lifecycle.admit_request();
                        next_id += 1;
                        stream_tasks.push(serve_stream(
                            handler_chain,
                            ctx.clone(),
                            request,
                            respond,
                            next_id,
                            config.limits,
                            sni_hostname.as_deref(),
                        ));
                    }
                    Some(Err(err)) => {
                        warn!("h2 accept failed: {err:?}");
                        accept_done = true;
                    }
                    None => {
                        accept_done = true;
                    }
                }
            }
            Some(_) = stream_tasks.next(), if !stream_tasks.is_empty() => {
                lifecycle.on_activity();
            }
        }
    }

    info!(
        "H2 connection processing complete for {:?}",
        ParamRef::<PeerAddr>::param_ref(&ctx)
    );
}

async fn ping(ping_pong: &mut PingPong) -> bool {
    match monoio::time::timeout(PING_TIMEOUT, ping_pong.ping(Ping::opaque())).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            warn!("h2 ping failed: {err:?}");
            false
        }
        Err(_) => {
            warn!("h2 ping timed out");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvOutcome {
    Completed,
    TooLarge,
    PeerReset,
}

async fn serve_stream<H, CX, Err>(
    handler_chain: &H,
    ctx: CX,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    id: u32,
    limits: RequestLimits,
    sni: Option<&str>,
) where
    CX: Clone,
    H: HttpHandler<CX, HttpBody, Body = HttpBody, Error = Err>,
    Err: Debug,
{
    let (parts, recv_body) = request.into_parts();
    let hostname = match sni {
        Some(name) => name.to_string(),
        None => parts
            .uri
            .host()
            .map(|h| h.to_ascii_lowercase())
            .or_else(|| {
                parts
                    .headers
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_ascii_lowercase())
            })
            .unwrap_or_default(),
    };
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let routing_ctx = RoutingContext::new(
        hostname,
        parts.method.clone(),
        &target,
        parts.headers.clone(),
        SessionProtocol::Http2,
    );

    // Client stream ids are the odd numbers, in accept order.
    let meta = StreamMeta {
        id,
        stream_id: 2 * id - 1,
    };
    let mut recv_writer: Option<(RecvStream, BodyWriter)> = None;
    let body = if recv_body.is_end_stream() {
        HttpBody::empty()
    } else {
        let (writer, stream) = body_channel(meta, limits.max_request_length);
        recv_writer = Some((recv_body, writer));
        HttpBody::streamed(stream)
    };

    let mut req = Request::new(body);
    *req.method_mut() = parts.method;
    *req.uri_mut() = parts.uri;
    *req.version_mut() = Version::HTTP_2;
    *req.headers_mut() = parts.headers;

    let handler_fut = handler_chain.handle(req, routing_ctx, ctx);
    futures::pin_mut!(handler_fut);

    let mut recv_outcome: Option<RecvOutcome> = None;
    let handled = match recv_writer {
        Some((recv, writer)) => {
            let pump = pump_recv_stream(recv, writer);
            futures::pin_mut!(pump);
            let out = loop {
                monoio::select! {
                    out = &mut handler_fut => break out,
                    outcome = &mut pump, if recv_outcome.is_none() => {
                        recv_outcome = Some(outcome);
                    }
                }
            };
            if recv_outcome.is_none() {
                // Keep draining in the background while the response goes
                // out; the service dropped the stream so frames discard.
                recv_outcome = Some((&mut pump).await);
            }
            out
        }
        None => handler_fut.await,
    };

    if recv_outcome == Some(RecvOutcome::TooLarge) {
        debug!("stream {} exceeded the request length limit", meta.stream_id);
        respond.send_reset(Reason::ENHANCE_YOUR_CALM);
        return;
    }
    if recv_outcome == Some(RecvOutcome::PeerReset) {
        return;
    }

    let response = match handled {
        Ok((response, _)) => response,
        Err(err) => {
            error!("handler chain returned error: {err:?}");
            generate_response(StatusCode::INTERNAL_SERVER_ERROR, false)
        }
    };
    send_h2_response(response, respond).await;
}

async fn pump_recv_stream(mut recv: RecvStream, mut writer: BodyWriter) -> RecvOutcome {
    let mut discarding = false;
    loop {
        if !discarding {
            match writer.writable().await {
                Ok(()) => {}
                Err(BodyError::ContentTooLarge) => return RecvOutcome::TooLarge,
                Err(_) => discarding = true,
            }
        }
        match recv.data().await {
            Some(Ok(data)) => {
                let len = data.len();
                if !discarding {
                    match writer.send(data) {
                        Ok(()) => {}
                        Err(BodyError::ContentTooLarge) => return RecvOutcome::TooLarge,
                        Err(_) => discarding = true,
                    }
                }
                // Release connection window regardless; a lagging stream
                // must not starve its siblings.
                let _ = recv.flow_control().release_capacity(len);
            }
            Some(Err(err)) => {
                debug!("h2 request stream ended: {err:?}");
                writer.fail(BodyError::Cancelled);
                return RecvOutcome::PeerReset;
            }
            None => {
                match recv.trailers().await {
                    Ok(trailers) => {
                        if !discarding {
                            writer.finish(trailers);
                        }
                    }
                    Err(err) => {
                        debug!("h2 trailers failed: {err:?}");
                        writer.fail(BodyError::Cancelled);
                        return RecvOutcome::PeerReset;
                    }
                }
                return RecvOutcome::Completed;
            }
        }
    }
}

async fn send_h2_response(response: http::Response<HttpBody>, mut respond: SendResponse<Bytes>) {
    let (mut parts, mut body) = response.into_parts();
    parts.headers.remove(http::header::CONNECTION);
    parts.headers.remove(http::header::TRANSFER_ENCODING);
    let head = http::Response::from_parts(parts, ());

    match body.stream_hint() {
        lagoon_core::http::body::StreamHint::None => {
            if let Err(err) = respond.send_response(head, true) {
                error!("h2 response send failed: {err:?}");
            }
        }
        lagoon_core::http::body::StreamHint::Fixed => {
            let mut send_stream = match respond.send_response(head, false) {
                Ok(s) => s,
                Err(err) => {
                    error!("h2 response send failed: {err:?}");
                    return;
                }
            };
            if let Some(Ok(data)) = body.next_data().await {
                let _ = send_stream.send_data(data, true);
            }
        }
        lagoon_core::http::body::StreamHint::Stream => {
            let mut send_stream = match respond.send_response(head, false) {
                Ok(s) => s,
                Err(err) => {
                    error!("h2 response send failed: {err:?}");
                    return;
                }
            };
            loop {
                match body.next_data().await {
                    Some(Ok(data)) => {
                        if send_stream.send_data(data, false).is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        debug!("h2 response body failed: {err:?}");
                        send_stream.send_reset(Reason::INTERNAL_ERROR);
                        return;
                    }
                    None => break,
                }
            }
            match body.take_trailers() {
                Some(trailers) => {
                    let _ = send_stream.send_trailers(trailers);
                }
                None => {
                    let _ = send_stream.send_data(Bytes::new(), true);
                }
            }
        }
    }
}
