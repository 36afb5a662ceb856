//! Message bodies and the backpressured request stream.
//!
//! Decoders feed request payloads through a single-producer single-consumer
//! channel ([`BodyWriter`] → [`BodyStream`]) owned by one connection worker.
//! The channel tracks undelivered bytes against a pair of watermarks; the
//! [`InboundTrafficController`] view of that state is what gates further
//! socket reads: once buffered data passes the high watermark the producer's
//! `writable()` future parks until the consumer drains below the low
//! watermark.
//!
//! Cancellation is a single call on the stream; after it the writer only
//! ever observes errors, so a decoder can never push bytes into a dead
//! request.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::poll_fn,
    rc::Rc,
    task::{Poll, Waker},
};

use bytes::Bytes;
use http::HeaderMap;

pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
pub const DEFAULT_LOW_WATERMARK: usize = 16 * 1024;

/// Terminal causes for a request stream.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("request body exceeds the configured length limit")]
    ContentTooLarge,
    #[error("request stream cancelled")]
    Cancelled,
    #[error("peer closed before the message completed")]
    Incomplete,
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

/// How a body intends to produce data; mirrors the encoder's three framing
/// strategies (no body, single buffer, chunk stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHint {
    None,
    Fixed,
    Stream,
}

/// Identity of a decoded request on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMeta {
    /// Monotonic per-connection request id, starting at 1.
    pub id: u32,
    /// HTTP/2 stream id; always 1 for HTTP/1 requests.
    pub stream_id: u32,
}

struct Channel {
    queue: VecDeque<Bytes>,
    buffered: usize,
    transferred: u64,
    max_length: usize,
    high: usize,
    low: usize,
    ended: bool,
    failed: Option<BodyError>,
    trailers: Option<HeaderMap>,
    reader_gone: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Channel {
    fn wake_reader(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// Producer half, held by the decoder (or its body pump).
pub struct BodyWriter {
    ch: Rc<RefCell<Channel>>,
}

/// Consumer half, embedded in the decoded request handed to services.
pub struct BodyStream {
    ch: Rc<RefCell<Channel>>,
    meta: StreamMeta,
}

/// Shared view of the channel's flow-control state.
///
/// Cloned freely; the dispatch layer uses it to install the per-service
/// request length limit once the route is known.
#[derive(Clone)]
pub struct InboundTrafficController {
    ch: Rc<RefCell<Channel>>,
}

/// Create a request stream with default watermarks.
pub fn body_channel(meta: StreamMeta, max_length: usize) -> (BodyWriter, BodyStream) {
    body_channel_with_watermarks(meta, max_length, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
}

pub fn body_channel_with_watermarks(
    meta: StreamMeta,
    max_length: usize,
    high: usize,
    low: usize,
) -> (BodyWriter, BodyStream) {
    debug_assert!(low <= high);
    let ch = Rc::new(RefCell::new(Channel {
        queue: VecDeque::new(),
        buffered: 0,
        transferred: 0,
        max_length,
        high,
        low,
        ended: false,
        failed: None,
        trailers: None,
        reader_gone: false,
        read_waker: None,
        write_waker: None,
    }));
    (
        BodyWriter { ch: ch.clone() },
        BodyStream { ch, meta },
    )
}

impl BodyWriter {
    /// Resolves once buffered data is below the high watermark, or fails
    /// when the stream can no longer accept data. Await this before reading
    /// the next chunk off the wire.
    pub async fn writable(&mut self) -> Result<(), BodyError> {
        poll_fn(|cx| {
            let mut ch = self.ch.borrow_mut();
            if let Some(err) = &ch.failed {
                return Poll::Ready(Err(err.clone()));
            }
            if ch.reader_gone {
                return Poll::Ready(Err(BodyError::Cancelled));
            }
            if ch.buffered < ch.high {
                return Poll::Ready(Ok(()));
            }
            ch.write_waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Push one chunk. Accounts the chunk against the stream's length limit;
    /// on overflow the stream is failed with [`BodyError::ContentTooLarge`]
    /// and no part of the chunk is delivered.
    pub fn send(&mut self, data: Bytes) -> Result<(), BodyError> {
        let mut ch = self.ch.borrow_mut();
        if let Some(err) = &ch.failed {
            return Err(err.clone());
        }
        if ch.reader_gone || ch.ended {
            return Err(BodyError::Cancelled);
        }
        let len = data.len();
        if ch.transferred.saturating_add(len as u64) > ch.max_length as u64 {
            ch.failed = Some(BodyError::ContentTooLarge);
            ch.wake_reader();
            return Err(BodyError::ContentTooLarge);
        }
        ch.transferred += len as u64;
        ch.buffered += len;
        ch.queue.push_back(data);
        ch.wake_reader();
        Ok(())
    }

    /// Complete the stream, optionally folding trailers in as the terminal
    /// frame.
    pub fn finish(self, trailers: Option<HeaderMap>) {
        let mut ch = self.ch.borrow_mut();
        if ch.failed.is_none() {
            ch.ended = true;
            ch.trailers = trailers;
        }
        ch.wake_reader();
    }

    /// Fail the stream with a cause. Buffered chunks that arrived before the
    /// failure stay deliverable; the error is observed after them.
    pub fn fail(&mut self, err: BodyError) {
        let mut ch = self.ch.borrow_mut();
        if ch.failed.is_none() && !ch.ended {
            ch.failed = Some(err);
        }
        ch.wake_reader();
    }

    /// True once the consumer dropped the stream; remaining wire bytes can
    /// be discarded instead of delivered.
    pub fn is_cancelled(&self) -> bool {
        let ch = self.ch.borrow();
        ch.reader_gone || ch.failed.is_some()
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        let mut ch = self.ch.borrow_mut();
        if !ch.ended && ch.failed.is_none() {
            ch.failed = Some(BodyError::Incomplete);
        }
        ch.wake_reader();
    }
}

impl BodyStream {
    /// Pull the next chunk. `None` means the message completed; an error is
    /// terminal and delivered exactly once.
    pub async fn next_data(&mut self) -> Option<Result<Bytes, BodyError>> {
        poll_fn(|cx| {
            let mut ch = self.ch.borrow_mut();
            if let Some(data) = ch.queue.pop_front() {
                ch.buffered -= data.len();
                if ch.buffered <= ch.low {
                    ch.wake_writer();
                }
                return Poll::Ready(Some(Ok(data)));
            }
            if let Some(err) = ch.failed.take() {
                ch.ended = true;
                return Poll::Ready(Some(Err(err)));
            }
            if ch.ended {
                return Poll::Ready(None);
            }
            ch.read_waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Trailers folded into the stream, available after `next_data`
    /// returned `None`.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.ch.borrow_mut().trailers.take()
    }

    /// Abort the stream. The producer observes the cancellation on its next
    /// operation and must stop writing.
    pub fn cancel(&mut self) {
        let mut ch = self.ch.borrow_mut();
        if !ch.ended && ch.failed.is_none() {
            ch.failed = Some(BodyError::Cancelled);
        }
        ch.wake_writer();
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.ch.borrow().transferred
    }

    pub fn meta(&self) -> StreamMeta {
        self.meta
    }

    pub fn controller(&self) -> InboundTrafficController {
        InboundTrafficController {
            ch: self.ch.clone(),
        }
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        let mut ch = self.ch.borrow_mut();
        ch.reader_gone = true;
        ch.wake_writer();
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ch = self.ch.borrow();
        f.debug_struct("BodyStream")
            .field("meta", &self.meta)
            .field("buffered", &ch.buffered)
            .field("transferred", &ch.transferred)
            .field("ended", &ch.ended)
            .finish()
    }
}

impl InboundTrafficController {
    /// Replace the length limit, e.g. with the matched service's
    /// `max_request_length`. Bytes already transferred are re-checked.
    pub fn set_max_length(&self, max_length: usize) {
        let mut ch = self.ch.borrow_mut();
        ch.max_length = max_length;
        if ch.transferred > max_length as u64 && ch.failed.is_none() && !ch.ended {
            ch.failed = Some(BodyError::ContentTooLarge);
            ch.wake_reader();
            ch.wake_writer();
        }
    }

    /// Abort the stream from the dispatch side (e.g. request timeout).
    pub fn cancel(&self) {
        let mut ch = self.ch.borrow_mut();
        if !ch.ended && ch.failed.is_none() {
            ch.failed = Some(BodyError::Cancelled);
        }
        ch.wake_reader();
        ch.wake_writer();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.ch.borrow().buffered
    }

    /// Whether reads are currently suspended by the high watermark.
    pub fn is_suspended(&self) -> bool {
        let ch = self.ch.borrow();
        ch.buffered >= ch.high
    }
}

/// A request or response payload.
pub enum HttpBody {
    Empty,
    Full(Bytes),
    Streamed(BodyStream),
}

impl HttpBody {
    pub const fn empty() -> Self {
        HttpBody::Empty
    }

    pub fn full(data: Bytes) -> Self {
        if data.is_empty() {
            HttpBody::Empty
        } else {
            HttpBody::Full(data)
        }
    }

    pub fn streamed(stream: BodyStream) -> Self {
        HttpBody::Streamed(stream)
    }

    pub fn stream_hint(&self) -> StreamHint {
        match self {
            HttpBody::Empty => StreamHint::None,
            HttpBody::Full(_) => StreamHint::Fixed,
            HttpBody::Streamed(_) => StreamHint::Stream,
        }
    }

    /// Known size of the payload, if any.
    pub fn content_length(&self) -> Option<usize> {
        match self {
            HttpBody::Empty => Some(0),
            HttpBody::Full(data) => Some(data.len()),
            HttpBody::Streamed(_) => None,
        }
    }

    pub async fn next_data(&mut self) -> Option<Result<Bytes, BodyError>> {
        match self {
            HttpBody::Empty => None,
            HttpBody::Full(_) => match std::mem::replace(self, HttpBody::Empty) {
                HttpBody::Full(data) => Some(Ok(data)),
                _ => unreachable!(),
            },
            HttpBody::Streamed(stream) => stream.next_data().await,
        }
    }

    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        match self {
            HttpBody::Streamed(stream) => stream.take_trailers(),
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        if let HttpBody::Streamed(stream) = self {
            stream.cancel();
        }
    }
}

impl fmt::Debug for HttpBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpBody::Empty => f.write_str("HttpBody::Empty"),
            HttpBody::Full(data) => write!(f, "HttpBody::Full({} bytes)", data.len()),
            HttpBody::Streamed(s) => write!(f, "HttpBody::Streamed({s:?})"),
        }
    }
}

impl From<Bytes> for HttpBody {
    fn from(data: Bytes) -> Self {
        HttpBody::full(data)
    }
}

impl From<&'static str> for HttpBody {
    fn from(data: &'static str) -> Self {
        HttpBody::full(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for HttpBody {
    fn from(data: String) -> Self {
        HttpBody::full(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> StreamMeta {
        StreamMeta { id: 1, stream_id: 1 }
    }

    #[monoio::test]
    async fn test_send_and_receive() {
        let (mut tx, mut rx) = body_channel(meta(), 1024);
        tx.send(Bytes::from_static(b"hello ")).unwrap();
        tx.send(Bytes::from_static(b"world")).unwrap();
        tx.finish(None);

        assert_eq!(rx.next_data().await.unwrap().unwrap(), "hello ");
        assert_eq!(rx.next_data().await.unwrap().unwrap(), "world");
        assert!(rx.next_data().await.is_none());
        assert_eq!(rx.transferred_bytes(), 11);
    }

    #[monoio::test]
    async fn test_length_limit_is_enforced() {
        let (mut tx, mut rx) = body_channel(meta(), 8);
        tx.send(Bytes::from_static(b"12345678")).unwrap();
        assert_eq!(
            tx.send(Bytes::from_static(b"9")),
            Err(BodyError::ContentTooLarge)
        );

        // Bytes accepted before the overflow are still delivered.
        assert_eq!(rx.next_data().await.unwrap().unwrap(), "12345678");
        assert_eq!(
            rx.next_data().await.unwrap().unwrap_err(),
            BodyError::ContentTooLarge
        );
        assert!(rx.next_data().await.is_none());
    }

    #[monoio::test]
    async fn test_watermark_pause_resume() {
        let (mut tx, mut rx) = body_channel_with_watermarks(meta(), 1024, 8, 4);
        tx.send(Bytes::from_static(b"aaaaaaaa")).unwrap();

        {
            let fut = tx.writable();
            futures::pin_mut!(fut);
            assert!(futures::poll!(fut.as_mut()).is_pending());
        }
        assert!(rx.controller().is_suspended());

        // Draining below the low watermark resumes the producer.
        assert_eq!(rx.next_data().await.unwrap().unwrap().len(), 8);
        assert!(!rx.controller().is_suspended());
        tx.writable().await.unwrap();
    }

    #[monoio::test]
    async fn test_cancel_stops_writer() {
        let (mut tx, mut rx) = body_channel(meta(), 1024);
        rx.cancel();
        assert!(tx.send(Bytes::from_static(b"x")).is_err());
        assert!(tx.writable().await.is_err());
    }

    #[monoio::test]
    async fn test_dropped_writer_marks_incomplete() {
        let (tx, mut rx) = body_channel(meta(), 1024);
        drop(tx);
        assert_eq!(
            rx.next_data().await.unwrap().unwrap_err(),
            BodyError::Incomplete
        );
    }

    #[monoio::test]
    async fn test_trailers_are_folded_in() {
        let (mut tx, mut rx) = body_channel(meta(), 1024);
        tx.send(Bytes::from_static(b"data")).unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc".parse().unwrap());
        tx.finish(Some(trailers));

        assert_eq!(rx.next_data().await.unwrap().unwrap(), "data");
        assert!(rx.next_data().await.is_none());
        assert_eq!(rx.take_trailers().unwrap()["x-checksum"], "abc");
    }

    #[monoio::test]
    async fn test_tightened_limit_applies_retroactively() {
        let (mut tx, mut rx) = body_channel(meta(), 1024);
        tx.send(Bytes::from_static(b"0123456789")).unwrap();
        rx.controller().set_max_length(4);
        assert!(tx.send(Bytes::from_static(b"x")).is_err());
        assert_eq!(rx.next_data().await.unwrap().unwrap(), "0123456789");
        assert_eq!(
            rx.next_data().await.unwrap().unwrap_err(),
            BodyError::ContentTooLarge
        );
    }
}
