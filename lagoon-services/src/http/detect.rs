//! HTTP/2 prior-knowledge detection.
//!
//! Sniffs the start of an accepted connection for the HTTP/2 client
//! preface and forwards `(is_h2, io, ctx)` to the inner service, with the
//! sniffed bytes replayed through a `PrefixedReadIo`. Each read is
//! classified against the preface and the connection is released to the
//! HTTP/1 path at the first divergent byte, so a short request line is
//! never held hostage waiting for preface-length input.

use std::io::Cursor;

use bytes::BytesMut;
use monoio::io::{AsyncReadRent, PrefixedReadIo};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Service,
};

const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// What the bytes sniffed so far say about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    /// The complete client preface arrived.
    Http2Preface,
    /// Diverged from the preface, or the peer closed before completing it.
    NotPreface,
    /// Still a strict prefix of the preface.
    Undecided,
}

fn classify(sniffed: &[u8]) -> Sniff {
    if sniffed.len() >= PREFACE.len() {
        if sniffed[..PREFACE.len()] == PREFACE[..] {
            Sniff::Http2Preface
        } else {
            Sniff::NotPreface
        }
    } else if PREFACE.starts_with(sniffed) {
        Sniff::Undecided
    } else {
        Sniff::NotPreface
    }
}

#[derive(Clone)]
pub struct H2Detect<T> {
    inner: T,
}

impl<T> H2Detect<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum H2DetectError<E> {
    #[error("inner error: {0:?}")]
    Inner(E),
    #[error("io error: {0:?}")]
    Io(std::io::Error),
}

impl<T, S, CX> Service<(S, CX)> for H2Detect<T>
where
    S: AsyncReadRent,
    T: Service<(bool, PrefixedReadIo<S, Cursor<Vec<u8>>>, CX)>,
{
    type Response = T::Response;
    type Error = H2DetectError<T::Error>;

    async fn call(&self, (mut io, cx): (S, CX)) -> Result<Self::Response, Self::Error> {
        let mut sniffed = BytesMut::with_capacity(PREFACE.len());
        let verdict = loop {
            // Never ask for more than the preface; whatever arrives is
            // replayed to the next stage either way.
            let buf = BytesMut::with_capacity(PREFACE.len() - sniffed.len());
            let (res, buf) = io.read(buf).await;
            let n = res.map_err(H2DetectError::Io)?;
            if n == 0 {
                break Sniff::NotPreface;
            }
            sniffed.extend_from_slice(&buf[..n]);
            match classify(&sniffed) {
                Sniff::Undecided => continue,
                decided => break decided,
            }
        };
        let io = PrefixedReadIo::new(io, Cursor::new(sniffed.to_vec()));
        self.inner
            .call((verdict == Sniff::Http2Preface, io, cx))
            .await
            .map_err(H2DetectError::Inner)
    }
}

impl<F: MakeService> MakeService for H2Detect<F> {
    type Service = H2Detect<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(H2Detect {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for H2Detect<F> {
    type Service = H2Detect<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(H2Detect {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

impl<F> H2Detect<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| H2Detect { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_progression() {
        assert_eq!(classify(b""), Sniff::Undecided);
        assert_eq!(classify(b"PRI * HT"), Sniff::Undecided);
        assert_eq!(classify(&PREFACE[..23]), Sniff::Undecided);
        assert_eq!(classify(PREFACE), Sniff::Http2Preface);
    }

    #[test]
    fn test_classify_rejects_divergence_immediately() {
        // An HTTP/1 request line diverges on the first byte.
        assert_eq!(classify(b"G"), Sniff::NotPreface);
        assert_eq!(classify(b"GET / HTTP/1.1\r\n"), Sniff::NotPreface);
        // Same length as the preface but different content.
        assert_eq!(classify(b"PRI * HTTP/2.0\r\n\r\nXX\r\n\r\n"), Sniff::NotPreface);
    }
}
