//! HTTP connection services: decoding, dispatch, lifecycle.
//!
//! - [`core`]: the per-connection drive loops for HTTP/1.1 and HTTP/2.
//! - [`h1`]: the HTTP/1.1 request decoder and response encoder.
//! - [`h2`]: the HTTP/2 frame-adapter.
//! - [`handlers`]: dispatch to virtual hosts and connection-reuse header
//!   handling.
//! - [`keepalive`]: the per-connection timer/phase state machine.
//! - [`detect`]: HTTP/2 prior-knowledge preface detection.

use http::HeaderValue;
use serde::{Deserialize, Serialize};

pub use self::core::{HttpCoreService, HttpServerTimeout};

pub mod core;
pub mod detect;
pub mod h1;
pub mod h2;
pub mod handlers;
pub mod keepalive;
pub mod util;

pub(crate) const CLOSE: &str = "close";
pub(crate) const KEEPALIVE: &str = "Keep-Alive";
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const KEEPALIVE_VALUE: HeaderValue = HeaderValue::from_static(KEEPALIVE);
pub(crate) use util::generate_response;

#[derive(Debug, Copy, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpVersion {
    Http2,
    Http11,
    #[default]
    Auto,
}
