//! HTTP/1.1 wire handling: the request decoder and response encoder.

pub mod decoder;
pub mod encoder;

pub use decoder::{BodyKind, DecodeError, H1Frame, RequestDecoder, RequestHead, UpgradeKind};
pub use encoder::{ResponseEncoder, ResponseMeta};
