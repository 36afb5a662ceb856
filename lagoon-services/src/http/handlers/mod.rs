//! Request handlers composing the per-connection processing chain.
mod connection;
mod dispatch;

pub use connection::{ConnectionReuseHandler, PeerKeepalive};
pub use dispatch::{Dispatcher, DispatcherFactory};
