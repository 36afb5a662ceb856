#![feature(impl_trait_in_assoc_type)]

#[macro_use]
mod error;
pub use error::{AnyError, AnyResult};

pub mod config;
pub mod context;
pub mod http;
pub mod routing;
