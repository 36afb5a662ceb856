//! Generic services and primitives shared by the protocol stacks.
mod context;
mod drain;

pub use context::{Accepted, ContextService};
pub use drain::{DrainController, DrainWatcher};
