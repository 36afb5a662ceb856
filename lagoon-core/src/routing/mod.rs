//! The request routing subsystem.
//!
//! Routes compose a path pattern with a method set, media-type sets and
//! header/query predicates. Registered routes are grouped into a compressed
//! trie where their patterns allow it and a sequential list otherwise; the
//! composite [`Router`] consults the groups in registration order and picks
//! the best-scoring match. A [`CachedRouter`] memoizes lookups keyed by the
//! per-request [`RoutingContext`], and [`VirtualHost`]s scope the whole
//! machinery per hostname pattern.

mod cache;
mod context;
mod media;
mod pattern;
mod predicate;
mod result;
mod route;
mod router;
mod trie;
mod virtual_host;

pub use cache::CachedRouter;
pub use context::{
    QueryParams, RoutingCacheKey, RoutingContext, RoutingStatus, SessionProtocol,
};
pub use media::{parse_accept, parse_content_type, AcceptItem, Negotiated};
pub use pattern::{GlobPattern, ParameterizedPattern, PathParams, PathPattern, PatternError, RegexPattern};
pub use predicate::{Predicate, PredicateError};
pub use result::{MatchScore, RoutingResult};
pub use route::{Route, RouteBuilder, RouteError};
pub use router::{RouteEntry, Routed, Router};
pub use trie::{RoutingTrie, RoutingTrieBuilder, TrieError};
pub use virtual_host::{
    default_fallback_config, DeferredStatus, HostnamePattern, ServiceConfig, VirtualHost,
    VirtualHostBuilder, VirtualHosts, VirtualHostsBuilder,
};
