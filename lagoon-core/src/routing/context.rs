//! The per-request routing context.
//!
//! Built once by the decoder and immutable afterwards, except for the
//! deferred-status slot: a route that matches the path but fails a
//! secondary criterion (method, media type) records the best-explaining
//! 4xx there, and the fallback service surfaces it when nothing matched.
//!
//! Equality for caching purposes covers only (hostname, method, path,
//! content type, sorted accept list); see [`RoutingContext::cache_key`].

use std::cell::{OnceCell, RefCell};

use http::{HeaderMap, Method};
use mime::Mime;
use percent_encoding::percent_decode_str;

use crate::http::HttpStatusError;

use super::media::{self, AcceptItem};

/// Wire protocol the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProtocol {
    Http1,
    Http2,
}

/// Routing disposition derived from the request shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStatus {
    Normal,
    CorsPreflight,
}

/// Decoded query parameters, preserving order and duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn parse(query: &str) -> Self {
        let mut pairs = Vec::new();
        for part in query.split('&') {
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((n, v)) => (n, v),
                None => (part, ""),
            };
            pairs.push((decode_component(name), decode_component(value)));
        }
        Self(pairs)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or(plus_decoded)
}

/// Immutable per-request key for router lookup and caching.
#[derive(Debug)]
pub struct RoutingContext {
    hostname: String,
    method: Method,
    path: String,
    query: Option<String>,
    content_type: Option<Mime>,
    accept: Vec<AcceptItem>,
    headers: HeaderMap,
    protocol: SessionProtocol,
    status: RoutingStatus,
    websocket_upgrade: bool,
    query_params: OnceCell<QueryParams>,
    deferred: RefCell<Option<HttpStatusError>>,
}

impl RoutingContext {
    /// Build a context from decoded request parts. `path_and_query` is the
    /// raw request target (origin form).
    pub fn new(
        hostname: impl Into<String>,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        protocol: SessionProtocol,
    ) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        let content_type = media::parse_content_type(&headers);
        let accept = media::parse_accept(&headers);
        let status = if is_cors_preflight(&method, &headers) {
            RoutingStatus::CorsPreflight
        } else {
            RoutingStatus::Normal
        };
        let websocket_upgrade = is_websocket_upgrade(&method, &headers);
        Self {
            hostname: hostname.into(),
            method,
            path,
            query,
            content_type,
            accept,
            headers,
            protocol,
            status,
            websocket_upgrade,
            query_params: OnceCell::new(),
            deferred: RefCell::new(None),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    /// Accept list sorted by (q desc, fewer wildcards first, name).
    pub fn accept_types(&self) -> &[AcceptItem] {
        &self.accept
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.protocol
    }

    pub fn status(&self) -> RoutingStatus {
        self.status
    }

    pub fn is_cors_preflight(&self) -> bool {
        self.status == RoutingStatus::CorsPreflight
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.websocket_upgrade
    }

    /// Record a decoder-detected WebSocket upgrade. Needed because the
    /// decoder strips `Connection`/`Upgrade` before the context sees the
    /// headers.
    pub fn mark_websocket_upgrade(&mut self) {
        self.websocket_upgrade = true;
    }

    /// Query parameters, decoded on first use.
    pub fn query_params(&self) -> &QueryParams {
        self.query_params.get_or_init(|| {
            self.query
                .as_deref()
                .map(QueryParams::parse)
                .unwrap_or_default()
        })
    }

    /// Record a deferred status; the most recent one wins.
    pub fn defer_status(&self, err: HttpStatusError) {
        *self.deferred.borrow_mut() = Some(err);
    }

    pub fn deferred_status(&self) -> Option<HttpStatusError> {
        self.deferred.borrow().clone()
    }

    pub fn take_deferred_status(&self) -> Option<HttpStatusError> {
        self.deferred.borrow_mut().take()
    }

    /// Copy a deferral produced while probing with a rewritten context
    /// (e.g. the HEAD→GET retry) back onto this one.
    pub fn absorb_deferred(&self, other: &RoutingContext) {
        if let Some(err) = other.deferred_status() {
            self.defer_status(err);
        }
    }

    /// A copy of this context with a different method, used for the
    /// HEAD→GET retry. The deferred slot starts empty.
    pub fn with_method(&self, method: Method) -> Self {
        Self {
            hostname: self.hostname.clone(),
            method,
            path: self.path.clone(),
            query: self.query.clone(),
            content_type: self.content_type.clone(),
            accept: self.accept.clone(),
            headers: self.headers.clone(),
            protocol: self.protocol,
            status: self.status,
            websocket_upgrade: self.websocket_upgrade,
            query_params: OnceCell::new(),
            deferred: RefCell::new(None),
        }
    }

    /// The canonical cache key: method, path, content type and accept list.
    /// Unrelated headers do not participate, so requests differing only in
    /// e.g. `User-Agent` share an entry.
    pub fn cache_key(&self) -> RoutingCacheKey {
        let mut accept = String::new();
        for item in &self.accept {
            if !accept.is_empty() {
                accept.push(',');
            }
            accept.push_str(item.media_type.as_ref());
            accept.push_str(";q=");
            accept.push_str(&format!("{:.3}", item.q));
        }
        RoutingCacheKey {
            hostname: self.hostname.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            content_type: self
                .content_type
                .as_ref()
                .map(|m| m.as_ref().to_string()),
            accept,
        }
    }
}

fn is_cors_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS
        && headers.contains_key(http::header::ORIGIN)
        && headers.contains_key(http::header::ACCESS_CONTROL_REQUEST_METHOD)
}

fn is_websocket_upgrade(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::GET
        && headers
            .get(http::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
}

/// Owned projection of the context fields that participate in equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingCacheKey {
    hostname: String,
    method: Method,
    path: String,
    content_type: Option<String>,
    accept: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(method: Method, target: &str, headers: HeaderMap) -> RoutingContext {
        RoutingContext::new("example.com", method, target, headers, SessionProtocol::Http1)
    }

    #[test]
    fn test_path_query_split() {
        let c = ctx(Method::GET, "/a/b?x=1&y=%20z", HeaderMap::new());
        assert_eq!(c.path(), "/a/b");
        assert_eq!(c.query(), Some("x=1&y=%20z"));
        assert_eq!(c.query_params().get("x"), Some("1"));
        assert_eq!(c.query_params().get("y"), Some(" z"));
    }

    #[test]
    fn test_cache_key_ignores_unrelated_headers() {
        let mut h1 = HeaderMap::new();
        h1.insert(http::header::USER_AGENT, "alpha".parse().unwrap());
        let mut h2 = HeaderMap::new();
        h2.insert(http::header::USER_AGENT, "beta".parse().unwrap());
        let k1 = ctx(Method::GET, "/a", h1).cache_key();
        let k2 = ctx(Method::GET, "/a", h2).cache_key();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_cache_key_depends_on_canonical_fields() {
        let mut h = HeaderMap::new();
        h.insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        let with_ct = ctx(Method::POST, "/a", h).cache_key();
        let without_ct = ctx(Method::POST, "/a", HeaderMap::new()).cache_key();
        assert_ne!(with_ct, without_ct);
        assert_ne!(
            ctx(Method::GET, "/a", HeaderMap::new()).cache_key(),
            ctx(Method::HEAD, "/a", HeaderMap::new()).cache_key()
        );
    }

    #[test]
    fn test_deferred_status_most_recent_wins() {
        let c = ctx(Method::GET, "/a", HeaderMap::new());
        c.defer_status(HttpStatusError::of(http::StatusCode::METHOD_NOT_ALLOWED));
        c.defer_status(HttpStatusError::of(http::StatusCode::NOT_ACCEPTABLE));
        assert_eq!(
            c.take_deferred_status().unwrap().status,
            http::StatusCode::NOT_ACCEPTABLE
        );
        assert!(c.deferred_status().is_none());
    }

    #[test]
    fn test_cors_preflight_detection() {
        let mut h = HeaderMap::new();
        h.insert(http::header::ORIGIN, "https://a.example".parse().unwrap());
        h.insert(
            http::header::ACCESS_CONTROL_REQUEST_METHOD,
            "POST".parse().unwrap(),
        );
        let c = ctx(Method::OPTIONS, "/a", h);
        assert!(c.is_cors_preflight());
        assert!(!ctx(Method::OPTIONS, "/a", HeaderMap::new()).is_cors_preflight());
    }
}
