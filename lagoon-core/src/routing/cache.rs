//! A sized cache in front of the router.
//!
//! Keys are the context's canonical projection ([`RoutingCacheKey`]); the
//! cached value is the matched entry's registration index, never the
//! `RoutingResult` (which depends on per-request path params). A hit
//! re-applies the stored route to the live context to recompute them.
//! Routes with dynamic predicates never enter the cache, and the bound
//! service gets a veto per path through the write filter. A second cache
//! serves `find_all`, whose results feed decorator routing.

use std::{
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use moka::sync::Cache;

use super::{
    context::{RoutingCacheKey, RoutingContext},
    router::{RouteEntry, Routed, Router},
};

pub const DEFAULT_CACHE_CAPACITY: u64 = 8192;

type WriteFilter<V> = Rc<dyn Fn(&RoutingContext, &RouteEntry<V>) -> bool>;

pub struct CachedRouter<V> {
    inner: Router<V>,
    find_cache: Cache<RoutingCacheKey, usize>,
    find_all_cache: Cache<RoutingCacheKey, Arc<[usize]>>,
    write_filter: Option<WriteFilter<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> CachedRouter<V> {
    pub fn new(inner: Router<V>, capacity: u64) -> Self {
        Self {
            inner,
            find_cache: Cache::new(capacity),
            find_all_cache: Cache::new(capacity),
            write_filter: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Install a per-write veto, e.g. the bound service's
    /// `should_cache_path`.
    pub fn with_write_filter(
        mut self,
        filter: impl Fn(&RoutingContext, &RouteEntry<V>) -> bool + 'static,
    ) -> Self {
        self.write_filter = Some(Rc::new(filter));
        self
    }

    pub fn inner(&self) -> &Router<V> {
        &self.inner
    }

    pub fn find(&self, ctx: &RoutingContext) -> Option<Routed<'_, V>> {
        let key = ctx.cache_key();
        if let Some(index) = self.find_cache.get(&key) {
            let entry = self.inner.entry(index);
            if let Some(result) = entry.route.apply(ctx) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Routed {
                    index,
                    route: &entry.route,
                    value: &entry.value,
                    result,
                    fallback: false,
                });
            }
            // A cached route that no longer applies to an equal key can
            // only mean the entry was stale; drop it and fall through.
            self.find_cache.invalidate(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let routed = self.inner.find(ctx)?;
        if self.may_cache(ctx, routed.index) {
            self.find_cache.insert(key, routed.index);
        }
        Some(routed)
    }

    pub fn find_all(&self, ctx: &RoutingContext) -> Vec<Routed<'_, V>> {
        let key = ctx.cache_key();
        if let Some(indices) = self.find_all_cache.get(&key) {
            let mut out = Vec::with_capacity(indices.len());
            let mut stale = false;
            for &index in indices.iter() {
                let entry = self.inner.entry(index);
                match entry.route.apply(ctx) {
                    Some(result) => out.push(Routed {
                        index,
                        route: &entry.route,
                        value: &entry.value,
                        result,
                        fallback: false,
                    }),
                    None => {
                        stale = true;
                        break;
                    }
                }
            }
            if !stale {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return out;
            }
            self.find_all_cache.invalidate(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let all = self.inner.find_all(ctx);
        if !all.is_empty() && all.iter().all(|r| self.may_cache(ctx, r.index)) {
            let indices: Arc<[usize]> = all.iter().map(|r| r.index).collect();
            self.find_all_cache.insert(key, indices);
        }
        all
    }

    fn may_cache(&self, ctx: &RoutingContext, index: usize) -> bool {
        let entry = self.inner.entry(index);
        entry.route.is_cacheable()
            && self
                .write_filter
                .as_ref()
                .map(|f| f(ctx, entry))
                .unwrap_or(true)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u64 {
        self.find_cache.run_pending_tasks();
        self.find_cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method};

    use crate::routing::{context::SessionProtocol, route::Route};

    use super::*;

    fn ctx(method: Method, target: &str, headers: HeaderMap) -> RoutingContext {
        RoutingContext::new("h", method, target, headers, SessionProtocol::Http1)
    }

    fn sample_router() -> Router<String> {
        let routes = vec![
            (
                Route::builder().path("/users/me").get().build().unwrap(),
                "me".to_string(),
            ),
            (
                Route::builder().path("/users/:id").get().build().unwrap(),
                "by-id".to_string(),
            ),
            (
                Route::builder()
                    .path("/flagged")
                    .get()
                    .match_headers("x-flag")
                    .build()
                    .unwrap(),
                "flagged".to_string(),
            ),
        ];
        Router::build(routes).unwrap()
    }

    #[test]
    fn test_cached_results_equal_uncached() {
        let cached = CachedRouter::new(sample_router(), 64);
        let plain = sample_router();
        let targets = ["/users/me", "/users/42", "/users/me", "/other", "/users/42"];
        for target in targets {
            let c1 = ctx(Method::GET, target, HeaderMap::new());
            let c2 = ctx(Method::GET, target, HeaderMap::new());
            let a = cached.find(&c1);
            let b = plain.find(&c2);
            assert_eq!(a.is_some(), b.is_some(), "target {target}");
            if let (Some(a), Some(b)) = (a, b) {
                assert_eq!(a.index, b.index);
                assert_eq!(a.result.path_params, b.result.path_params);
            }
        }
        assert!(cached.hit_count() > 0);
    }

    #[test]
    fn test_hit_recomputes_path_params() {
        let cached = CachedRouter::new(sample_router(), 64);
        // Each concrete path is its own key; params must come from the
        // live context, not the stored entry.
        let c = ctx(Method::GET, "/users/1", HeaderMap::new());
        assert_eq!(cached.find(&c).unwrap().result.param("id"), Some("1"));
        let c = ctx(Method::GET, "/users/2", HeaderMap::new());
        assert_eq!(cached.find(&c).unwrap().result.param("id"), Some("2"));
    }

    #[test]
    fn test_predicated_route_bypasses_cache() {
        let cached = CachedRouter::new(sample_router(), 64);
        let mut headers = HeaderMap::new();
        headers.insert("x-flag", "1".parse().unwrap());
        let c = ctx(Method::GET, "/flagged", headers);
        assert!(cached.find(&c).is_some());
        assert_eq!(cached.entry_count(), 0);

        // Same canonical key without the header must not hit a cached
        // entry and must miss for real.
        let c = ctx(Method::GET, "/flagged", HeaderMap::new());
        assert!(cached.find(&c).is_none());
    }

    #[test]
    fn test_unrelated_headers_share_entry() {
        let cached = CachedRouter::new(sample_router(), 64);
        let mut h1 = HeaderMap::new();
        h1.insert(http::header::USER_AGENT, "alpha".parse().unwrap());
        let mut h2 = HeaderMap::new();
        h2.insert(http::header::USER_AGENT, "beta".parse().unwrap());
        let r1 = cached.find(&ctx(Method::GET, "/users/me", h1)).unwrap().index;
        let r2 = cached.find(&ctx(Method::GET, "/users/me", h2)).unwrap().index;
        assert_eq!(r1, r2);
        assert_eq!(cached.hit_count(), 1);
        assert_eq!(cached.miss_count(), 1);
    }

    #[test]
    fn test_write_filter_vetoes_storage() {
        let cached =
            CachedRouter::new(sample_router(), 64).with_write_filter(|_, _| false);
        let c = ctx(Method::GET, "/users/me", HeaderMap::new());
        assert!(cached.find(&c).is_some());
        assert_eq!(cached.entry_count(), 0);
    }

    #[test]
    fn test_find_all_cached_equivalence() {
        let cached = CachedRouter::new(sample_router(), 64);
        let first = cached
            .find_all(&ctx(Method::GET, "/users/me", HeaderMap::new()))
            .iter()
            .map(|r| r.index)
            .collect::<Vec<_>>();
        let second = cached
            .find_all(&ctx(Method::GET, "/users/me", HeaderMap::new()))
            .iter()
            .map(|r| r.index)
            .collect::<Vec<_>>();
        assert_eq!(first, second);
    }
}
