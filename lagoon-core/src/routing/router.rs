//! The composite router.
//!
//! Registration order is preserved by splitting the route list into
//! contiguous groups: runs of trie-compatible patterns become a
//! [`RoutingTrie`] keyed by their skeletons, everything else a sequential
//! scan. `find` consults the groups in order and applies the scoring rules:
//! a `High` candidate short-circuits, otherwise the best score wins with
//! earlier registration breaking ties.

use tracing::debug;

use super::{
    context::RoutingContext,
    result::{MatchScore, RoutingResult},
    route::Route,
    trie::{RoutingTrie, RoutingTrieBuilder, TrieError},
};

/// One registered (route, value) pair. The index is the registration
/// position, which doubles as the cache token.
pub struct RouteEntry<V> {
    pub route: Route,
    pub value: V,
}

/// A route resolved for one request.
pub struct Routed<'a, V> {
    pub index: usize,
    pub route: &'a Route,
    pub value: &'a V,
    pub result: RoutingResult,
    /// True when this is the virtual host's fallback, not a real match.
    pub fallback: bool,
}

enum RouterGroup {
    Trie(RoutingTrie<usize>),
    Sequential(Vec<usize>),
}

pub struct Router<V> {
    entries: Vec<RouteEntry<V>>,
    groups: Vec<RouterGroup>,
}

impl<V> Router<V> {
    /// Build from routes in registration order.
    pub fn build(routes: Vec<(Route, V)>) -> Result<Self, TrieError> {
        let entries: Vec<RouteEntry<V>> = routes
            .into_iter()
            .map(|(route, value)| RouteEntry { route, value })
            .collect();

        let complexities: Vec<u32> = entries
            .iter()
            .map(|e| e.route.pattern().complexity())
            .collect();

        let mut groups = Vec::new();
        let mut trie_run: Vec<(String, usize)> = Vec::new();
        let mut seq_run: Vec<usize> = Vec::new();

        for (idx, entry) in entries.iter().enumerate() {
            match entry.route.pattern().trie_path() {
                Some(trie_path) => {
                    if !seq_run.is_empty() {
                        groups.push(RouterGroup::Sequential(std::mem::take(&mut seq_run)));
                    }
                    trie_run.push((trie_path, idx));
                }
                None => {
                    if !trie_run.is_empty() {
                        groups.push(build_trie_group(
                            std::mem::take(&mut trie_run),
                            &complexities,
                        )?);
                    }
                    seq_run.push(idx);
                }
            }
        }
        if !trie_run.is_empty() {
            groups.push(build_trie_group(trie_run, &complexities)?);
        }
        if !seq_run.is_empty() {
            groups.push(RouterGroup::Sequential(seq_run));
        }

        debug!(
            routes = entries.len(),
            groups = groups.len(),
            "router built"
        );
        Ok(Self { entries, groups })
    }

    pub fn entry(&self, index: usize) -> &RouteEntry<V> {
        &self.entries[index]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the best route for the context, or record the best-explaining
    /// deferral on it and return `None`.
    pub fn find(&self, ctx: &RoutingContext) -> Option<Routed<'_, V>> {
        for group in &self.groups {
            let found = match group {
                RouterGroup::Trie(trie) => {
                    self.finds_best(trie.find(ctx.path()).into_iter().copied(), ctx)
                }
                RouterGroup::Sequential(indices) => {
                    self.finds_best(indices.iter().copied(), ctx)
                }
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Every matching route in priority order; used by decorator routing.
    pub fn find_all(&self, ctx: &RoutingContext) -> Vec<Routed<'_, V>> {
        let mut out = Vec::new();
        for group in &self.groups {
            match group {
                RouterGroup::Trie(trie) => {
                    for &idx in trie.find(ctx.path()) {
                        if let Some(routed) = self.apply_entry(idx, ctx) {
                            out.push(routed);
                        }
                    }
                }
                RouterGroup::Sequential(indices) => {
                    for &idx in indices {
                        if let Some(routed) = self.apply_entry(idx, ctx) {
                            out.push(routed);
                        }
                    }
                }
            }
        }
        out
    }

    fn apply_entry(&self, index: usize, ctx: &RoutingContext) -> Option<Routed<'_, V>> {
        let entry = &self.entries[index];
        entry.route.apply(ctx).map(|result| Routed {
            index,
            route: &entry.route,
            value: &entry.value,
            result,
            fallback: false,
        })
    }

    /// Scoring fold over candidates in priority order: `High` stops the
    /// scan; otherwise the best score wins and the earliest candidate
    /// breaks ties.
    fn finds_best(
        &self,
        candidates: impl Iterator<Item = usize>,
        ctx: &RoutingContext,
    ) -> Option<Routed<'_, V>> {
        let mut best: Option<Routed<'_, V>> = None;
        for idx in candidates {
            if let Some(routed) = self.apply_entry(idx, ctx) {
                if routed.result.score == MatchScore::High {
                    return Some(routed);
                }
                let better = match &best {
                    Some(current) => routed.result.score > current.result.score,
                    None => true,
                };
                if better {
                    best = Some(routed);
                }
            }
        }
        best
    }
}

fn build_trie_group(
    run: Vec<(String, usize)>,
    complexities: &[u32],
) -> Result<RouterGroup, TrieError> {
    let mut builder = RoutingTrieBuilder::new();
    for (path, idx) in run {
        builder.add(path, idx);
    }
    let weights = complexities.to_vec();
    builder.comparator(move |a: &usize, b: &usize| weights[*b].cmp(&weights[*a]));
    Ok(RouterGroup::Trie(builder.build()?))
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method};

    use crate::routing::context::SessionProtocol;

    use super::*;

    fn ctx(method: Method, target: &str) -> RoutingContext {
        RoutingContext::new("h", method, target, HeaderMap::new(), SessionProtocol::Http1)
    }

    fn get_route(pattern: &str) -> Route {
        Route::builder().path(pattern).get().build().unwrap()
    }

    fn router(patterns: &[&str]) -> Router<String> {
        Router::build(
            patterns
                .iter()
                .map(|p| (get_route(p), p.to_string()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_exact_match_beats_parameterized() {
        let r = router(&["/users/:id", "/users/me"]);
        let routed = r.find(&ctx(Method::GET, "/users/me")).unwrap();
        assert_eq!(routed.value, "/users/me");
        assert!(routed.result.path_params.is_empty());
        assert_eq!(routed.result.score, MatchScore::High);

        let routed = r.find(&ctx(Method::GET, "/users/alice")).unwrap();
        assert_eq!(routed.value, "/users/:id");
        assert_eq!(routed.result.param("id"), Some("alice"));
    }

    #[test]
    fn test_groups_preserve_registration_order() {
        // glob routes force a sequential group between two trie runs.
        let r = router(&["/a", "glob:/**/tail", "/b"]);
        assert_eq!(r.find(&ctx(Method::GET, "/a")).unwrap().value, "/a");
        assert_eq!(r.find(&ctx(Method::GET, "/b")).unwrap().value, "/b");
        assert_eq!(
            r.find(&ctx(Method::GET, "/x/tail")).unwrap().value,
            "glob:/**/tail"
        );
        // The earlier glob group wins over the later trie group.
        let r = router(&["glob:/**/b", "/b"]);
        assert_eq!(r.find(&ctx(Method::GET, "/b")).unwrap().value, "glob:/**/b");
    }

    #[test]
    fn test_find_none_reports_deferral() {
        let r = router(&["/a"]);
        let c = ctx(Method::POST, "/a");
        assert!(r.find(&c).is_none());
        assert_eq!(
            c.deferred_status().unwrap().status,
            http::StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_method_fallthrough_within_trie_node_candidates() {
        // The exact route rejects POST; the parameter route accepts it.
        let routes = vec![
            (get_route("/users/me"), "get-me".to_string()),
            (
                Route::builder().path("/users/:id").post().build().unwrap(),
                "post-id".to_string(),
            ),
        ];
        let r = Router::build(routes).unwrap();
        assert_eq!(
            r.find(&ctx(Method::POST, "/users/me")).unwrap().value,
            "post-id"
        );
    }

    #[test]
    fn test_ties_resolved_by_registration_order() {
        let routes = vec![
            (get_route("/dup"), "first".to_string()),
            (get_route("/dup"), "second".to_string()),
        ];
        let r = Router::build(routes).unwrap();
        assert_eq!(r.find(&ctx(Method::GET, "/dup")).unwrap().value, "first");
    }

    #[test]
    fn test_find_all_returns_priority_order() {
        let r = router(&["/users/me", "/users/:id", "prefix:/users/"]);
        let all = r.find_all(&ctx(Method::GET, "/users/me"));
        let values: Vec<_> = all.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, ["/users/me", "/users/:id", "prefix:/users/"]);
    }

    #[test]
    fn test_find_agrees_with_apply() {
        // No false positives or negatives against a brute-force scan.
        let patterns = ["/a", "/a/:x", "/a/b", "glob:/**/z", "prefix:/p/"];
        let r = router(&patterns);
        for path in ["/a", "/a/b", "/a/q", "/q/z", "/p/x/y", "/nope"] {
            let c = ctx(Method::GET, path);
            let brute = patterns.iter().any(|p| {
                get_route(p).apply(&ctx(Method::GET, path)).is_some()
            });
            assert_eq!(r.find(&c).is_some(), brute, "path {path}");
        }
    }
}
