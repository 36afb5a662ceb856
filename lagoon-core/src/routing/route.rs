//! Routes: a path pattern plus the secondary matching criteria.

use std::collections::HashSet;
use std::fmt;

use http::{Method, StatusCode};
use mime::Mime;
use tracing::warn;

use crate::http::HttpStatusError;

use super::{
    context::RoutingContext,
    media,
    pattern::{PathPattern, PatternError},
    predicate::{Predicate, PredicateError},
    result::{MatchScore, RoutingResult},
};

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Predicate(#[from] PredicateError),
    #[error("route must declare at least one method")]
    NoMethods,
    #[error("produces must not contain wildcards: {0}")]
    WildcardProduce(Mime),
}

/// A complete matcher bound to one service: path pattern, method set,
/// consumes/produces media types, and header/query predicates.
#[derive(Debug, Clone)]
pub struct Route {
    pattern: PathPattern,
    methods: HashSet<Method>,
    any_method: bool,
    consumes: Vec<Mime>,
    produces: Vec<Mime>,
    header_preds: Vec<Predicate>,
    param_preds: Vec<Predicate>,
    excludes: Vec<Route>,
}

impl Route {
    pub fn builder() -> RouteBuilder {
        RouteBuilder::default()
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn methods(&self) -> &HashSet<Method> {
        &self.methods
    }

    pub fn consumes(&self) -> &[Mime] {
        &self.consumes
    }

    pub fn produces(&self) -> &[Mime] {
        &self.produces
    }

    /// A route is cacheable iff its outcome depends only on the context's
    /// canonical key, i.e. it has no header/param predicates.
    pub fn is_cacheable(&self) -> bool {
        self.header_preds.is_empty() && self.param_preds.is_empty() && self.excludes.is_empty()
    }

    /// Path-and-method probe without deferral side effects; used for
    /// exclusion checks.
    fn matches_shallow(&self, ctx: &RoutingContext) -> bool {
        (self.any_method || self.methods.contains(ctx.method()))
            && self.pattern.match_path(ctx.path()).is_some()
    }

    /// Match this route against a context.
    ///
    /// The evaluation order and its deferrals: path, then method (405),
    /// then consumes (415), then produces negotiation (406), then
    /// predicates (a soft miss with no deferral so another route may still
    /// match).
    pub fn apply(&self, ctx: &RoutingContext) -> Option<RoutingResult> {
        let path_params = self.pattern.match_path(ctx.path())?;

        if !self.any_method && !self.methods.contains(ctx.method()) {
            ctx.defer_status(HttpStatusError::of(StatusCode::METHOD_NOT_ALLOWED));
            return None;
        }

        let mut media_degraded = false;
        if !self.consumes.is_empty() {
            if let Some(content_type) = ctx.content_type() {
                if !self
                    .consumes
                    .iter()
                    .any(|c| media::media_type_matches(c, content_type))
                {
                    ctx.defer_status(HttpStatusError::of(StatusCode::UNSUPPORTED_MEDIA_TYPE));
                    return None;
                }
            }
        }

        let negotiated_type = if self.produces.is_empty() {
            None
        } else {
            match media::negotiate(&self.produces, ctx.accept_types()) {
                Some(negotiated) => {
                    media_degraded = !negotiated.full_preference;
                    Some(negotiated.media_type)
                }
                None => {
                    ctx.defer_status(HttpStatusError::of(StatusCode::NOT_ACCEPTABLE));
                    return None;
                }
            }
        };

        for pred in &self.header_preds {
            if !pred.eval_headers(ctx.headers()) {
                return None;
            }
        }
        for pred in &self.param_preds {
            if !pred.eval_params(ctx.query_params()) {
                return None;
            }
        }

        if self.excludes.iter().any(|ex| ex.matches_shallow(ctx)) {
            return None;
        }

        let score = match (self.any_method, media_degraded) {
            (false, false) => MatchScore::High,
            (false, true) => MatchScore::Medium,
            (true, false) => MatchScore::Low,
            (true, true) => MatchScore::Lowest,
        };

        Some(RoutingResult {
            path: ctx.path().to_string(),
            query: ctx.query().map(str::to_string),
            path_params,
            negotiated_type,
            score,
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

/// Explicit route registration, replacing any reflective discovery: every
/// binding states its pattern and criteria up front.
#[derive(Debug, Default)]
pub struct RouteBuilder {
    pattern: Option<String>,
    methods: HashSet<Method>,
    any_method: bool,
    consumes: Vec<Mime>,
    produces: Vec<Mime>,
    header_preds: Vec<String>,
    param_preds: Vec<String>,
    excludes: Vec<Route>,
}

impl RouteBuilder {
    pub fn path(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods.extend(methods);
        self
    }

    pub fn method(self, method: Method) -> Self {
        self.methods([method])
    }

    pub fn get(self) -> Self {
        self.method(Method::GET)
    }

    pub fn post(self) -> Self {
        self.method(Method::POST)
    }

    /// Accept every method; such routes match with reduced confidence so
    /// explicitly bound methods win ties.
    pub fn any_method(mut self) -> Self {
        self.any_method = true;
        self
    }

    pub fn consumes(mut self, types: impl IntoIterator<Item = Mime>) -> Self {
        self.consumes.extend(types);
        self
    }

    pub fn produces(mut self, types: impl IntoIterator<Item = Mime>) -> Self {
        self.produces.extend(types);
        self
    }

    pub fn match_headers(mut self, predicate: impl Into<String>) -> Self {
        self.header_preds.push(predicate.into());
        self
    }

    pub fn match_params(mut self, predicate: impl Into<String>) -> Self {
        self.param_preds.push(predicate.into());
        self
    }

    pub fn exclude(mut self, route: Route) -> Self {
        self.excludes.push(route);
        self
    }

    pub fn build(self) -> Result<Route, RouteError> {
        let pattern = PathPattern::parse(self.pattern.as_deref().unwrap_or("/"))?;
        if self.methods.is_empty() && !self.any_method {
            return Err(RouteError::NoMethods);
        }
        for produce in &self.produces {
            if produce.type_() == mime::STAR || produce.subtype() == mime::STAR {
                return Err(RouteError::WildcardProduce(produce.clone()));
            }
        }
        let header_preds = self
            .header_preds
            .iter()
            .map(|p| Predicate::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        let param_preds = self
            .param_preds
            .iter()
            .map(|p| Predicate::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        if !self.excludes.is_empty() {
            warn!(
                pattern = %pattern,
                "route declares exclusions; it will bypass the routing cache"
            );
        }
        Ok(Route {
            pattern,
            methods: self.methods,
            any_method: self.any_method,
            consumes: self.consumes,
            produces: self.produces,
            header_preds,
            param_preds,
            excludes: self.excludes,
        })
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use crate::routing::context::SessionProtocol;

    use super::*;

    fn ctx_with(method: Method, target: &str, headers: HeaderMap) -> RoutingContext {
        RoutingContext::new("h", method, target, headers, SessionProtocol::Http1)
    }

    fn ctx(method: Method, target: &str) -> RoutingContext {
        ctx_with(method, target, HeaderMap::new())
    }

    #[test]
    fn test_method_mismatch_defers_405() {
        let route = Route::builder().path("/a").get().build().unwrap();
        let c = ctx(Method::POST, "/a");
        assert!(route.apply(&c).is_none());
        assert_eq!(
            c.deferred_status().unwrap().status,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_path_mismatch_defers_nothing() {
        let route = Route::builder().path("/a").get().build().unwrap();
        let c = ctx(Method::GET, "/b");
        assert!(route.apply(&c).is_none());
        assert!(c.deferred_status().is_none());
    }

    #[test]
    fn test_consumes_mismatch_defers_415_before_406() {
        let route = Route::builder()
            .path("/upload")
            .post()
            .consumes(["application/json".parse().unwrap()])
            .produces(["application/json".parse::<Mime>().unwrap()])
            .build()
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "application/xml".parse().unwrap());
        headers.insert(http::header::ACCEPT, "text/plain".parse().unwrap());
        let c = ctx_with(Method::POST, "/upload", headers);
        assert!(route.apply(&c).is_none());
        assert_eq!(
            c.deferred_status().unwrap().status,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn test_produces_negotiation_and_score() {
        let route = Route::builder()
            .path("/upload")
            .post()
            .consumes(["application/json".parse().unwrap()])
            .produces([
                "application/json".parse::<Mime>().unwrap(),
                "text/plain; q=0.5".parse().unwrap(),
            ])
            .build()
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(http::header::ACCEPT, "text/plain".parse().unwrap());
        let c = ctx_with(Method::POST, "/upload", headers);
        let result = route.apply(&c).unwrap();
        assert_eq!(result.negotiated_type, Some(mime::TEXT_PLAIN));
        assert_eq!(result.score, MatchScore::Medium);
    }

    #[test]
    fn test_no_acceptable_produce_defers_406() {
        let route = Route::builder()
            .path("/data")
            .get()
            .produces(["application/json".parse::<Mime>().unwrap()])
            .build()
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "text/plain".parse().unwrap());
        let c = ctx_with(Method::GET, "/data", headers);
        assert!(route.apply(&c).is_none());
        assert_eq!(
            c.deferred_status().unwrap().status,
            StatusCode::NOT_ACCEPTABLE
        );
    }

    #[test]
    fn test_predicate_failure_is_soft() {
        let route = Route::builder()
            .path("/a")
            .get()
            .match_headers("x-mode=canary")
            .build()
            .unwrap();
        let c = ctx(Method::GET, "/a");
        assert!(route.apply(&c).is_none());
        assert!(c.deferred_status().is_none());
        assert!(!route.is_cacheable());
    }

    #[test]
    fn test_missing_content_type_passes_consumes() {
        let route = Route::builder()
            .path("/a")
            .post()
            .consumes(["application/json".parse().unwrap()])
            .build()
            .unwrap();
        let c = ctx(Method::POST, "/a");
        let result = route.apply(&c).unwrap();
        assert_eq!(result.score, MatchScore::High);
    }

    #[test]
    fn test_exclusion_suppresses_match() {
        let excluded = Route::builder().path("/a/admin").any_method().build().unwrap();
        let route = Route::builder()
            .path("/a/:rest")
            .get()
            .exclude(excluded)
            .build()
            .unwrap();
        assert!(route.apply(&ctx(Method::GET, "/a/admin")).is_none());
        assert!(route.apply(&ctx(Method::GET, "/a/other")).is_some());
    }

    #[test]
    fn test_any_method_scores_low() {
        let route = Route::builder().path("/a").any_method().build().unwrap();
        let result = route.apply(&ctx(Method::DELETE, "/a")).unwrap();
        assert_eq!(result.score, MatchScore::Low);
    }

    #[test]
    fn test_builder_validations() {
        assert!(matches!(
            Route::builder().path("/a").build(),
            Err(RouteError::NoMethods)
        ));
        assert!(matches!(
            Route::builder()
                .path("/a")
                .get()
                .produces(["text/*".parse::<Mime>().unwrap()])
                .build(),
            Err(RouteError::WildcardProduce(_))
        ));
    }
}
