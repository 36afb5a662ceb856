//! Outcome of matching one route against a routing context.

use mime::Mime;

use super::pattern::PathParams;

/// Specificity tier of a match, used for early exit and tie-breaking.
///
/// `High`: an explicit method set and every declared media criterion
/// matched at full preference. `Medium`: media negotiation succeeded at
/// reduced preference. `Low`/`Lowest`: the same split for routes accepting
/// any method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchScore {
    Lowest,
    Low,
    Medium,
    High,
}

/// A successful match: the path actually routed, decoded parameters and
/// the negotiated response media type.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub path: String,
    pub query: Option<String>,
    pub path_params: PathParams,
    pub negotiated_type: Option<Mime>,
    pub score: MatchScore,
}

impl RoutingResult {
    pub fn new(path: impl Into<String>, query: Option<String>) -> Self {
        Self {
            path: path.into(),
            query,
            path_params: PathParams::new(),
            negotiated_type: None,
            score: MatchScore::High,
        }
    }

    /// Parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Synthetic result used when the fallback service is routed.
    pub fn fallback(path: impl Into<String>, query: Option<String>) -> Self {
        Self {
            path: path.into(),
            query,
            path_params: PathParams::new(),
            negotiated_type: None,
            score: MatchScore::Lowest,
        }
    }
}
