//! Header and query-parameter predicates.
//!
//! Grammar, one predicate per string: `name`, `!name`, `name=value`,
//! `name!=value`, with `||` joining alternatives. Whitespace around
//! operators is tolerated; a single `|` outside `||` is rejected.
//!
//! Evaluation never throws: anything that fails (an unparseable header
//! name, a non-UTF-8 value) makes the predicate yield `false` with a
//! warning log, so a misbehaving client cannot take the router down.

use http::{HeaderMap, HeaderName};
use tracing::warn;

use super::context::QueryParams;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PredicateError {
    #[error("empty predicate")]
    Empty,
    #[error("stray '|' in predicate: {0}")]
    StrayPipe(String),
    #[error("missing name in predicate: {0}")]
    MissingName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Present,
    Absent,
    Eq(String),
    NotEq(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    name: String,
    op: Op,
}

/// A compiled predicate: a disjunction of clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    source: String,
    clauses: Vec<Clause>,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(PredicateError::Empty);
        }
        if trimmed.replace("||", "\u{0}").contains('|') {
            return Err(PredicateError::StrayPipe(source.to_string()));
        }
        let mut clauses = Vec::new();
        for alt in trimmed.split("||") {
            let alt = alt.trim();
            if alt.is_empty() {
                return Err(PredicateError::MissingName(source.to_string()));
            }
            let clause = if let Some((name, value)) = alt.split_once("!=") {
                Clause {
                    name: name.trim().to_string(),
                    op: Op::NotEq(value.trim().to_string()),
                }
            } else if let Some((name, value)) = alt.split_once('=') {
                Clause {
                    name: name.trim().to_string(),
                    op: Op::Eq(value.trim().to_string()),
                }
            } else if let Some(name) = alt.strip_prefix('!') {
                Clause {
                    name: name.trim().to_string(),
                    op: Op::Absent,
                }
            } else {
                Clause {
                    name: alt.to_string(),
                    op: Op::Present,
                }
            };
            if clause.name.is_empty() {
                return Err(PredicateError::MissingName(source.to_string()));
            }
            clauses.push(clause);
        }
        Ok(Self {
            source: source.to_string(),
            clauses,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against request headers.
    pub fn eval_headers(&self, headers: &HeaderMap) -> bool {
        self.clauses.iter().any(|clause| {
            let Ok(name) = clause.name.parse::<HeaderName>() else {
                warn!(predicate = %self.source, "unparseable header name in predicate");
                return false;
            };
            let mut values = headers.get_all(&name).iter().map(|v| v.to_str());
            match &clause.op {
                Op::Present => values.next().is_some(),
                Op::Absent => values.next().is_none(),
                Op::Eq(expected) => values.any(|v| v.map(|v| v == expected).unwrap_or(false)),
                Op::NotEq(expected) => {
                    !headers
                        .get_all(&name)
                        .iter()
                        .any(|v| v.to_str().map(|v| v == expected).unwrap_or(false))
                }
            }
        })
    }

    /// Evaluate against decoded query parameters.
    pub fn eval_params(&self, params: &QueryParams) -> bool {
        self.clauses.iter().any(|clause| match &clause.op {
            Op::Present => params.contains(&clause.name),
            Op::Absent => !params.contains(&clause.name),
            Op::Eq(expected) => params.get_all(&clause.name).any(|v| v == expected),
            Op::NotEq(expected) => !params.get_all(&clause.name).any(|v| v == expected),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                k.parse::<HeaderName>().unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_parse_shapes() {
        assert!(Predicate::parse("x-flag").is_ok());
        assert!(Predicate::parse("!x-flag").is_ok());
        assert!(Predicate::parse("x-mode = canary").is_ok());
        assert!(Predicate::parse("x-mode != canary || x-mode=beta").is_ok());
        assert_eq!(Predicate::parse(""), Err(PredicateError::Empty));
        assert!(matches!(
            Predicate::parse("a | b"),
            Err(PredicateError::StrayPipe(_))
        ));
        assert!(matches!(
            Predicate::parse("=value"),
            Err(PredicateError::MissingName(_))
        ));
    }

    #[test]
    fn test_header_evaluation() {
        let h = headers(&[("x-mode", "canary"), ("x-flag", "1")]);
        assert!(Predicate::parse("x-flag").unwrap().eval_headers(&h));
        assert!(!Predicate::parse("!x-flag").unwrap().eval_headers(&h));
        assert!(Predicate::parse("x-mode=canary").unwrap().eval_headers(&h));
        assert!(!Predicate::parse("x-mode=beta").unwrap().eval_headers(&h));
        // Absent headers satisfy a != clause.
        assert!(Predicate::parse("x-zone!=eu").unwrap().eval_headers(&h));
        assert!(!Predicate::parse("x-mode!=canary").unwrap().eval_headers(&h));
    }

    #[test]
    fn test_disjunction() {
        let h = headers(&[("x-mode", "beta")]);
        let p = Predicate::parse("x-mode=canary || x-mode=beta").unwrap();
        assert!(p.eval_headers(&h));
        let p = Predicate::parse("x-mode=canary || x-mode=prod").unwrap();
        assert!(!p.eval_headers(&h));
    }

    #[test]
    fn test_bad_header_name_yields_false() {
        let h = headers(&[("x-flag", "1")]);
        assert!(!Predicate::parse("bad name").unwrap().eval_headers(&h));
    }

    #[test]
    fn test_param_evaluation() {
        let params = QueryParams::parse("mode=canary&flag");
        assert!(Predicate::parse("flag").unwrap().eval_params(&params));
        assert!(Predicate::parse("mode=canary").unwrap().eval_params(&params));
        assert!(!Predicate::parse("mode=beta").unwrap().eval_params(&params));
        assert!(Predicate::parse("!absent").unwrap().eval_params(&params));
    }
}
