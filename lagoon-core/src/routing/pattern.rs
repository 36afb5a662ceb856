//! Path patterns: the DSL, its compiled forms, and path matching.
//!
//! A pattern string is one of:
//!
//! - `exact:/foo`: literal match (also the default for `/`-leading strings
//!   without `:name`/`{name}` segments);
//! - `prefix:/foo/`: every path under the prefix;
//! - `/users/:id` or `/users/{id}`: parameterized segments capturing
//!   `[^/]+` each; a repeated name is a back-reference whose captures must
//!   agree;
//! - `glob:/foo/*/bar/**`: `*` matches one segment, `**` any number of
//!   segments, wildcards captured as numbered parameters;
//! - `regex:^/foo/(?P<id>\d+)$`: anchored regex with named captures.
//!
//! Parameterized and exact patterns expose a *skeleton* (parameters
//! collapsed to `:`) that doubles as the trie key; glob and regex patterns
//! have none and fall back to the sequential router.

use std::{collections::HashMap, fmt};

use percent_encoding::percent_decode_str;
use regex::Regex;

/// Decoded path-parameter captures.
pub type PathParams = HashMap<String, String>;

const PARAMETERIZED_SHAPE: &str = r"^(/[^/{}:]+|/:[^/{}]+|/\{[^/{}]+\})+/?$";

#[derive(thiserror::Error, Debug)]
pub enum PatternError {
    #[error("path pattern must start with '/': {0}")]
    MissingLeadingSlash(String),
    #[error("invalid path pattern: {0}")]
    Invalid(String),
    #[error("invalid regex pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("missing value for parameter '{0}'")]
    MissingParam(String),
}

#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
    Parameterized(ParameterizedPattern),
    Glob(GlobPattern),
    Regex(RegexPattern),
    PrefixAdding {
        prefix: String,
        inner: Box<PathPattern>,
    },
}

impl PathPattern {
    /// Parse a pattern string in the DSL described at module level.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if let Some(rest) = pattern.strip_prefix("exact:") {
            require_slash(rest)?;
            return Ok(PathPattern::Exact(rest.to_string()));
        }
        if let Some(rest) = pattern.strip_prefix("prefix:") {
            require_slash(rest)?;
            let mut prefix = rest.to_string();
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            return Ok(PathPattern::Prefix(prefix));
        }
        if let Some(rest) = pattern.strip_prefix("glob:") {
            if !rest.contains('*') {
                require_slash(rest)?;
                return Ok(PathPattern::Exact(rest.to_string()));
            }
            return Ok(PathPattern::Glob(GlobPattern::compile(rest)?));
        }
        if let Some(rest) = pattern.strip_prefix("regex:") {
            return Ok(PathPattern::Regex(RegexPattern::compile(rest)?));
        }
        if !pattern.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash(pattern.to_string()));
        }
        if !pattern.contains(':') && !pattern.contains('{') {
            let shape = Regex::new(r"^(/[^/{}:*]+)+/?$|^/$")?;
            if !shape.is_match(pattern) {
                return Err(PatternError::Invalid(pattern.to_string()));
            }
            return Ok(PathPattern::Exact(pattern.to_string()));
        }
        Ok(PathPattern::Parameterized(ParameterizedPattern::compile(
            pattern,
        )?))
    }

    /// Compose a literal path prefix with this pattern.
    pub fn with_prefix(self, prefix: &str) -> Result<Self, PatternError> {
        require_slash(prefix)?;
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Ok(self);
        }
        if prefix.contains(':') || prefix.contains('{') || prefix.contains('*') {
            return Err(PatternError::Invalid(prefix.to_string()));
        }
        Ok(match self {
            PathPattern::Exact(p) => PathPattern::Exact(format!("{prefix}{p}")),
            PathPattern::Prefix(p) => PathPattern::Prefix(format!("{prefix}{p}")),
            PathPattern::Parameterized(pp) => PathPattern::Parameterized(
                ParameterizedPattern::compile(&format!("{prefix}{}", pp.source))?,
            ),
            inner @ (PathPattern::Glob(_) | PathPattern::Regex(_)) => PathPattern::PrefixAdding {
                prefix: prefix.to_string(),
                inner: Box::new(inner),
            },
            PathPattern::PrefixAdding {
                prefix: nested,
                inner,
            } => PathPattern::PrefixAdding {
                prefix: format!("{prefix}{nested}"),
                inner,
            },
        })
    }

    /// Parameter-collapsed form used for duplicate detection and, when
    /// present, as the trie key.
    pub fn skeleton(&self) -> Option<String> {
        match self {
            PathPattern::Exact(p) => Some(p.clone()),
            PathPattern::Prefix(p) => Some(format!("{p}*")),
            PathPattern::Parameterized(pp) => Some(pp.skeleton.clone()),
            _ => None,
        }
    }

    /// The trie key, when this pattern is trie-compatible.
    pub fn trie_path(&self) -> Option<String> {
        self.skeleton()
    }

    /// Declared parameter names, in first-occurrence order.
    pub fn param_names(&self) -> &[String] {
        match self {
            PathPattern::Parameterized(pp) => &pp.params,
            PathPattern::Glob(g) => &g.params,
            PathPattern::Regex(r) => &r.params,
            PathPattern::PrefixAdding { inner, .. } => inner.param_names(),
            _ => &[],
        }
    }

    /// Tie-break weight; literal segments count double.
    pub fn complexity(&self) -> u32 {
        match self {
            PathPattern::Exact(p) => 2 * segment_count(p),
            PathPattern::Prefix(p) => 2 * segment_count(p),
            PathPattern::Parameterized(pp) => pp
                .segments
                .iter()
                .map(|s| match s {
                    Segment::Literal(_) => 2,
                    Segment::Param(_) => 1,
                })
                .sum(),
            PathPattern::Glob(g) => g.complexity,
            PathPattern::Regex(_) => 1,
            PathPattern::PrefixAdding { prefix, inner } => {
                2 * segment_count(prefix) + inner.complexity()
            }
        }
    }

    /// Match a request path, returning decoded parameter captures.
    pub fn match_path(&self, path: &str) -> Option<PathParams> {
        match self {
            PathPattern::Exact(p) => (p == path).then(PathParams::new),
            PathPattern::Prefix(p) => path.starts_with(p.as_str()).then(PathParams::new),
            PathPattern::Parameterized(pp) => pp.match_path(path),
            PathPattern::Glob(g) => g.match_path(path),
            PathPattern::Regex(r) => r.match_path(path),
            PathPattern::PrefixAdding { prefix, inner } => {
                let rest = path.strip_prefix(prefix.as_str())?;
                if rest.is_empty() {
                    inner.match_path("/")
                } else if rest.starts_with('/') {
                    inner.match_path(rest)
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(p) => f.write_str(p),
            PathPattern::Prefix(p) => write!(f, "prefix:{p}"),
            PathPattern::Parameterized(pp) => f.write_str(&pp.source),
            PathPattern::Glob(g) => write!(f, "glob:{}", g.source),
            PathPattern::Regex(r) => write!(f, "regex:{}", r.source),
            PathPattern::PrefixAdding { prefix, inner } => write!(f, "{prefix}{inner}"),
        }
    }
}

fn require_slash(s: &str) -> Result<(), PatternError> {
    if s.starts_with('/') {
        Ok(())
    } else {
        Err(PatternError::MissingLeadingSlash(s.to_string()))
    }
}

fn segment_count(path: &str) -> u32 {
    path.split('/').filter(|s| !s.is_empty()).count() as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A `/literal/:param` pattern compiled to a single anchored regex with one
/// uniquely named group per parameter occurrence.
#[derive(Debug, Clone)]
pub struct ParameterizedPattern {
    source: String,
    skeleton: String,
    segments: Vec<Segment>,
    trailing_slash: bool,
    regex: Regex,
    /// (group name, parameter index) per capture, in pattern order.
    groups: Vec<(String, usize)>,
    params: Vec<String>,
}

impl ParameterizedPattern {
    fn compile(source: &str) -> Result<Self, PatternError> {
        let shape = Regex::new(PARAMETERIZED_SHAPE)?;
        if !shape.is_match(source) {
            return Err(PatternError::Invalid(source.to_string()));
        }
        let trailing_slash = source.len() > 1 && source.ends_with('/');
        let trimmed = if trailing_slash {
            &source[..source.len() - 1]
        } else {
            source
        };

        let mut segments = Vec::new();
        let mut params: Vec<String> = Vec::new();
        let mut groups = Vec::new();
        let mut regex_src = String::from("^");
        let mut skeleton = String::new();

        for raw in trimmed.split('/').skip(1) {
            let param = if let Some(name) = raw.strip_prefix(':') {
                Some(name)
            } else if raw.starts_with('{') && raw.ends_with('}') {
                Some(&raw[1..raw.len() - 1])
            } else {
                None
            };
            match param {
                Some(name) => {
                    if name.is_empty() {
                        return Err(PatternError::Invalid(source.to_string()));
                    }
                    let param_idx = match params.iter().position(|p| p == name) {
                        Some(idx) => idx,
                        None => {
                            params.push(name.to_string());
                            params.len() - 1
                        }
                    };
                    let group = format!("g{}", groups.len());
                    regex_src.push_str(&format!("/(?P<{group}>[^/]+)"));
                    groups.push((group, param_idx));
                    segments.push(Segment::Param(name.to_string()));
                    skeleton.push_str("/:");
                }
                None => {
                    regex_src.push('/');
                    regex_src.push_str(&regex::escape(raw));
                    segments.push(Segment::Literal(raw.to_string()));
                    skeleton.push('/');
                    skeleton.push_str(raw);
                }
            }
        }
        if trailing_slash {
            regex_src.push('/');
            skeleton.push('/');
        }
        regex_src.push('$');

        Ok(Self {
            source: source.to_string(),
            skeleton,
            segments,
            trailing_slash,
            regex: Regex::new(&regex_src)?,
            groups,
            params,
        })
    }

    fn match_path(&self, path: &str) -> Option<PathParams> {
        let caps = self.regex.captures(path)?;
        let mut values: Vec<Option<String>> = vec![None; self.params.len()];
        for (group, param_idx) in &self.groups {
            let raw = caps.name(group)?.as_str();
            let decoded = percent_decode_str(raw).decode_utf8().ok()?.into_owned();
            match &values[*param_idx] {
                None => values[*param_idx] = Some(decoded),
                // Back-reference: the repeated parameter must capture the
                // same value everywhere it appears.
                Some(previous) => {
                    if *previous != decoded {
                        return None;
                    }
                }
            }
        }
        let mut out = PathParams::with_capacity(self.params.len());
        for (name, value) in self.params.iter().zip(values) {
            out.insert(name.clone(), value?);
        }
        Some(out)
    }

    /// Rebuild a concrete path from parameter values; the inverse of
    /// `match_path` for values without `/`.
    pub fn instantiate(&self, params: &PathParams) -> Result<String, PatternError> {
        let mut path = String::new();
        for segment in &self.segments {
            path.push('/');
            match segment {
                Segment::Literal(lit) => path.push_str(lit),
                Segment::Param(name) => match params.get(name) {
                    Some(value) => path.push_str(value),
                    None => return Err(PatternError::MissingParam(name.clone())),
                },
            }
        }
        if self.trailing_slash {
            path.push('/');
        }
        Ok(path)
    }
}

/// A glob compiled to a regex; wildcards capture as numbered parameters.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
    params: Vec<String>,
    complexity: u32,
}

impl GlobPattern {
    fn compile(source: &str) -> Result<Self, PatternError> {
        let normalized = if source.starts_with('/') {
            source.to_string()
        } else {
            // A relative glob matches at any depth.
            format!("/**/{source}")
        };

        let mut regex_src = String::from("^");
        let mut params = Vec::new();
        let mut complexity = 0u32;
        let segments: Vec<&str> = normalized.split('/').skip(1).collect();
        for (i, seg) in segments.iter().enumerate() {
            match *seg {
                "**" => {
                    let group = format!("g{}", params.len());
                    regex_src.push_str(&format!("(?P<{group}>(?:/[^/]+)*)"));
                    params.push(params.len().to_string());
                    complexity += 1;
                }
                "*" => {
                    let group = format!("g{}", params.len());
                    regex_src.push_str(&format!("/(?P<{group}>[^/]+)"));
                    params.push(params.len().to_string());
                    complexity += 1;
                }
                _ => {
                    regex_src.push('/');
                    for ch in seg.chars() {
                        if ch == '*' {
                            regex_src.push_str("[^/]*");
                        } else {
                            regex_src.push_str(&regex::escape(&ch.to_string()));
                        }
                    }
                    complexity += 2;
                }
            }
            if i + 1 == segments.len() && *seg == "**" {
                regex_src.push_str("/?");
            }
        }
        regex_src.push('$');

        Ok(Self {
            source: source.to_string(),
            regex: Regex::new(&regex_src)?,
            params,
            complexity,
        })
    }

    fn match_path(&self, path: &str) -> Option<PathParams> {
        let caps = self.regex.captures(path)?;
        let mut out = PathParams::with_capacity(self.params.len());
        for (i, name) in self.params.iter().enumerate() {
            let raw = caps
                .name(&format!("g{i}"))
                .map(|m| m.as_str())
                .unwrap_or("");
            out.insert(name.clone(), raw.trim_start_matches('/').to_string());
        }
        Some(out)
    }
}

/// A user-supplied regex, anchored on compilation; named capture groups
/// become parameters.
#[derive(Debug, Clone)]
pub struct RegexPattern {
    source: String,
    regex: Regex,
    params: Vec<String>,
}

impl RegexPattern {
    fn compile(source: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(&format!("^(?:{source})$"))?;
        let params = regex
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();
        Ok(Self {
            source: source.to_string(),
            regex,
            params,
        })
    }

    fn match_path(&self, path: &str) -> Option<PathParams> {
        let caps = self.regex.captures(path)?;
        let mut out = PathParams::new();
        for name in &self.params {
            if let Some(m) = caps.name(name) {
                out.insert(name.clone(), m.as_str().to_string());
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> PathParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_default_variants() {
        assert!(matches!(
            PathPattern::parse("/users/me").unwrap(),
            PathPattern::Exact(_)
        ));
        assert!(matches!(
            PathPattern::parse("/users/:id").unwrap(),
            PathPattern::Parameterized(_)
        ));
        assert!(matches!(
            PathPattern::parse("prefix:/static").unwrap(),
            PathPattern::Prefix(_)
        ));
        assert!(PathPattern::parse("users").is_err());
        assert!(PathPattern::parse("/users/*").is_err());
    }

    #[test]
    fn test_exact_and_prefix_matching() {
        let exact = PathPattern::parse("/users/me").unwrap();
        assert!(exact.match_path("/users/me").is_some());
        assert!(exact.match_path("/users/me/").is_none());

        let prefix = PathPattern::parse("prefix:/static/").unwrap();
        assert!(prefix.match_path("/static/css/site.css").is_some());
        assert!(prefix.match_path("/static/").is_some());
        assert!(prefix.match_path("/static").is_none());
        assert_eq!(prefix.trie_path().unwrap(), "/static/*");
    }

    #[test]
    fn test_parameterized_capture_and_decode() {
        let p = PathPattern::parse("/users/{id}/posts/:post").unwrap();
        assert_eq!(p.param_names(), ["id", "post"]);
        assert_eq!(p.trie_path().unwrap(), "/users/:/posts/:");
        assert_eq!(
            p.match_path("/users/42/posts/hello%20world").unwrap(),
            params(&[("id", "42"), ("post", "hello world")])
        );
        assert!(p.match_path("/users/42/posts").is_none());
        assert!(p.match_path("/users/42/posts/a/b").is_none());
    }

    #[test]
    fn test_back_reference_parameter() {
        let p = PathPattern::parse("/{x}/same/{x}").unwrap();
        assert_eq!(
            p.match_path("/foo/same/foo").unwrap(),
            params(&[("x", "foo")])
        );
        assert!(p.match_path("/foo/same/bar").is_none());
    }

    #[test]
    fn test_instantiate_round_trip() {
        let PathPattern::Parameterized(p) =
            PathPattern::parse("/a/{x}/b/{y}").unwrap()
        else {
            unreachable!()
        };
        let values = params(&[("x", "one"), ("y", "two")]);
        let path = p.instantiate(&values).unwrap();
        assert_eq!(path, "/a/one/b/two");
        assert_eq!(p.match_path(&path).unwrap(), values);
    }

    #[test]
    fn test_glob_matching() {
        let g = PathPattern::parse("glob:/**/foo").unwrap();
        assert_eq!(
            g.match_path("/a/b/foo").unwrap(),
            params(&[("0", "a/b")])
        );
        assert_eq!(g.match_path("/foo").unwrap(), params(&[("0", "")]));
        assert!(g.match_path("/a/b/bar").is_none());

        let g = PathPattern::parse("glob:/download/*.zip").unwrap();
        assert!(g.match_path("/download/kit.zip").is_some());
        assert!(g.match_path("/download/kit.tar").is_none());

        // Relative globs match at any depth.
        let g = PathPattern::parse("glob:foo").unwrap();
        assert!(g.match_path("/x/y/foo").is_some());
        assert!(g.match_path("/foo").is_some());
    }

    #[test]
    fn test_regex_pattern() {
        let r = PathPattern::parse(r"regex:/files/(?P<name>[^/]+)\.txt").unwrap();
        assert_eq!(
            r.match_path("/files/notes.txt").unwrap(),
            params(&[("name", "notes")])
        );
        assert!(r.match_path("/files/notes.txt.bak").is_none());
        assert_eq!(r.param_names(), ["name"]);
    }

    #[test]
    fn test_with_prefix_composition() {
        let p = PathPattern::parse("/users/:id")
            .unwrap()
            .with_prefix("/api/")
            .unwrap();
        assert!(p.match_path("/api/users/7").is_some());
        assert_eq!(p.trie_path().unwrap(), "/api/users/:");

        let g = PathPattern::parse("glob:/**/foo")
            .unwrap()
            .with_prefix("/api")
            .unwrap();
        assert!(matches!(g, PathPattern::PrefixAdding { .. }));
        assert!(g.match_path("/api/a/foo").is_some());
        assert!(g.match_path("/a/foo").is_none());
        assert!(g.trie_path().is_none());
    }

    #[test]
    fn test_complexity_ordering() {
        let exact = PathPattern::parse("/a/b").unwrap();
        let param = PathPattern::parse("/a/:x").unwrap();
        assert!(exact.complexity() > param.complexity());
    }
}
