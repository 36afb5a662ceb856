//! A compressed routing trie.
//!
//! Keys are trie paths produced by [`PathPattern::trie_path`]: literal text
//! with `:` segments for single-segment parameters and a trailing `*` for
//! catch-alls. Nodes hold zero or more values; lookup walks exact children
//! first, then the parameter child, then the catch-all child, so more
//! specific routes always shadow wildcards. Construction splits literal
//! edges at the longest common prefix; after `build()` the structure is
//! immutable.
//!
//! [`PathPattern::trie_path`]: super::pattern::PathPattern::trie_path

use std::{cmp::Ordering, collections::BTreeMap, fmt};

#[derive(thiserror::Error, Debug)]
pub enum TrieError {
    #[error("empty trie path")]
    Empty,
    #[error("catch-all must terminate the trie path: {0}")]
    CatchAllNotLast(String),
    #[error("trie path must start with '/': {0}")]
    MissingLeadingSlash(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Exact,
    Parameter,
    CatchAll,
}

struct Node<V> {
    kind: NodeKind,
    /// Literal fragment for `Exact` nodes (may span segments); `:` / `*`
    /// markers otherwise.
    fragment: String,
    children: BTreeMap<u8, Node<V>>,
    param_child: Option<Box<Node<V>>>,
    catch_all: Option<Box<Node<V>>>,
    values: Vec<V>,
}

impl<V> Node<V> {
    fn new(kind: NodeKind, fragment: String) -> Self {
        Self {
            kind,
            fragment,
            children: BTreeMap::new(),
            param_child: None,
            catch_all: None,
            values: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Param,
    CatchAll,
}

fn parse_parts(path: &str) -> Result<Vec<Part>, TrieError> {
    if path.is_empty() {
        return Err(TrieError::Empty);
    }
    if !path.starts_with('/') {
        return Err(TrieError::MissingLeadingSlash(path.to_string()));
    }
    let mut parts: Vec<Part> = Vec::new();
    let trailing_slash = path.len() > 1 && path.ends_with('/');
    for seg in path.split('/').skip(1).filter(|s| !s.is_empty()) {
        if matches!(parts.last(), Some(Part::CatchAll)) {
            return Err(TrieError::CatchAllNotLast(path.to_string()));
        }
        match seg {
            // Parameter and catch-all edges both attach to a
            // slash-terminated literal, so that at one node the exact
            // child, the parameter child and the catch-all child compete
            // directly and in that order.
            ":" => {
                match parts.last_mut() {
                    Some(Part::Literal(lit)) => lit.push('/'),
                    _ => parts.push(Part::Literal("/".to_string())),
                }
                parts.push(Part::Param);
            }
            "*" => {
                match parts.last_mut() {
                    Some(Part::Literal(lit)) => lit.push('/'),
                    _ => parts.push(Part::Literal("/".to_string())),
                }
                parts.push(Part::CatchAll);
            }
            literal => match parts.last_mut() {
                Some(Part::Literal(lit)) => {
                    lit.push('/');
                    lit.push_str(literal);
                }
                _ => parts.push(Part::Literal(format!("/{literal}"))),
            },
        }
    }
    if parts.is_empty() {
        parts.push(Part::Literal("/".to_string()));
    } else if trailing_slash && !matches!(parts.last(), Some(Part::CatchAll)) {
        match parts.last_mut() {
            Some(Part::Literal(lit)) => lit.push('/'),
            _ => parts.push(Part::Literal("/".to_string())),
        }
    }
    Ok(parts)
}

/// Builder accumulating (trie path, value) pairs in registration order.
pub struct RoutingTrieBuilder<V> {
    entries: Vec<(String, V)>,
    comparator: Option<Box<dyn Fn(&V, &V) -> Ordering>>,
}

impl<V> Default for RoutingTrieBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RoutingTrieBuilder<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            comparator: None,
        }
    }

    pub fn add(&mut self, path: impl Into<String>, value: V) -> &mut Self {
        self.entries.push((path.into(), value));
        self
    }

    /// Ordering applied to values sharing a node; the sort is stable so
    /// insertion order survives within ties.
    pub fn comparator(&mut self, cmp: impl Fn(&V, &V) -> Ordering + 'static) -> &mut Self {
        self.comparator = Some(Box::new(cmp));
        self
    }

    pub fn build(self) -> Result<RoutingTrie<V>, TrieError> {
        let mut root = Node::new(NodeKind::Exact, String::new());
        for (path, value) in self.entries {
            let parts = parse_parts(&path)?;
            insert(&mut root, &parts, value);
        }
        if let Some(cmp) = &self.comparator {
            sort_values(&mut root, cmp.as_ref());
        }
        Ok(RoutingTrie { root })
    }
}

fn insert<V>(node: &mut Node<V>, parts: &[Part], value: V) {
    let Some(first) = parts.first() else {
        node.values.push(value);
        return;
    };
    match first {
        Part::Literal(lit) => insert_literal(node, lit, &parts[1..], value),
        Part::Param => {
            let child = node
                .param_child
                .get_or_insert_with(|| Box::new(Node::new(NodeKind::Parameter, ":".to_string())));
            insert(child, &parts[1..], value);
        }
        Part::CatchAll => {
            let child = node
                .catch_all
                .get_or_insert_with(|| Box::new(Node::new(NodeKind::CatchAll, "*".to_string())));
            insert(child, &parts[1..], value);
        }
    }
}

fn insert_literal<V>(node: &mut Node<V>, lit: &str, rest: &[Part], value: V) {
    let first_byte = lit.as_bytes()[0];
    match node.children.get_mut(&first_byte) {
        None => {
            let mut child = Node::new(NodeKind::Exact, lit.to_string());
            insert(&mut child, rest, value);
            node.children.insert(first_byte, child);
        }
        Some(child) => {
            let lcp = common_prefix_len(&child.fragment, lit);
            if lcp < child.fragment.len() {
                // Split the edge: the shared prefix becomes the parent and
                // the old child keeps its suffix.
                let suffix = child.fragment.split_off(lcp);
                let split = Node::new(NodeKind::Exact, child.fragment.clone());
                let mut old = std::mem::replace(child, split);
                old.fragment = suffix;
                child.children.insert(old.fragment.as_bytes()[0], old);
            }
            if lcp == lit.len() {
                insert(child, rest, value);
            } else {
                insert_literal(child, &lit[lcp..], rest, value);
            }
        }
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn sort_values<V>(node: &mut Node<V>, cmp: &dyn Fn(&V, &V) -> Ordering) {
    node.values.sort_by(cmp);
    for child in node.children.values_mut() {
        sort_values(child, cmp);
    }
    if let Some(child) = node.param_child.as_mut() {
        sort_values(child, cmp);
    }
    if let Some(child) = node.catch_all.as_mut() {
        sort_values(child, cmp);
    }
}

/// Immutable compressed trie mapping paths to candidate values.
pub struct RoutingTrie<V> {
    root: Node<V>,
}

impl<V> RoutingTrie<V> {
    pub fn builder() -> RoutingTrieBuilder<V> {
        RoutingTrieBuilder::new()
    }

    /// All candidate values for `path`, most specific first.
    pub fn find(&self, path: &str) -> Vec<&V> {
        let mut out = Vec::new();
        search(&self.root, path, &mut out);
        out
    }

    /// The most specific candidate list's first value, if any.
    pub fn find_first(&self, path: &str) -> Option<&V> {
        self.find(path).into_iter().next()
    }
}

fn search<'a, V>(node: &'a Node<V>, path: &str, out: &mut Vec<&'a V>) {
    let remaining = match node.kind {
        NodeKind::Exact => match path.strip_prefix(node.fragment.as_str()) {
            Some(rest) => rest,
            None => return,
        },
        NodeKind::Parameter => {
            // One non-empty segment; the separating '/' belongs to the
            // literal edge above.
            if path.is_empty() || path.starts_with('/') {
                return;
            }
            match path.find('/') {
                Some(idx) => &path[idx..],
                None => "",
            }
        }
        NodeKind::CatchAll => {
            out.extend(node.values.iter());
            return;
        }
    };

    if remaining.is_empty() {
        out.extend(node.values.iter());
        if let Some(catch_all) = &node.catch_all {
            out.extend(catch_all.values.iter());
        }
        return;
    }

    if let Some(child) = node.children.get(&remaining.as_bytes()[0]) {
        search(child, remaining, out);
    }
    if let Some(param) = &node.param_child {
        search(param, remaining, out);
    }
    if let Some(catch_all) = &node.catch_all {
        out.extend(catch_all.values.iter());
    }
}

impl<V: fmt::Debug> fmt::Debug for RoutingTrie<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dump<V: fmt::Debug>(
            node: &Node<V>,
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            writeln!(
                f,
                "{}{:?} {:?} ({} values)",
                "  ".repeat(depth),
                node.kind,
                node.fragment,
                node.values.len()
            )?;
            for child in node.children.values() {
                dump(child, depth + 1, f)?;
            }
            if let Some(child) = &node.param_child {
                dump(child, depth + 1, f)?;
            }
            if let Some(child) = &node.catch_all {
                dump(child, depth + 1, f)?;
            }
            Ok(())
        }
        dump(&self.root, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn build(paths: &[&str]) -> RoutingTrie<String> {
        let mut builder = RoutingTrie::builder();
        for p in paths {
            builder.add(*p, p.to_string());
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_exact_beats_parameter_beats_catch_all() {
        let trie = build(&["/users/:", "/users/me", "/users/", "/"]);
        // "/users/" has a trailing slash: it only matches itself.
        assert_eq!(trie.find("/users/me"), [&"/users/me", &"/users/:"]);
        assert_eq!(trie.find("/users/42"), [&"/users/:"]);
        assert_eq!(trie.find("/users/"), [&"/users/"]);
        assert_eq!(trie.find("/"), [&"/"]);
        assert!(trie.find("/nope").is_empty());
    }

    #[test]
    fn test_catch_all_matches_remainder() {
        let trie = build(&["/static/*", "/static/favicon.ico"]);
        assert_eq!(
            trie.find("/static/favicon.ico"),
            [&"/static/favicon.ico", &"/static/*"]
        );
        assert_eq!(trie.find("/static/css/site.css"), [&"/static/*"]);
        assert_eq!(trie.find("/static/"), [&"/static/*"]);
        assert!(trie.find("/static").is_empty());
    }

    #[test]
    fn test_edge_splitting_preserves_lookup() {
        let trie = build(&["/team", "/terrace", "/tea/pot", "/tea"]);
        assert_eq!(trie.find("/team"), [&"/team"]);
        assert_eq!(trie.find("/terrace"), [&"/terrace"]);
        assert_eq!(trie.find("/tea"), [&"/tea"]);
        assert_eq!(trie.find("/tea/pot"), [&"/tea/pot"]);
        assert!(trie.find("/te").is_empty());
    }

    #[test]
    fn test_parameter_consumes_single_segment() {
        let trie = build(&["/a/:/c"]);
        assert_eq!(trie.find("/a/b/c"), [&"/a/:/c"]);
        assert!(trie.find("/a//c").is_empty());
        assert!(trie.find("/a/b/d").is_empty());
        assert!(trie.find("/a/b/c/d").is_empty());
    }

    #[test]
    fn test_multiple_values_per_node_keep_insertion_order() {
        let mut builder = RoutingTrie::builder();
        builder.add("/x", "first".to_string());
        builder.add("/x", "second".to_string());
        builder.comparator(|_, _| Ordering::Equal);
        let trie = builder.build().unwrap();
        assert_eq!(trie.find("/x"), [&"first", &"second"]);
    }

    #[test]
    fn test_shuffled_insertion_is_idempotent() {
        let paths = ["/a/:", "/a/b", "/a/b/c", "/:/b", "/c/*", "/c/d"];
        let shuffled = ["/c/d", "/:/b", "/a/b/c", "/c/*", "/a/b", "/a/:"];
        let t1 = build(&paths);
        let t2 = build(&shuffled);
        for path in ["/a/b", "/a/z", "/a/b/c", "/x/b", "/c/anything", "/c/d"] {
            let r1: Vec<_> = t1.find(path);
            let mut r1 = r1.clone();
            let mut r2 = t2.find(path);
            r1.sort();
            r2.sort();
            assert_eq!(r1, r2, "path {path}");
        }
    }

    #[test]
    fn test_trie_outpaces_linear_scan() {
        let total = 1024 * 100;
        let mut builder = RoutingTrie::builder();
        let paths: Vec<String> = (0..total).map(|n| format!("/route{n}")).collect();
        for p in &paths {
            builder.add(p.clone(), p.clone());
        }
        let trie = builder.build().unwrap();
        let target = "/route1024";

        let current = SystemTime::now();
        let linear = paths.iter().find(|p| p.as_str() == target).unwrap();
        let linear_elapsed = current.elapsed().unwrap();

        let current = SystemTime::now();
        let found = trie.find_first(target).unwrap();
        let trie_elapsed = current.elapsed().unwrap();

        assert_eq!(linear, found);
        assert!(trie_elapsed < linear_elapsed);
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let mut builder = RoutingTrie::<u32>::builder();
        builder.add("/a/*/b", 1);
        assert!(matches!(
            builder.build(),
            Err(TrieError::CatchAllNotLast(_))
        ));

        let mut builder = RoutingTrie::<u32>::builder();
        builder.add("a", 1);
        assert!(matches!(
            builder.build(),
            Err(TrieError::MissingLeadingSlash(_))
        ));
    }
}
