//! Media-type parsing and proactive content negotiation.

use http::{header, HeaderMap};
use mime::Mime;

/// One entry of a parsed `Accept` header, with its quality weight.
#[derive(Debug, Clone)]
pub struct AcceptItem {
    pub media_type: Mime,
    pub q: f32,
}

impl AcceptItem {
    /// Number of wildcard positions; fewer means more specific.
    pub fn wildcards(&self) -> u8 {
        u8::from(self.media_type.type_() == mime::STAR)
            + u8::from(self.media_type.subtype() == mime::STAR)
    }
}

fn quality(m: &Mime) -> f32 {
    m.get_param("q")
        .and_then(|v| v.as_str().parse::<f32>().ok())
        .unwrap_or(1.0)
        .clamp(0.0, 1.0)
}

/// Drop a `q` parameter, keeping everything else.
fn without_quality(m: &Mime) -> Mime {
    if m.get_param("q").is_none() {
        return m.clone();
    }
    let mut s = m.essence_str().to_string();
    for (name, value) in m.params() {
        if name != "q" {
            s.push_str("; ");
            s.push_str(name.as_str());
            s.push('=');
            s.push_str(value.as_str());
        }
    }
    s.parse().unwrap_or_else(|_| m.clone())
}

/// Parse every `Accept` header into a list sorted by (q desc, fewer
/// wildcards first, lexicographic type). Unparseable entries are skipped.
pub fn parse_accept(headers: &HeaderMap) -> Vec<AcceptItem> {
    let mut items = Vec::new();
    for value in headers.get_all(header::ACCEPT) {
        let Ok(s) = value.to_str() else { continue };
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Ok(media_type) = part.parse::<Mime>() else {
                continue;
            };
            let q = quality(&media_type);
            items.push(AcceptItem {
                media_type: without_quality(&media_type),
                q,
            });
        }
    }
    sort_accept(&mut items);
    items
}

fn sort_accept(items: &mut [AcceptItem]) {
    items.sort_by(|a, b| {
        // f32 keys mapped to integers for a total order; q is clamped to [0, 1].
        let qa = (a.q * 1000.0) as u32;
        let qb = (b.q * 1000.0) as u32;
        qb.cmp(&qa)
            .then_with(|| a.wildcards().cmp(&b.wildcards()))
            .then_with(|| a.media_type.essence_str().cmp(b.media_type.essence_str()))
    });
}

/// The request's `Content-Type`, if present and well-formed.
pub fn parse_content_type(headers: &HeaderMap) -> Option<Mime> {
    headers
        .get(header::CONTENT_TYPE)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Whether the (possibly wildcarded) `range` covers the concrete `mt`.
/// A concrete range also covers `+suffix` structured syntaxes, so
/// `application/json` accepts `application/foo+json`.
pub fn media_type_matches(range: &Mime, mt: &Mime) -> bool {
    if range.type_() != mime::STAR && range.type_() != mt.type_() {
        return false;
    }
    if range.subtype() == mime::STAR || range.subtype() == mt.subtype() {
        return true;
    }
    matches!(mt.suffix(), Some(suffix) if suffix == range.subtype())
}

/// Outcome of response-type negotiation.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub media_type: Mime,
    /// True when the selected type carried full preference on both sides
    /// (client q and producible q both 1).
    pub full_preference: bool,
}

/// Pick the best producible type for the request's accept list.
///
/// Each declared producible type is scored by the highest client q among
/// the accept entries covering it, weighted by its own declared q; the
/// highest-scoring producible wins, earlier declaration breaking ties. An
/// empty accept list accepts anything at full preference.
pub fn negotiate(produces: &[Mime], accept: &[AcceptItem]) -> Option<Negotiated> {
    if produces.is_empty() {
        return None;
    }
    if accept.is_empty() {
        let first = &produces[0];
        return Some(Negotiated {
            media_type: without_quality(first),
            full_preference: quality(first) >= 1.0,
        });
    }

    let mut best: Option<(f32, &Mime)> = None;
    for produce in produces {
        let server_q = quality(produce);
        if server_q == 0.0 {
            continue;
        }
        let client_q = accept
            .iter()
            .filter(|item| item.q > 0.0 && media_type_matches(&item.media_type, produce))
            .map(|item| item.q)
            .fold(None::<f32>, |acc, q| Some(acc.map_or(q, |a| a.max(q))));
        if let Some(client_q) = client_q {
            let score = client_q * server_q;
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, produce));
            }
        }
    }
    best.map(|(score, produce)| Negotiated {
        media_type: without_quality(produce),
        full_preference: score >= 1.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(accept: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::ACCEPT, accept.parse().unwrap());
        h
    }

    #[test]
    fn test_accept_sorted_by_quality_then_specificity() {
        let items = parse_accept(&headers(
            "text/*;q=0.5, application/json, */*;q=0.1, text/plain;q=0.5",
        ));
        let order: Vec<_> = items
            .iter()
            .map(|i| i.media_type.essence_str().to_string())
            .collect();
        assert_eq!(
            order,
            ["application/json", "text/plain", "text/*", "*/*"]
        );
    }

    #[test]
    fn test_negotiate_prefers_server_quality() {
        let produces: Vec<Mime> = vec![
            "application/json".parse().unwrap(),
            "text/plain; q=0.5".parse().unwrap(),
        ];
        let accept = parse_accept(&headers("text/plain"));
        let negotiated = negotiate(&produces, &accept).unwrap();
        assert_eq!(negotiated.media_type, mime::TEXT_PLAIN);
        assert!(!negotiated.full_preference);
    }

    #[test]
    fn test_negotiate_full_preference() {
        let produces: Vec<Mime> = vec!["application/json".parse().unwrap()];
        let accept = parse_accept(&headers("application/*"));
        let negotiated = negotiate(&produces, &accept).unwrap();
        assert_eq!(negotiated.media_type, mime::APPLICATION_JSON);
        assert!(negotiated.full_preference);
    }

    #[test]
    fn test_negotiate_no_overlap() {
        let produces: Vec<Mime> = vec!["application/json".parse().unwrap()];
        let accept = parse_accept(&headers("text/plain"));
        assert!(negotiate(&produces, &accept).is_none());
    }

    #[test]
    fn test_empty_accept_takes_first_produce() {
        let produces: Vec<Mime> = vec![
            "text/html".parse().unwrap(),
            "application/json".parse().unwrap(),
        ];
        let negotiated = negotiate(&produces, &[]).unwrap();
        assert_eq!(negotiated.media_type, mime::TEXT_HTML);
        assert!(negotiated.full_preference);
    }

    #[test]
    fn test_suffix_match() {
        let range: Mime = "application/json".parse().unwrap();
        let concrete: Mime = "application/problem+json".parse().unwrap();
        assert!(media_type_matches(&range, &concrete));
        assert!(!media_type_matches(&concrete, &range));
    }
}
