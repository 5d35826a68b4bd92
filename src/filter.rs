// Filter evaluator - the small query language shared by capture-list
// filtering and color-rule matching
//
// A query is whitespace-split into terms that are ANDed together. Each term
// either targets one field ("method:GET", "status:4", "header:accept=json")
// or, with no prefix, contains-matches across the whole capture. Any value
// written as /pattern/flags is treated as a regex with the flags passed
// through as inline modifiers.

use crate::capture::{Capture, HeaderMap};
use regex::Regex;

/// A parsed match value: plain contains-match or compiled regex
#[derive(Debug, Clone)]
enum Matcher {
    /// Case-sensitive substring match on the raw needle
    Contains(String),
    /// Case-insensitive equality (used where the grammar says "exact")
    Exact(String),
    Regex(Regex),
}

impl Matcher {
    /// Parse a value, honoring the /pattern/flags regex form.
    /// `exact` selects equality instead of contains for the plain form.
    fn parse(value: &str, exact: bool) -> Matcher {
        if let Some(re) = parse_regex(value) {
            return Matcher::Regex(re);
        }
        if exact {
            Matcher::Exact(value.to_string())
        } else {
            Matcher::Contains(value.to_string())
        }
    }

    fn matches(&self, haystack: &str) -> bool {
        match self {
            Matcher::Contains(needle) => haystack.contains(needle.as_str()),
            Matcher::Exact(want) => haystack.eq_ignore_ascii_case(want),
            Matcher::Regex(re) => re.is_match(haystack),
        }
    }
}

/// Recognize /pattern/flags and compile it with the flags as inline
/// modifiers ("(?i)pattern"). Returns None for plain values and for
/// patterns that fail to compile (those fall back to contains-match).
fn parse_regex(value: &str) -> Option<Regex> {
    if value.len() < 2 || !value.starts_with('/') {
        return None;
    }
    let end = value.rfind('/')?;
    if end == 0 {
        return None;
    }
    let pattern = &value[1..end];
    let flags = &value[end + 1..];
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    };
    Regex::new(&full).ok()
}

/// One AND-combined term of a query
#[derive(Debug, Clone)]
enum Term {
    Method(Matcher),
    Status(Matcher),
    /// Single digit 1-5: prefix match on the status string
    StatusClass(char),
    Host(Matcher),
    Url(Matcher),
    /// Either body
    Body(Matcher),
    ReqBody(Matcher),
    RespBody(Matcher),
    /// side: None = both, Some(true) = request, Some(false) = response
    Header {
        side: Option<bool>,
        name: Matcher,
        value: Option<Matcher>,
    },
    /// Bare token: contains-match across the whole capture
    Any(String),
}

/// A parsed filter query. Compile once, evaluate many times.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    terms: Vec<Term>,
}

impl Filter {
    /// Parse a query string. Empty and whitespace-only queries produce a
    /// filter that never matches.
    pub fn parse(query: &str) -> Filter {
        let terms = query.split_whitespace().map(parse_term).collect();
        Filter { terms }
    }

    /// True when every term matches. Empty queries never match.
    pub fn matches(&self, capture: &Capture) -> bool {
        if self.terms.is_empty() {
            return false;
        }
        self.terms.iter().all(|t| term_matches(t, capture))
    }
}

/// Convenience for one-shot evaluation.
pub fn matches(query: &str, capture: &Capture) -> bool {
    Filter::parse(query).matches(capture)
}

fn parse_term(token: &str) -> Term {
    if let Some(v) = token.strip_prefix("method:") {
        return Term::Method(Matcher::parse(v, true));
    }
    if let Some(v) = token.strip_prefix("status:") {
        let mut chars = v.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if ('1'..='5').contains(&c) {
                return Term::StatusClass(c);
            }
        }
        return Term::Status(Matcher::parse(v, false));
    }
    if let Some(v) = token.strip_prefix("host:") {
        return Term::Host(Matcher::parse(v, true));
    }
    if let Some(v) = token.strip_prefix("url:") {
        return Term::Url(Matcher::parse(v, false));
    }
    if let Some(v) = token.strip_prefix("req.body:") {
        return Term::ReqBody(Matcher::parse(v, false));
    }
    if let Some(v) = token.strip_prefix("resp.body:") {
        return Term::RespBody(Matcher::parse(v, false));
    }
    if let Some(v) = token.strip_prefix("body:") {
        return Term::Body(Matcher::parse(v, false));
    }
    for (prefix, side) in [
        ("req.header:", Some(true)),
        ("resp.header:", Some(false)),
        ("header:", None),
    ] {
        if let Some(v) = token.strip_prefix(prefix) {
            let (name, value) = match v.split_once('=') {
                Some((n, val)) => (n, Some(Matcher::parse(val, false))),
                None => (v, None),
            };
            return Term::Header {
                side,
                name: Matcher::parse(name, false),
                value,
            };
        }
    }
    Term::Any(token.to_string())
}

fn term_matches(term: &Term, c: &Capture) -> bool {
    match term {
        Term::Method(m) => m.matches(&c.method),
        Term::Status(m) => m.matches(&status_string(c)),
        Term::StatusClass(digit) => status_string(c).starts_with(*digit),
        Term::Host(m) => m.matches(&c.host()),
        Term::Url(m) => m.matches(&c.url),
        Term::Body(m) => m.matches(&c.request_body) || m.matches(&c.response_body),
        Term::ReqBody(m) => m.matches(&c.request_body),
        Term::RespBody(m) => m.matches(&c.response_body),
        Term::Header { side, name, value } => {
            let req = side.unwrap_or(true);
            let resp = !side.unwrap_or(false);
            (req && header_matches(&c.request_headers, name, value.as_ref()))
                || (resp && header_matches(&c.response_headers, name, value.as_ref()))
        }
        Term::Any(needle) => any_matches(needle, c),
    }
}

fn status_string(c: &Capture) -> String {
    if c.response_status == 0 {
        String::new()
    } else {
        c.response_status.to_string()
    }
}

/// Match a header term against one side. Multi-value headers are joined by
/// ", " before value matching, mirroring how they render in the UI.
fn header_matches(headers: &HeaderMap, name: &Matcher, value: Option<&Matcher>) -> bool {
    headers.iter().any(|(n, vals)| {
        if !name.matches(n) {
            return false;
        }
        match value {
            None => true,
            Some(m) => m.matches(&vals.join(", ")),
        }
    })
}

/// Bare-token match: URL, method, status string, host, both bodies, and
/// both header sides (names and joined values).
fn any_matches(needle: &str, c: &Capture) -> bool {
    if c.url.contains(needle)
        || c.method.contains(needle)
        || status_string(c).contains(needle)
        || c.host().contains(needle)
        || c.request_body.contains(needle)
        || c.response_body.contains(needle)
    {
        return true;
    }
    let header_hit = |headers: &HeaderMap| {
        headers
            .iter()
            .any(|(n, vals)| n.contains(needle) || vals.join(", ").contains(needle))
    };
    header_hit(&c.request_headers) || header_hit(&c.response_headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn capture(method: &str, url: &str, status: u16) -> Capture {
        Capture {
            method: method.into(),
            url: url.into(),
            response_status: status,
            ..Default::default()
        }
    }

    #[test]
    fn empty_query_never_matches() {
        let c = capture("GET", "http://example.test/", 200);
        assert!(!matches("", &c));
        assert!(!matches("   ", &c));
    }

    #[test]
    fn method_is_exact_case_insensitive() {
        let c = capture("GET", "http://example.test/", 200);
        assert!(matches("method:get", &c));
        assert!(matches("method:GET", &c));
        assert!(!matches("method:GE", &c));
        assert!(!matches("method:POST", &c));
    }

    #[test]
    fn method_regex_form() {
        let c = capture("DELETE", "http://example.test/", 200);
        assert!(matches("method:/del.*/i", &c));
        assert!(!matches("method:/^get$/i", &c));
    }

    #[test]
    fn status_single_digit_is_class_prefix() {
        assert!(matches(
            "status:4",
            &capture("GET", "http://a.test/", 404)
        ));
        assert!(matches(
            "status:4",
            &capture("GET", "http://a.test/", 418)
        ));
        assert!(!matches(
            "status:4",
            &capture("GET", "http://a.test/", 500)
        ));
        // No status recorded: no class matches
        assert!(!matches("status:5", &capture("GET", "http://a.test/", 0)));
    }

    #[test]
    fn status_multi_digit_is_contains() {
        assert!(matches(
            "status:404",
            &capture("GET", "http://a.test/", 404)
        ));
        assert!(matches("status:04", &capture("GET", "http://a.test/", 404)));
        assert!(!matches(
            "status:200",
            &capture("GET", "http://a.test/", 404)
        ));
    }

    #[test]
    fn host_exact_and_regex() {
        let c = capture("GET", "https://api.example.test/v1", 200);
        assert!(matches("host:API.example.test", &c));
        assert!(!matches("host:example.test", &c));
        assert!(matches("host:/example/", &c));
    }

    #[test]
    fn url_contains() {
        let c = capture("GET", "https://api.example.test/v1/items?page=2", 200);
        assert!(matches("url:/v1/items", &c));
        assert!(matches("url:page=2", &c));
        assert!(!matches("url:page=3", &c));
    }

    #[test]
    fn body_terms_pick_sides() {
        let mut c = capture("POST", "http://a.test/", 200);
        c.request_body = "hello request".into();
        c.response_body = "hello response".into();
        assert!(matches("body:hello", &c));
        assert!(matches("req.body:request", &c));
        assert!(!matches("req.body:response", &c));
        assert!(matches("resp.body:response", &c));
        assert!(!matches("resp.body:request", &c));
    }

    #[test]
    fn header_name_and_value_matching() {
        let mut c = capture("GET", "http://a.test/", 200);
        let mut req: HashMap<String, Vec<String>> = HashMap::new();
        req.insert("accept".into(), vec!["application/json".into()]);
        c.request_headers = req;
        let mut resp: HashMap<String, Vec<String>> = HashMap::new();
        resp.insert(
            "set-cookie".into(),
            vec!["a=1".into(), "b=2".into()],
        );
        c.response_headers = resp;

        // Name-only match
        assert!(matches("header:accept", &c));
        assert!(matches("req.header:accept", &c));
        assert!(!matches("resp.header:accept", &c));

        // Name=value match
        assert!(matches("header:accept=json", &c));
        assert!(!matches("header:accept=xml", &c));

        // Multi-value lists are joined with ", "
        assert!(matches("resp.header:set-cookie=a=1, b=2", &c));

        // Regex on the value side
        assert!(matches("header:accept=/^application/", &c));
    }

    #[test]
    fn bare_token_spans_the_capture() {
        let mut c = capture("GET", "http://api.example.test/data", 404);
        c.response_body = "not found".into();
        assert!(matches("example", &c));
        assert!(matches("404", &c));
        assert!(matches("found", &c));
        assert!(!matches("elsewhere", &c));
    }

    #[test]
    fn terms_combine_with_and() {
        let captures = [
            capture("GET", "http://t/a", 200),
            capture("POST", "http://t/b", 500),
            capture("GET", "http://t/c", 404),
        ];
        let hits: Vec<&Capture> = captures
            .iter()
            .filter(|c| matches("method:GET status:4", c))
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "http://t/c");
    }

    /// Grammar equivalence check against by-hand regex evaluation for
    /// AND-combined terms.
    #[test]
    fn evaluator_agrees_with_regexified_terms() {
        let mut c = capture("PUT", "https://svc.test/update", 503);
        c.request_body = "payload-123".into();

        let query = "method:/^pu/i url:update status:5 body:/payload-\\d+/";
        assert!(matches(query, &c));

        let by_hand = Regex::new("(?i)^pu").unwrap().is_match(&c.method)
            && c.url.contains("update")
            && c.response_status.to_string().starts_with('5')
            && (Regex::new("payload-\\d+").unwrap().is_match(&c.request_body)
                || Regex::new("payload-\\d+").unwrap().is_match(&c.response_body));
        assert!(by_hand);

        c.response_status = 200;
        assert!(!matches(query, &c));
    }

    #[test]
    fn invalid_regex_falls_back_to_contains() {
        let c = capture("GET", "http://a.test/literal/(/x", 200);
        // "/(/" does not compile; treated as the literal substring "/(/"
        assert!(matches("url:/(/", &c));
    }
}
