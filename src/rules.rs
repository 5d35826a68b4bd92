// Color rules - ordered ruleset matched against captures via the filter
// evaluator
//
// Rules are kept sorted by priority descending (stable for ties) so that
// finding the winning rule is a single forward scan. The color string is
// opaque here; only the UI interprets it.

use crate::capture::Capture;
use crate::filter::Filter;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// One coloring rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColorRule {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Filter query in the shared query language
    #[serde(default)]
    pub query: String,
    /// Opaque color literal, passed through to the UI
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
}

/// Thread-safe ordered rule store. Reads vastly outnumber writes (every
/// capture render consults the rules), hence the RwLock.
pub struct ColorRuleStore {
    rules: RwLock<Vec<ColorRule>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ColorRuleStore {
    pub fn new() -> Self {
        ColorRuleStore {
            rules: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Built-in ruleset used when persistence has nothing to offer
    pub fn with_defaults() -> Self {
        let store = ColorRuleStore::new();
        store.replace(vec![
            ColorRule {
                name: "Server errors".into(),
                query: "status:5".into(),
                color: "red".into(),
                enabled: true,
                priority: 100,
                ..Default::default()
            },
            ColorRule {
                name: "Client errors".into(),
                query: "status:4".into(),
                color: "orange".into(),
                enabled: true,
                priority: 90,
                ..Default::default()
            },
            ColorRule {
                name: "Writes".into(),
                query: "method:POST".into(),
                color: "blue".into(),
                enabled: true,
                priority: 10,
                ..Default::default()
            },
            ColorRule {
                name: "Reads".into(),
                query: "method:GET".into(),
                color: "green".into(),
                enabled: true,
                priority: 0,
                ..Default::default()
            },
        ]);
        store
    }

    /// Snapshot of the rules in priority order
    pub fn get_all(&self) -> Vec<ColorRule> {
        self.rules.read().expect("rule store lock poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().expect("rule store lock poisoned").is_empty()
    }

    /// Atomically swap the ruleset. Missing ids are assigned, then the set
    /// is re-sorted by priority descending; ties keep the caller's order.
    pub fn replace(&self, mut rules: Vec<ColorRule>) {
        use std::sync::atomic::Ordering;

        let max_seen = rules.iter().map(|r| r.id).max().unwrap_or(0);
        self.next_id.fetch_max(max_seen + 1, Ordering::SeqCst);
        for rule in rules.iter_mut() {
            if rule.id == 0 {
                rule.id = self.next_id.fetch_add(1, Ordering::SeqCst);
            }
        }
        // Stable sort keeps insertion order among equal priorities
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

        *self.rules.write().expect("rule store lock poisoned") = rules;
    }

    /// First enabled rule whose query matches; None leaves the capture
    /// uncolored.
    pub fn find_matching_rule(&self, capture: &Capture) -> Option<ColorRule> {
        let rules = self.rules.read().expect("rule store lock poisoned");
        rules
            .iter()
            .find(|r| r.enabled && Filter::parse(&r.query).matches(capture))
            .cloned()
    }
}

impl Default for ColorRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(priority: i64, enabled: bool, query: &str, color: &str) -> ColorRule {
        ColorRule {
            query: query.into(),
            color: color.into(),
            enabled,
            priority,
            ..Default::default()
        }
    }

    fn capture(method: &str, status: u16) -> Capture {
        Capture {
            method: method.into(),
            url: "http://example.test/x".into(),
            response_status: status,
            ..Default::default()
        }
    }

    #[test]
    fn replace_sorts_by_priority_desc() {
        let store = ColorRuleStore::new();
        store.replace(vec![
            rule(0, true, "method:GET", "green"),
            rule(100, true, "status:5", "red"),
            rule(50, true, "status:4", "orange"),
        ]);
        let priorities: Vec<i64> = store.get_all().iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![100, 50, 0]);
    }

    #[test]
    fn replace_is_stable_for_ties() {
        let store = ColorRuleStore::new();
        store.replace(vec![
            rule(5, true, "method:GET", "first"),
            rule(5, true, "method:GET", "second"),
        ]);
        let colors: Vec<String> = store.get_all().into_iter().map(|r| r.color).collect();
        assert_eq!(colors, vec!["first", "second"]);
    }

    #[test]
    fn replace_assigns_missing_ids() {
        let store = ColorRuleStore::new();
        store.replace(vec![
            ColorRule {
                id: 7,
                ..rule(1, true, "status:5", "red")
            },
            rule(2, true, "status:4", "orange"),
        ]);
        let rules = store.get_all();
        assert!(rules.iter().all(|r| r.id != 0));
        // The fresh id must not collide with the preserved one
        let mut ids: Vec<u64> = rules.iter().map(|r| r.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn highest_priority_enabled_match_wins() {
        let store = ColorRuleStore::new();
        store.replace(vec![
            rule(100, true, "status:5", "red"),
            rule(0, true, "method:GET", "green"),
        ]);

        // GET with a 500: both queries match, priority decides
        let hit = store.find_matching_rule(&capture("GET", 500)).unwrap();
        assert_eq!(hit.color, "red");

        // GET with a 200: only the method rule matches
        let hit = store.find_matching_rule(&capture("GET", 200)).unwrap();
        assert_eq!(hit.color, "green");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let store = ColorRuleStore::new();
        store.replace(vec![
            rule(100, false, "status:5", "red"),
            rule(0, true, "status:5", "gray"),
        ]);
        let hit = store.find_matching_rule(&capture("GET", 502)).unwrap();
        assert_eq!(hit.color, "gray");
    }

    #[test]
    fn no_match_returns_none() {
        let store = ColorRuleStore::new();
        store.replace(vec![rule(0, true, "status:5", "red")]);
        assert!(store.find_matching_rule(&capture("GET", 200)).is_none());
    }

    #[test]
    fn defaults_color_the_obvious_classes() {
        let store = ColorRuleStore::with_defaults();
        assert_eq!(
            store.find_matching_rule(&capture("GET", 500)).unwrap().color,
            "red"
        );
        assert_eq!(
            store.find_matching_rule(&capture("POST", 201)).unwrap().color,
            "blue"
        );
    }
}
