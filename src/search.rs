// Search history - remembered filter queries with pinning
//
// Queries are normalized (trimmed, inner whitespace collapsed) and unique;
// re-running a query bumps its use count and recency instead of duplicating
// it. Pinned items float above the rest, recency descending within each
// section, and the list is capacity-bounded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Most history items kept; the oldest unpinned entries fall off first.
const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchHistoryItem {
    #[serde(default)]
    pub id: u64,
    /// Normalized query string, unique within the store
    pub query: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default = "Utc::now")]
    pub last_used_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

pub struct SearchHistoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    items: Vec<SearchHistoryItem>,
    next_id: u64,
}

/// Collapse whitespace runs and trim; two visually identical queries must
/// compare equal.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl SearchHistoryStore {
    pub fn new() -> Self {
        SearchHistoryStore {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Sorted snapshot: pinned first, recency descending within sections.
    pub fn list(&self) -> Vec<SearchHistoryItem> {
        let inner = self.inner.lock().expect("search store lock poisoned");
        let mut items = inner.items.clone();
        items.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.last_used_at.cmp(&a.last_used_at))
        });
        items
    }

    /// Record a use of `query`, inserting it if new. Returns the item,
    /// or None for queries that normalize to empty.
    pub fn record_use(&self, query: &str) -> Option<SearchHistoryItem> {
        let query = normalize_query(query);
        if query.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock().expect("search store lock poisoned");
        if let Some(existing) = inner.items.iter_mut().find(|i| i.query == query) {
            existing.use_count += 1;
            existing.last_used_at = Utc::now();
            return Some(existing.clone());
        }

        let item = SearchHistoryItem {
            id: inner.next_id,
            query,
            use_count: 1,
            last_used_at: Utc::now(),
            created_at: Utc::now(),
            ..Default::default()
        };
        inner.next_id += 1;
        inner.items.push(item.clone());
        inner.enforce_capacity();
        Some(item)
    }

    /// Update label and/or pinned flag; None for a bad id.
    pub fn update(
        &self,
        id: u64,
        label: Option<String>,
        pinned: Option<bool>,
    ) -> Option<SearchHistoryItem> {
        let mut inner = self.inner.lock().expect("search store lock poisoned");
        let item = inner.items.iter_mut().find(|i| i.id == id)?;
        if let Some(label) = label {
            item.label = label;
        }
        if let Some(pinned) = pinned {
            item.pinned = pinned;
        }
        Some(item.clone())
    }

    pub fn delete(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().expect("search store lock poisoned");
        let before = inner.items.len();
        inner.items.retain(|i| i.id != id);
        inner.items.len() != before
    }

    /// Seed from a persistence snapshot, deduplicating on the normalized
    /// query and advancing the id sequence.
    pub fn populate(&self, items: Vec<SearchHistoryItem>) {
        let mut inner = self.inner.lock().expect("search store lock poisoned");
        inner.items.clear();
        for mut item in items {
            item.query = normalize_query(&item.query);
            if item.query.is_empty() {
                continue;
            }
            if inner.items.iter().any(|i| i.query == item.query) {
                continue;
            }
            if item.id >= inner.next_id {
                inner.next_id = item.id + 1;
            }
            inner.items.push(item);
        }
        inner.enforce_capacity();
    }
}

impl Inner {
    /// Evict least-recently-used unpinned items past capacity. Pinned items
    /// are evicted only if the whole list is pinned and still over budget.
    fn enforce_capacity(&mut self) {
        while self.items.len() > HISTORY_CAPACITY {
            let victim = self
                .items
                .iter()
                .enumerate()
                .filter(|(_, i)| !i.pinned)
                .min_by_key(|(_, i)| i.last_used_at)
                .or_else(|| {
                    self.items
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, i)| i.last_used_at)
                })
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => {
                    self.items.remove(idx);
                }
                None => break,
            }
        }
    }
}

impl Default for SearchHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_use_deduplicates_on_normalized_query() {
        let store = SearchHistoryStore::new();
        let a = store.record_use("method:GET  status:4").unwrap();
        let b = store.record_use("  method:GET status:4 ").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.use_count, 2);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn empty_queries_are_ignored() {
        let store = SearchHistoryStore::new();
        assert!(store.record_use("   ").is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn pinned_items_sort_first() {
        let store = SearchHistoryStore::new();
        let old = store.record_use("status:5").unwrap();
        store.record_use("method:GET").unwrap();
        store.record_use("host:api").unwrap();
        store.update(old.id, None, Some(true));

        let list = store.list();
        assert_eq!(list[0].query, "status:5");
        // Unpinned section is recency descending
        assert_eq!(list[1].query, "host:api");
        assert_eq!(list[2].query, "method:GET");
    }

    #[test]
    fn capacity_evicts_unpinned_lru_first() {
        let store = SearchHistoryStore::new();
        let pinned = store.record_use("keep-me").unwrap();
        store.update(pinned.id, None, Some(true));
        for i in 0..HISTORY_CAPACITY + 5 {
            store.record_use(&format!("query-{}", i));
        }
        let list = store.list();
        assert_eq!(list.len(), HISTORY_CAPACITY);
        assert!(list.iter().any(|i| i.query == "keep-me"));
        // The earliest unpinned queries fell off
        assert!(!list.iter().any(|i| i.query == "query-0"));
    }

    #[test]
    fn update_and_delete() {
        let store = SearchHistoryStore::new();
        let item = store.record_use("status:4").unwrap();
        let updated = store
            .update(item.id, Some("client errors".into()), None)
            .unwrap();
        assert_eq!(updated.label, "client errors");
        assert!(store.delete(item.id));
        assert!(!store.delete(item.id));
    }

    #[test]
    fn populate_dedups_and_advances_ids() {
        let store = SearchHistoryStore::new();
        let item = |id: u64, q: &str| SearchHistoryItem {
            id,
            query: q.into(),
            ..Default::default()
        };
        store.populate(vec![
            item(3, "status:5"),
            item(9, " status:5 "),
            item(5, "method:GET"),
        ]);
        assert_eq!(store.list().len(), 2);
        let fresh = store.record_use("brand new").unwrap();
        assert!(fresh.id > 9);
    }
}
