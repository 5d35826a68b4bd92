// Built-in analyzers - small independent aggregators over the observation
// feed. Each guards its own state; the sink never sees inside.

use super::{ObservedRequest, Outcome, RequestAnalyzer, RouteKey};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Per-route latency aggregation: count, mean, max
pub struct RouteLatencyAnalyzer {
    routes: Mutex<HashMap<RouteKey, RouteStats>>,
}

#[derive(Debug, Default, Clone)]
struct RouteStats {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

impl RouteLatencyAnalyzer {
    pub fn new() -> Self {
        RouteLatencyAnalyzer {
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RouteLatencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAnalyzer for RouteLatencyAnalyzer {
    fn name(&self) -> &'static str {
        "route_latency"
    }

    fn on_request(&self, event: &ObservedRequest) {
        let mut routes = self.routes.lock().expect("route stats lock poisoned");
        let stats = routes.entry(event.route.clone()).or_default();
        stats.count += 1;
        stats.total_ms += event.latency_ms;
        stats.max_ms = stats.max_ms.max(event.latency_ms);
    }

    fn snapshot(&self) -> serde_json::Value {
        let routes = self.routes.lock().expect("route stats lock poisoned");
        let mut entries: Vec<serde_json::Value> = routes
            .iter()
            .map(|(key, stats)| {
                json!({
                    "host": key.host,
                    "path": key.path,
                    "method": key.method,
                    "count": stats.count,
                    "avg_ms": stats.total_ms / stats.count.max(1),
                    "max_ms": stats.max_ms,
                })
            })
            .collect();
        // Busiest routes first so the snapshot reads top-down
        entries.sort_by_key(|e| std::cmp::Reverse(e["count"].as_u64().unwrap_or(0)));
        serde_json::Value::Array(entries)
    }
}

/// Outcome class counters
pub struct OutcomeAnalyzer {
    counts: Mutex<HashMap<Outcome, u64>>,
}

impl OutcomeAnalyzer {
    pub fn new() -> Self {
        OutcomeAnalyzer {
            counts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for OutcomeAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAnalyzer for OutcomeAnalyzer {
    fn name(&self) -> &'static str {
        "outcomes"
    }

    fn on_request(&self, event: &ObservedRequest) {
        *self
            .counts
            .lock()
            .expect("outcome counts lock poisoned")
            .entry(event.outcome)
            .or_insert(0) += 1;
    }

    fn snapshot(&self) -> serde_json::Value {
        let counts = self.counts.lock().expect("outcome counts lock poisoned");
        let get = |o: Outcome| counts.get(&o).copied().unwrap_or(0);
        json!({
            "2xx": get(Outcome::Success2xx),
            "3xx": get(Outcome::Redirect3xx),
            "4xx": get(Outcome::ClientError4xx),
            "5xx": get(Outcome::ServerError5xx),
            "network-error": get(Outcome::NetworkError),
            "other": get(Outcome::Other),
        })
    }
}

/// Requests per minute, bounded to the most recent window
pub struct TemporalAnalyzer {
    buckets: Mutex<VecDeque<(i64, u64)>>,
}

/// Minutes of history kept
const TEMPORAL_WINDOW: usize = 240;

impl TemporalAnalyzer {
    pub fn new() -> Self {
        TemporalAnalyzer {
            buckets: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for TemporalAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAnalyzer for TemporalAnalyzer {
    fn name(&self) -> &'static str {
        "temporal"
    }

    fn on_request(&self, event: &ObservedRequest) {
        let minute = event.timestamp.timestamp() / 60;
        let mut buckets = self.buckets.lock().expect("temporal lock poisoned");
        match buckets.back_mut() {
            Some((m, count)) if *m == minute => *count += 1,
            _ => {
                buckets.push_back((minute, 1));
                if buckets.len() > TEMPORAL_WINDOW {
                    buckets.pop_front();
                }
            }
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        let buckets = self.buckets.lock().expect("temporal lock poisoned");
        serde_json::Value::Array(
            buckets
                .iter()
                .map(|(minute, count)| json!({ "minute": minute * 60, "count": count }))
                .collect(),
        )
    }
}

/// Outcome transitions per route: how a route's results change from one
/// request to the next (healthy -> failing flips show up here first)
pub struct ErrorTransitionAnalyzer {
    routes: Mutex<HashMap<RouteKey, TransitionState>>,
}

#[derive(Debug, Default)]
struct TransitionState {
    last: Option<Outcome>,
    /// (from, to) -> count, only tracked when from != to
    flips: HashMap<(Outcome, Outcome), u64>,
}

impl ErrorTransitionAnalyzer {
    pub fn new() -> Self {
        ErrorTransitionAnalyzer {
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ErrorTransitionAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAnalyzer for ErrorTransitionAnalyzer {
    fn name(&self) -> &'static str {
        "error_transitions"
    }

    fn on_request(&self, event: &ObservedRequest) {
        let mut routes = self.routes.lock().expect("transition lock poisoned");
        let state = routes.entry(event.route.clone()).or_default();
        if let Some(last) = state.last {
            if last != event.outcome {
                *state.flips.entry((last, event.outcome)).or_insert(0) += 1;
            }
        }
        state.last = Some(event.outcome);
    }

    fn snapshot(&self) -> serde_json::Value {
        let routes = self.routes.lock().expect("transition lock poisoned");
        let entries: Vec<serde_json::Value> = routes
            .iter()
            .filter(|(_, state)| !state.flips.is_empty())
            .map(|(key, state)| {
                let flips: Vec<serde_json::Value> = state
                    .flips
                    .iter()
                    .map(|((from, to), count)| {
                        json!({ "from": from, "to": to, "count": count })
                    })
                    .collect();
                json!({
                    "host": key.host,
                    "path": key.path,
                    "method": key.method,
                    "transitions": flips,
                })
            })
            .collect();
        serde_json::Value::Array(entries)
    }
}

/// Byte volume per route, both directions
pub struct SizeAnalyzer {
    routes: Mutex<HashMap<RouteKey, SizeStats>>,
}

#[derive(Debug, Default)]
struct SizeStats {
    count: u64,
    request_bytes: u64,
    response_bytes: u64,
    max_response: u64,
}

impl SizeAnalyzer {
    pub fn new() -> Self {
        SizeAnalyzer {
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SizeAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAnalyzer for SizeAnalyzer {
    fn name(&self) -> &'static str {
        "sizes"
    }

    fn on_request(&self, event: &ObservedRequest) {
        let mut routes = self.routes.lock().expect("size lock poisoned");
        let stats = routes.entry(event.route.clone()).or_default();
        stats.count += 1;
        stats.request_bytes += event.request_size as u64;
        stats.response_bytes += event.response_size as u64;
        stats.max_response = stats.max_response.max(event.response_size as u64);
    }

    fn snapshot(&self) -> serde_json::Value {
        let routes = self.routes.lock().expect("size lock poisoned");
        serde_json::Value::Array(
            routes
                .iter()
                .map(|(key, stats)| {
                    json!({
                        "host": key.host,
                        "path": key.path,
                        "method": key.method,
                        "count": stats.count,
                        "request_bytes": stats.request_bytes,
                        "response_bytes": stats.response_bytes,
                        "max_response_bytes": stats.max_response,
                    })
                })
                .collect(),
        )
    }
}

/// Clients by auth fingerprint: how many distinct credentials hit the
/// proxy and what they touched. Only ever sees the hashed fingerprint.
pub struct ClientFingerprintAnalyzer {
    clients: Mutex<HashMap<String, ClientStats>>,
}

#[derive(Debug, Default)]
struct ClientStats {
    count: u64,
    routes: HashSet<RouteKey>,
    user_agents: HashSet<String>,
}

impl ClientFingerprintAnalyzer {
    pub fn new() -> Self {
        ClientFingerprintAnalyzer {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ClientFingerprintAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAnalyzer for ClientFingerprintAnalyzer {
    fn name(&self) -> &'static str {
        "clients"
    }

    fn on_request(&self, event: &ObservedRequest) {
        let Some(fingerprint) = &event.auth_fingerprint else {
            return;
        };
        let mut clients = self.clients.lock().expect("client lock poisoned");
        let stats = clients.entry(fingerprint.clone()).or_default();
        stats.count += 1;
        stats.routes.insert(event.route.clone());
        if !event.client.user_agent.is_empty() {
            stats.user_agents.insert(event.client.user_agent.clone());
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        let clients = self.clients.lock().expect("client lock poisoned");
        serde_json::Value::Array(
            clients
                .iter()
                .map(|(fingerprint, stats)| {
                    json!({
                        "fingerprint": fingerprint,
                        "count": stats.count,
                        "distinct_routes": stats.routes.len(),
                        "user_agents": stats.user_agents.iter().collect::<Vec<_>>(),
                    })
                })
                .collect(),
        )
    }
}

/// Response profile per route: which content types and status codes a
/// route actually serves
pub struct ResponseProfileAnalyzer {
    routes: Mutex<HashMap<RouteKey, ProfileStats>>,
}

#[derive(Debug, Default)]
struct ProfileStats {
    statuses: HashMap<u16, u64>,
    content_types: HashMap<String, u64>,
}

impl ResponseProfileAnalyzer {
    pub fn new() -> Self {
        ResponseProfileAnalyzer {
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ResponseProfileAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAnalyzer for ResponseProfileAnalyzer {
    fn name(&self) -> &'static str {
        "response_profiles"
    }

    fn on_request(&self, event: &ObservedRequest) {
        let content_type = event
            .response_headers
            .get("content-type")
            .and_then(|v| v.first())
            .map(|v| {
                // Strip parameters; "application/json; charset=utf-8" and
                // plain "application/json" are the same profile
                v.split(';').next().unwrap_or(v).trim().to_string()
            })
            .unwrap_or_else(|| "(none)".to_string());

        let mut routes = self.routes.lock().expect("profile lock poisoned");
        let stats = routes.entry(event.route.clone()).or_default();
        *stats.statuses.entry(event.status).or_insert(0) += 1;
        *stats.content_types.entry(content_type).or_insert(0) += 1;
    }

    fn snapshot(&self) -> serde_json::Value {
        let routes = self.routes.lock().expect("profile lock poisoned");
        serde_json::Value::Array(
            routes
                .iter()
                .map(|(key, stats)| {
                    json!({
                        "host": key.host,
                        "path": key.path,
                        "method": key.method,
                        "statuses": stats
                            .statuses
                            .iter()
                            .map(|(s, c)| json!({ "status": s, "count": c }))
                            .collect::<Vec<_>>(),
                        "content_types": stats
                            .content_types
                            .iter()
                            .map(|(t, c)| json!({ "type": t, "count": c }))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect(),
        )
    }
}
