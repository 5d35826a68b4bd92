// Phase tracer - per-request connection timing
//
// The upstream connector stamps instants into a record registered when the
// request enters the proxy and folded into the final capture when the
// response finishes. Records are keyed by a process-local token minted per
// request; each key has exactly one writer (the owning request), the map
// mutex only guards membership.

use crate::capture::CaptureTimings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Timing endpoints for one transaction. A missing endpoint simply leaves
/// its span at zero.
#[derive(Debug, Clone)]
pub struct Phases {
    /// Dial start; anchor for the total round-trip span
    pub started: Instant,
    pub dns_start: Option<Instant>,
    pub dns_end: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_end: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_end: Option<Instant>,
    /// Request fully written to the transport
    pub wrote_request: Option<Instant>,
    /// First response byte (headers) received
    pub first_byte: Option<Instant>,
    /// Last response body byte received
    pub body_end: Option<Instant>,
    /// ALPN negotiated h2 on the upstream leg
    pub alpn_h2: bool,
    /// Origin socket address once the dial completed
    pub remote_addr: String,
    /// An existing upstream transport served this exchange
    pub reused: bool,
}

impl Default for Phases {
    fn default() -> Self {
        Phases {
            started: Instant::now(),
            dns_start: None,
            dns_end: None,
            connect_start: None,
            connect_end: None,
            tls_start: None,
            tls_end: None,
            wrote_request: None,
            first_byte: None,
            body_end: None,
            alpn_h2: false,
            remote_addr: String::new(),
            reused: false,
        }
    }
}

fn span_ms(start: Option<Instant>, end: Option<Instant>) -> u64 {
    match (start, end) {
        // Zero is reserved for "endpoint missing", so a completed phase
        // reports at least 1ms even when it was faster than the clock
        (Some(s), Some(e)) if e >= s => (e.duration_since(s).as_millis() as u64).max(1),
        _ => 0,
    }
}

impl Phases {
    /// Derived millisecond spans; zero marks a phase that never completed.
    pub fn spans(&self) -> CaptureTimings {
        CaptureTimings {
            dns_ms: span_ms(self.dns_start, self.dns_end),
            connect_ms: span_ms(self.connect_start, self.connect_end),
            tls_ms: span_ms(self.tls_start, self.tls_end),
            write_ms: span_ms(
                self.tls_end.or(self.connect_end).or(Some(self.started)),
                self.wrote_request,
            ),
            ttfb_ms: span_ms(self.wrote_request, self.first_byte),
            read_ms: span_ms(self.first_byte, self.body_end),
            total_ms: span_ms(Some(self.started), self.body_end.or(self.first_byte)),
        }
    }
}

/// Registry of in-flight phase records
pub struct PhaseTracer {
    records: Mutex<HashMap<u64, Phases>>,
    next_token: AtomicU64,
}

impl PhaseTracer {
    pub fn new() -> Self {
        PhaseTracer {
            records: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Mint a request token and register a fresh record under it.
    pub fn register(&self) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .expect("phase map lock poisoned")
            .insert(token, Phases::default());
        token
    }

    /// Stamp the record for `token`. Unknown tokens are ignored (the
    /// request may have been cleaned up by a disconnect).
    pub fn record(&self, token: u64, f: impl FnOnce(&mut Phases)) {
        if let Some(phases) = self
            .records
            .lock()
            .expect("phase map lock poisoned")
            .get_mut(&token)
        {
            f(phases);
        }
    }

    /// Remove and return the record; called exactly once at fold-in.
    pub fn take(&self, token: u64) -> Option<Phases> {
        self.records
            .lock()
            .expect("phase map lock poisoned")
            .remove(&token)
    }

    pub fn in_flight(&self) -> usize {
        self.records.lock().expect("phase map lock poisoned").len()
    }
}

impl Default for PhaseTracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn register_take_lifecycle() {
        let tracer = PhaseTracer::new();
        let a = tracer.register();
        let b = tracer.register();
        assert_ne!(a, b);
        assert_eq!(tracer.in_flight(), 2);

        tracer.record(a, |p| p.alpn_h2 = true);
        let taken = tracer.take(a).unwrap();
        assert!(taken.alpn_h2);
        assert_eq!(tracer.in_flight(), 1);
        assert!(tracer.take(a).is_none());
    }

    #[test]
    fn record_on_unknown_token_is_ignored() {
        let tracer = PhaseTracer::new();
        tracer.record(42, |p| p.alpn_h2 = true);
        assert_eq!(tracer.in_flight(), 0);
    }

    #[test]
    fn spans_zero_when_endpoints_missing() {
        let phases = Phases::default();
        let spans = phases.spans();
        assert_eq!(spans.dns_ms, 0);
        assert_eq!(spans.tls_ms, 0);
        assert_eq!(spans.ttfb_ms, 0);
        assert_eq!(spans.total_ms, 0);
    }

    #[test]
    fn spans_reflect_stamped_instants() {
        let t0 = Instant::now();
        let phases = Phases {
            started: t0,
            dns_start: Some(t0),
            dns_end: Some(t0 + Duration::from_millis(5)),
            connect_start: Some(t0 + Duration::from_millis(5)),
            connect_end: Some(t0 + Duration::from_millis(20)),
            tls_start: Some(t0 + Duration::from_millis(20)),
            tls_end: Some(t0 + Duration::from_millis(50)),
            wrote_request: Some(t0 + Duration::from_millis(52)),
            first_byte: Some(t0 + Duration::from_millis(90)),
            body_end: Some(t0 + Duration::from_millis(100)),
            ..Default::default()
        };
        let spans = phases.spans();
        assert_eq!(spans.dns_ms, 5);
        assert_eq!(spans.connect_ms, 15);
        assert_eq!(spans.tls_ms, 30);
        assert_eq!(spans.write_ms, 2);
        assert_eq!(spans.ttfb_ms, 38);
        assert_eq!(spans.read_ms, 10);
        assert_eq!(spans.total_ms, 100);
    }
}
