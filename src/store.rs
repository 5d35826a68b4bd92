// Capture store - fixed-capacity ring of recorded transactions
//
// The store is the only authority that assigns capture identities. All
// operations serialize under one mutex and never touch I/O; persistence
// works from the defensive copies returned by list().

use crate::capture::Capture;
use std::sync::Mutex;

/// Thread-safe bounded store, oldest-first iteration order
pub struct CaptureStore {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Ring slots in insertion order starting at `cursor`
    ring: Vec<Capture>,
    /// Next write position
    cursor: usize,
    /// Live entries, <= capacity
    len: usize,
    capacity: usize,
    /// Next identity to assign; never reset, survives clear()
    next_id: u64,
}

impl CaptureStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        CaptureStore {
            inner: Mutex::new(Inner {
                ring: Vec::with_capacity(capacity),
                cursor: 0,
                len: 0,
                capacity,
                next_id: 1,
            }),
        }
    }

    /// Assign the next identity and insert, overwriting the oldest entry
    /// when full. Returns the stored capture.
    pub fn add(&self, mut capture: Capture) -> Capture {
        let mut inner = self.inner.lock().expect("capture store lock poisoned");
        capture.id = inner.next_id;
        inner.next_id += 1;

        let cursor = inner.cursor;
        if inner.ring.len() < inner.capacity {
            inner.ring.push(capture.clone());
        } else {
            inner.ring[cursor] = capture.clone();
        }
        inner.cursor = (cursor + 1) % inner.capacity;
        if inner.len < inner.capacity {
            inner.len += 1;
        }
        capture
    }

    /// Snapshot, oldest first. A defensive copy: later mutations do not
    /// affect the returned order.
    pub fn list(&self) -> Vec<Capture> {
        let inner = self.inner.lock().expect("capture store lock poisoned");
        inner.ordered()
    }

    pub fn get(&self, id: u64) -> Option<Capture> {
        let inner = self.inner.lock().expect("capture store lock poisoned");
        inner.ring.iter().find(|c| c.id == id).cloned()
    }

    /// Remove one capture. Rebuilds the live set without the match so the
    /// ring stays densely packed in insertion order.
    pub fn delete(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().expect("capture store lock poisoned");
        let before = inner.ring.len();
        let mut kept = inner.ordered();
        kept.retain(|c| c.id != id);
        if kept.len() == before {
            return false;
        }
        inner.len = kept.len();
        inner.cursor = kept.len() % inner.capacity;
        inner.ring = kept;
        true
    }

    /// Rename in place; returns the updated capture, or None for a bad id.
    pub fn update_name(&self, id: u64, name: &str) -> Option<Capture> {
        let mut inner = self.inner.lock().expect("capture store lock poisoned");
        let found = inner.ring.iter_mut().find(|c| c.id == id)?;
        found.name = name.to_string();
        Some(found.clone())
    }

    /// Drop every capture. The identity sequence is deliberately not reset.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("capture store lock poisoned");
        inner.ring.clear();
        inner.cursor = 0;
        inner.len = 0;
    }

    /// Seed the ring from a loaded snapshot. Keeps the newest suffix if the
    /// slice exceeds capacity and pushes the identity sequence past every
    /// pre-existing id.
    pub fn populate(&self, captures: Vec<Capture>) {
        let mut inner = self.inner.lock().expect("capture store lock poisoned");
        let max_id = captures.iter().map(|c| c.id).max().unwrap_or(0);
        let capacity = inner.capacity;
        let skip = captures.len().saturating_sub(capacity);
        inner.ring = captures.into_iter().skip(skip).collect();
        inner.len = inner.ring.len();
        inner.cursor = inner.len % capacity;
        if max_id >= inner.next_id {
            inner.next_id = max_id + 1;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("capture store lock poisoned").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// Live entries in insertion order. When the ring has wrapped, the
    /// oldest entry sits at `cursor`.
    fn ordered(&self) -> Vec<Capture> {
        if self.ring.len() < self.capacity {
            return self.ring.clone();
        }
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(&self.ring[self.cursor..]);
        out.extend_from_slice(&self.ring[..self.cursor]);
        out
    }
}
