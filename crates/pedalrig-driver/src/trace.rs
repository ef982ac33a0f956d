//! Bounded trace ring for xrun-recovery forensics.
//!
//! The realtime thread records one entry per recovery step; the host can
//! dump the ring after the fact. Recording uses `try_lock` so a concurrent
//! dump can never stall the audio thread; a skipped entry during a dump is
//! an acceptable loss on a path that is already degraded.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Entries retained; older entries are overwritten.
const TRACE_CAPACITY: usize = 1000;

/// One recovery event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceEntry {
    /// Monotonic microseconds since driver activation.
    pub micros: u64,
    pub in_avail: i64,
    pub out_avail: i64,
    pub buffered_frames: i64,
    /// Single-character step code (`'r'` read recovery, `'w'` write
    /// recovery, `'x'` refill, `'R'` restart, ...).
    pub code: u8,
}

struct TraceRing {
    entries: Vec<TraceEntry>,
    next: usize,
    len: usize,
}

/// Shared handle: cloned into the realtime thread, dumped from the host.
#[derive(Clone)]
pub struct RecoveryTrace {
    ring: Arc<Mutex<TraceRing>>,
    epoch: Instant,
}

impl RecoveryTrace {
    pub fn new() -> Self {
        Self {
            ring: Arc::new(Mutex::new(TraceRing {
                entries: vec![TraceEntry::default(); TRACE_CAPACITY],
                next: 0,
                len: 0,
            })),
            epoch: Instant::now(),
        }
    }

    /// Records one entry. Realtime-safe: skips when the host is dumping.
    #[inline]
    pub fn record(&self, code: u8, in_avail: i64, out_avail: i64, buffered_frames: i64) {
        let Some(mut ring) = self.ring.try_lock() else {
            return;
        };
        let micros = self.epoch.elapsed().as_micros() as u64;
        let next = ring.next;
        ring.entries[next] = TraceEntry {
            micros,
            in_avail,
            out_avail,
            buffered_frames,
            code,
        };
        ring.next = (next + 1) % TRACE_CAPACITY;
        ring.len = (ring.len + 1).min(TRACE_CAPACITY);
    }

    /// Copies the retained entries, oldest first.
    pub fn dump(&self) -> Vec<TraceEntry> {
        let ring = self.ring.lock();
        let mut out = Vec::with_capacity(ring.len);
        let start = (ring.next + TRACE_CAPACITY - ring.len) % TRACE_CAPACITY;
        for i in 0..ring.len {
            out.push(ring.entries[(start + i) % TRACE_CAPACITY]);
        }
        out
    }
}

impl Default for RecoveryTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_dump_order() {
        let trace = RecoveryTrace::new();
        trace.record(b'r', 1, 2, 3);
        trace.record(b'w', 4, 5, 6);
        let entries = trace.dump();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].code, b'r');
        assert_eq!(entries[1].code, b'w');
        assert!(entries[0].micros <= entries[1].micros);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let trace = RecoveryTrace::new();
        for i in 0..(TRACE_CAPACITY + 10) {
            trace.record(b'r', i as i64, 0, 0);
        }
        let entries = trace.dump();
        assert_eq!(entries.len(), TRACE_CAPACITY);
        assert_eq!(entries[0].in_avail, 10);
        assert_eq!(entries.last().unwrap().in_avail, (TRACE_CAPACITY + 9) as i64);
    }
}
