use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightMarker {
    pub since: Instant,
    /// TTL breaches seen for this slot so far.
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    /// A previous attempt outlived the TTL; this is attempt `retries + 1`.
    Reclaimed { retries: u32 },
    /// Still marked and within the TTL.
    Busy,
    /// Breached the TTL too many times; the caller should skip the slot.
    Exhausted,
}

/// Node-local record of slots being worked on. Never replicated.
#[derive(Debug, Clone)]
pub struct InflightTable {
    entries: BTreeMap<u64, InflightMarker>,
    ttl: Duration,
    max_retries: u32,
    capacity: usize,
}

impl InflightTable {
    pub fn new(ttl: Duration, max_retries: u32, capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            ttl,
            max_retries,
            capacity: capacity.max(1),
        }
    }

    pub fn claim(&mut self, seq: u64, now: Instant) -> Claim {
        let Some(marker) = self.entries.get_mut(&seq) else {
            self.make_room();
            self.entries.insert(
                seq,
                InflightMarker {
                    since: now,
                    retries: 0,
                },
            );
            return Claim::Claimed;
        };

        if now.saturating_duration_since(marker.since) < self.ttl {
            return Claim::Busy;
        }
        if marker.retries >= self.max_retries {
            self.entries.remove(&seq);
            return Claim::Exhausted;
        }
        marker.retries += 1;
        marker.since = now;
        Claim::Reclaimed {
            retries: marker.retries,
        }
    }

    pub fn release(&mut self, seq: u64) {
        self.entries.remove(&seq);
    }

    /// Drops markers for slots the queue has already moved past.
    pub fn prune_through(&mut self, process_seq: u64) {
        self.entries = self.entries.split_off(&process_seq.saturating_add(1));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn make_room(&mut self) {
        while self.entries.len() >= self.capacity {
            let Some((&oldest, _)) = self.entries.iter().next() else {
                break;
            };
            tracing::debug!(seq = oldest, "inflight table full; dropping oldest marker");
            self.entries.remove(&oldest);
        }
    }
}
