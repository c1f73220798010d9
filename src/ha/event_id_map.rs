//! Duplicate suppression for pushed events
//!
//! Servers stamp every event with `(member, thread, sequence)`. Within one
//! source the sequence only grows, so the map keeps the highest sequence
//! seen per source; anything at or below it is a replay from a queue that
//! took over after failover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::protocol::{EventId, EventSource};

/// Duplicates are logged on the 1st, 101st, 201st... occurrence
const DUPLICATE_LOG_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy)]
struct SourceState {
    sequence: i64,
    acked: bool,
    expires_at: Instant,
}

pub struct EventIdMap {
    entries: Mutex<HashMap<EventSource, SourceState>>,
    lifetime: Duration,
    duplicates: AtomicU64,
}

impl EventIdMap {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lifetime,
            duplicates: AtomicU64::new(0),
        }
    }

    /// Record `id`. Returns false when it was already seen.
    pub fn check_dup_and_add(&self, id: &EventId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(&id.source()) {
            Some(state) if id.sequence_id <= state.sequence => {
                let count = self.duplicates.fetch_add(1, Ordering::Relaxed) + 1;
                if count % DUPLICATE_LOG_EVERY == 1 {
                    info!("Dropped duplicate event {} ({} duplicates so far)", id, count);
                }
                false
            }
            Some(state) => {
                state.sequence = id.sequence_id;
                state.acked = false;
                state.expires_at = now + self.lifetime;
                true
            }
            None => {
                entries.insert(
                    id.source(),
                    SourceState {
                        sequence: id.sequence_id,
                        acked: false,
                        expires_at: now + self.lifetime,
                    },
                );
                true
            }
        }
    }

    /// Latest event of every source not yet acknowledged
    pub fn unacked(&self) -> Vec<EventId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, state)| !state.acked)
            .map(|(source, state)| EventId::new(source.member_id.clone(), source.thread_id, state.sequence))
            .collect()
    }

    /// Mark acknowledged ids. A source that moved on to a newer sequence
    /// since the ack was built stays unacked.
    pub fn mark_acked(&self, ids: &[EventId]) {
        let mut entries = self.entries.lock();
        for id in ids {
            if let Some(state) = entries.get_mut(&id.source()) {
                if state.sequence == id.sequence_id {
                    state.acked = true;
                }
            }
        }
    }

    /// Drop expired entries; with `only_acked` unacknowledged ones are kept
    /// regardless of age.
    pub fn expire(&self, only_acked: bool) -> usize {
        self.expire_at(Instant::now(), only_acked)
    }

    fn expire_at(&self, now: Instant, only_acked: bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, state| now < state.expires_at || (only_acked && !state.acked));
        let expired = before - entries.len();
        if expired > 0 {
            debug!("Expired {} event sources", expired);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}
