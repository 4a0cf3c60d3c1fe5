//! Per-probe bookkeeping: sequence number → pending entry.
//!
//! [`ReplyTracker`] is the one structure mutated from more than one thread:
//! the engine inserts entries as probes go out, the reply reactor stamps
//! receive times as echoes come back, and bucket finalization removes entries
//! once their grace period has elapsed.  A single mutex guards the map; every
//! operation holds it only for the map access itself.
//!
//! # Ownership contract
//! - The engine **creates** entries (and their sockets).
//! - The reactor **only** sets the receive timestamp, at most once.
//! - Bucket finalization **removes** entries and closes their sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::socket::ProbeSocket;

/// Bookkeeping for one in-flight probe.
#[derive(Debug)]
pub struct PendingEntry {
    /// When the probe left the wire.
    pub sent_at: Instant,
    /// When its echo arrived, if it has.
    pub received_at: Option<Instant>,
    /// The socket the probe was sent from; replies arrive here and the
    /// socket closes when the entry is consumed at bucket closure.
    pub socket: Arc<ProbeSocket>,
}

/// Shared map of all probes whose buckets have not yet closed.
#[derive(Debug, Default)]
pub struct ReplyTracker {
    entries: Mutex<HashMap<u32, PendingEntry>>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly sent probe.  Called only by the engine.
    pub fn insert(&self, seq: u32, sent_at: Instant, socket: Arc<ProbeSocket>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            seq,
            PendingEntry {
                sent_at,
                received_at: None,
                socket,
            },
        );
    }

    /// Stamp the receive time for `seq`.
    ///
    /// Returns `false` when the sequence number is unknown (already evicted
    /// by bucket closure, or garbage from the wire) — the caller just logs
    /// and ignores it.  A second reply for the same probe does not move the
    /// timestamp.
    pub fn mark_received(&self, seq: u32, at: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&seq) {
            Some(entry) => {
                if entry.received_at.is_none() {
                    entry.received_at = Some(at);
                }
                true
            }
            None => false,
        }
    }

    /// Consume the entry for `seq` at bucket closure.
    pub fn remove(&self, seq: u32) -> Option<PendingEntry> {
        self.entries.lock().unwrap().remove(&seq)
    }

    /// Snapshot of every open probe socket, for the polling reactor's sweep.
    pub fn open_sockets(&self) -> Vec<Arc<ProbeSocket>> {
        let entries = self.entries.lock().unwrap();
        entries.values().map(|e| Arc::clone(&e.socket)).collect()
    }

    /// Number of probes currently tracked (open sockets in flight).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tracked probes whose echo has arrived.
    #[cfg(test)]
    pub(crate) fn received_len(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|e| e.received_at.is_some()).count()
    }
}
