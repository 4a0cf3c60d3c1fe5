//! Bucket finalization into controller stat records.
//!
//! When a bucket's grace period elapses, every probe in it is judged exactly
//! once: an echoed probe contributes its round-trip latency, an unanswered
//! one counts as dropped.  Either way the probe's entry is consumed and its
//! socket is deregistered from the reactor and closed — the bucket is the
//! unit of socket lifetime.

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::reactor::ReplyReactor;
use crate::tracker::ReplyTracker;

/// Sentinel reported when no probe in the bucket was acknowledged.
pub const NO_LATENCY: f64 = -1.0;

/// Finalized measurement summary for one bucket, in the controller's wire
/// shape.  Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    /// Job identifier this record belongs to.
    pub app_id: String,
    /// Payload bytes put on the wire during the bucket's second.
    pub byte_sent: u64,
    /// Probes sent during the bucket's second.
    pub packets_sent: u64,
    /// Probes whose echo arrived before the bucket closed.
    pub packets_receive: u64,
    /// Probes never echoed: `packets_sent - packets_receive`.
    pub drop_packets: u64,
    /// Mean round-trip latency in seconds, or [`NO_LATENCY`].
    pub avg_latency: f64,
    /// Local wall-clock time the bucket was finalized.
    pub pkt_time: String,
}

/// Convert a closed bucket into a [`StatRecord`], consuming its pending
/// entries and releasing their sockets.
///
/// A sequence number missing from the tracker is a bookkeeping bug upstream;
/// it is logged and skipped rather than crashing the engine.
pub fn finalize_bucket(
    app_id: &str,
    bucket: &[u32],
    tracker: &ReplyTracker,
    reactor: &dyn ReplyReactor,
) -> StatRecord {
    let mut byte_sent = 0u64;
    let mut received = 0u64;
    let mut dropped = 0u64;
    let mut latency_total = 0f64;

    for &seq in bucket {
        let entry = match tracker.remove(seq) {
            Some(entry) => entry,
            None => {
                log::warn!("seq {seq} in bucket but not in tracker; skipping");
                continue;
            }
        };
        byte_sent += decimal_len(seq);
        match entry.received_at {
            Some(at) => {
                latency_total += at.duration_since(entry.sent_at).as_secs_f64();
                received += 1;
            }
            None => dropped += 1,
        }
        if let Err(e) = reactor.deregister(&entry.socket) {
            log::debug!("deregister of {} failed: {e}", entry.socket.local_addr);
        }
        // Dropping the entry here closes the probe's socket.
    }

    let avg_latency = if received > 0 {
        latency_total / received as f64
    } else {
        NO_LATENCY
    };

    let record = StatRecord {
        app_id: app_id.to_string(),
        byte_sent,
        packets_sent: bucket.len() as u64,
        packets_receive: received,
        drop_packets: dropped,
        avg_latency,
        pkt_time: Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
    };
    log::info!(
        "stat: sent={} received={} dropped={} bytes={} avg_latency={:.4}",
        record.packets_sent,
        record.packets_receive,
        record.drop_packets,
        record.byte_sent,
        record.avg_latency
    );
    record
}

/// Wire size of a probe payload: the length of the decimal sequence string.
fn decimal_len(seq: u32) -> u64 {
    let mut len = 1;
    let mut n = seq / 10;
    while n > 0 {
        len += 1;
        n /= 10;
    }
    len
}
