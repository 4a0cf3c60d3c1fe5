//! Per-second bucket ring with grace-delayed closure.
//!
//! Every probe is filed into the bucket for the wall-clock second it was
//! sent in.  A ring of `grace + 1` buckets exists at all times; the engine
//! calls [`BucketRing::advance`] once per second, and the bucket for second
//! `k` is handed back for finalization exactly when second `k + grace + 1`
//! begins — i.e. `grace` seconds after the second it represents ended, so
//! every reply that can plausibly arrive has had its chance.
//!
//! The ring is owned exclusively by the engine loop: sends append and
//! rollover closes, never concurrently, so a bucket can never be read for
//! closure while it is still being appended to.

/// Ring of per-second sequence-number buckets.
#[derive(Debug)]
pub struct BucketRing {
    /// `grace + 1` slots; slot for second `k` is `k % slots.len()`.
    slots: Vec<Vec<u32>>,
    /// Completed seconds, i.e. how many times `advance` has been called.
    seconds: u64,
}

impl BucketRing {
    pub fn new(grace_secs: u32) -> Self {
        let len = grace_secs as usize + 1;
        Self {
            slots: vec![Vec::new(); len],
            seconds: 0,
        }
    }

    /// File a sent sequence number into the bucket for the current second.
    /// Send order within the bucket is preserved.
    pub fn record(&mut self, seq: u32) {
        let idx = (self.seconds % self.slots.len() as u64) as usize;
        self.slots[idx].push(seq);
    }

    /// Roll over to the next second.
    ///
    /// Returns the bucket whose grace period has just elapsed, ready for
    /// finalization — possibly empty, because an empty second still closes
    /// (skipping it would let the ring index and real time drift apart).
    /// Returns `None` only while the ring is still warming up.
    pub fn advance(&mut self) -> Option<Vec<u32>> {
        self.seconds += 1;
        let len = self.slots.len() as u64;
        let idx = (self.seconds % len) as usize;
        if self.seconds >= len {
            // The slot we are about to reuse holds second `seconds - len`,
            // whose grace period is now over.
            Some(std::mem::take(&mut self.slots[idx]))
        } else {
            None
        }
    }

    /// Number of slots (`grace + 1`).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }
}
