//! The rate-controlled send loop and engine lifecycle.
//!
//! [`TrafficEngine::start`] blocks the calling task and drives everything:
//! each wall-clock second it sends up to `packet_rate` probes (one fresh
//! socket per probe, source ports rotating through the configured range),
//! runs the fallback readiness sweep when applicable, sleeps out the rest of
//! the second, then rolls the bucket ring over — finalizing the bucket whose
//! grace period just elapsed into a [`StatRecord`] for the reporter.
//!
//! # Stop semantics
//!
//! [`EngineHandle::stop`] is cooperative and idempotent: it halts new sends
//! at the next second boundary, after which the engine keeps housekeeping
//! for the grace period so every already-sent probe is still judged, flushes
//! the reporter, and only then signals completion (which is when `stop`
//! returns).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::bucket::BucketRing;
use crate::config::{ConfigError, EngineConfig};
use crate::reactor::{self, ReplyReactor};
use crate::reporter;
use crate::socket::ProbeSocket;
use crate::stats::{self, StatRecord};
use crate::tracker::ReplyTracker;

/// Largest sequence number placed on the wire; the next probe wraps to 1.
pub const MAX_SEQUENCE: u32 = i32::MAX as u32;

const ONE_SECOND: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Fatal engine failures, surfaced to the orchestration layer.
///
/// Everything recoverable (port in use, late replies, delivery failures) is
/// logged and handled internally; these variants end the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A bind failure other than "address in use".
    #[error("failed to bind source port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("failed to send probe {seq}: {source}")]
    Send { seq: u32, source: io::Error },

    /// The readiness facility rejected a socket registration.
    #[error("reply reactor error: {0}")]
    Reactor(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Sequence numbers and port rotation
// ---------------------------------------------------------------------------

/// Monotonically increasing probe sequence, `1..=MAX_SEQUENCE`, wrapping.
#[derive(Debug)]
struct Sequence {
    next: u32,
}

impl Sequence {
    fn new() -> Self {
        Self { next: 1 }
    }

    /// Hand out the next sequence number and advance (with wraparound).
    fn take(&mut self) -> u32 {
        let seq = self.next;
        self.next = if seq == MAX_SEQUENCE { 1 } else { seq + 1 };
        seq
    }
}

/// Source ports cycling through `[start, stop)`, wrapping exactly at `stop`.
#[derive(Debug)]
struct PortRotation {
    start: u16,
    stop: u16,
    current: u16,
}

impl PortRotation {
    fn new(start: u16, stop: u16) -> Self {
        Self {
            start,
            stop,
            current: start,
        }
    }

    fn current(&self) -> u16 {
        self.current
    }

    /// Move to the next port; a port skipped for `AddrInUse` advances too.
    fn advance(&mut self) {
        self.current += 1;
        if self.current == self.stop {
            self.current = self.start;
        }
    }
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

/// Cloneable lifecycle handle for the orchestration layer.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    running: Arc<AtomicBool>,
    tracker: Arc<ReplyTracker>,
    done: watch::Receiver<bool>,
}

impl EngineHandle {
    /// Request a cooperative stop and wait for teardown to complete.
    ///
    /// Idempotent: calling it again (or concurrently) just waits for the
    /// same completion signal.  Never fails; an engine that was dropped
    /// without running counts as stopped.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Whether the engine is still accepting the next send window.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of probes currently awaiting judgment, each holding an open
    /// socket.  A probe's socket lives from its send until its bucket
    /// closes one grace period later, so this never exceeds
    /// `packet_rate * (grace_secs + 1)`.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

// ---------------------------------------------------------------------------
// TrafficEngine
// ---------------------------------------------------------------------------

/// The traffic engine.  Construct with a validated [`EngineConfig`], grab an
/// [`EngineHandle`], then [`start`](Self::start) on the task that should own
/// the send loop.
pub struct TrafficEngine {
    config: EngineConfig,
    tracker: Arc<ReplyTracker>,
    running: Arc<AtomicBool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl TrafficEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            config,
            tracker: Arc::new(ReplyTracker::new()),
            running: Arc::new(AtomicBool::new(true)),
            done_tx,
            done_rx,
        }
    }

    /// Lifecycle handle for stopping the engine from another task.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            running: Arc::clone(&self.running),
            tracker: Arc::clone(&self.tracker),
            done: self.done_rx.clone(),
        }
    }

    /// Run the engine until [`EngineHandle::stop`] is called.
    ///
    /// Blocks the calling task for the whole run.  Returns `Err` only on
    /// fatal resource errors (bind/send failures other than a busy port);
    /// teardown still happens on the error path so no worker is leaked.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if let Err(e) = self.config.validate() {
            // Nothing was started, but stop() must still be able to return.
            let _ = self.done_tx.send(true);
            return Err(e.into());
        }
        log::info!(
            "starting traffic: dest={} rate={}/s ports=[{}, {}) grace={}s",
            self.config.destination,
            self.config.packet_rate,
            self.config.port_range_start,
            self.config.port_range_stop,
            self.config.grace_secs,
        );

        let reactor = reactor::detect(Arc::clone(&self.tracker));
        let (stat_tx, stat_rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(reporter::run(
            self.config.controller_url.clone(),
            self.config.report_interval,
            stat_rx,
        ));

        let result = self.run_loop(reactor.as_ref(), &stat_tx).await;

        reactor.shutdown();
        drop(stat_tx); // reporter flushes its tail and exits
        let _ = reporter.await;
        let _ = self.done_tx.send(true);

        match &result {
            Ok(()) => log::info!("traffic engine stopped"),
            Err(e) => log::error!("traffic engine failed: {e}"),
        }
        result
    }

    /// The per-second send loop plus the post-stop grace drain.
    async fn run_loop(
        &self,
        reactor: &dyn ReplyReactor,
        stat_tx: &mpsc::UnboundedSender<StatRecord>,
    ) -> Result<(), EngineError> {
        let mut ring = BucketRing::new(self.config.grace_secs);
        let mut sequence = Sequence::new();
        let mut ports =
            PortRotation::new(self.config.port_range_start, self.config.port_range_stop);

        while self.running.load(Ordering::Acquire) {
            let window_start = Instant::now();
            let mut sent = 0u32;

            while sent < self.config.packet_rate && window_start.elapsed() < ONE_SECOND {
                let port = ports.current();
                let socket = match ProbeSocket::bind(port) {
                    Ok(socket) => socket,
                    Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                        // Busy port: skip it without consuming quota.
                        log::warn!("source port {port} in use; skipping");
                        ports.advance();
                        continue;
                    }
                    Err(source) => return Err(EngineError::Bind { port, source }),
                };

                // Track and register before the send so a fast echo can
                // never race past the bookkeeping.
                let seq = sequence.take();
                let socket = Arc::new(socket);
                self.tracker.insert(seq, Instant::now(), Arc::clone(&socket));
                reactor.register(&socket)?;

                if let Err(source) = socket.send_probe(seq, self.config.destination) {
                    let _ = reactor.deregister(&socket);
                    self.tracker.remove(seq);
                    return Err(EngineError::Send { seq, source });
                }

                ring.record(seq);
                ports.advance();
                sent += 1;
            }

            log::debug!("window done: sent={sent} in_flight={}", self.tracker.len());
            self.housekeep(reactor, stat_tx, &mut ring, window_start).await;
        }

        // Cooperative drain: no new sends, but already-sent buckets get
        // their full grace period before being judged.
        log::info!(
            "stop requested; draining for {} grace second(s)",
            self.config.grace_secs
        );
        for _ in 0..self.config.grace_secs {
            let window_start = Instant::now();
            self.housekeep(reactor, stat_tx, &mut ring, window_start).await;
        }
        Ok(())
    }

    /// End-of-second work: fallback sweep, sleep to the boundary, rollover.
    async fn housekeep(
        &self,
        reactor: &dyn ReplyReactor,
        stat_tx: &mpsc::UnboundedSender<StatRecord>,
        ring: &mut BucketRing,
        window_start: Instant,
    ) {
        if reactor.is_polling() {
            reactor.poll_now();
        }
        if let Some(remaining) = ONE_SECOND.checked_sub(window_start.elapsed()) {
            tokio::time::sleep(remaining).await;
        }
        if reactor.is_polling() {
            reactor.poll_now();
        }
        if let Some(bucket) = ring.advance() {
            let record =
                stats::finalize_bucket(&self.config.app_id, &bucket, &self.tracker, reactor);
            if stat_tx.send(record).is_err() {
                log::debug!("stat channel closed; record discarded");
            }
        }
    }
}
