//! Reply readiness detection.
//!
//! Two interchangeable strategies behind one trait, satisfying the same
//! contract: deliver every socket that currently has a reply waiting,
//! promptly, without ever blocking the send loop.
//!
//! - [`EpollReactor`] (unix): every probe socket is registered
//!   edge-triggered with a `mio::Poll` at send time and deregistered when
//!   its bucket closes.  A dedicated thread polls with zero timeout in a
//!   tight loop, draining each ready socket to `WouldBlock`, and sleeps
//!   briefly when nothing is ready so it does not monopolize a core.
//! - [`PollingReactor`] (portable fallback): the engine itself calls
//!   [`ReplyReactor::poll_now`] after each second's burst and during the
//!   stop drain; each call sweeps at most [`POLL_BATCH`] of the tracker's
//!   open sockets, resuming where the previous call stopped.
//!
//! [`detect`] picks the strategy at startup; the hot path never branches on
//! platform.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::socket::ProbeSocket;
use crate::tracker::ReplyTracker;

/// Upper bound on sockets swept per fallback [`ReplyReactor::poll_now`]
/// call, mirroring the descriptor-set limits of classic `select()`-style
/// facilities.  Successive calls resume where the previous one stopped, so
/// a population larger than the batch is still covered over a few calls.
pub const POLL_BATCH: usize = 500;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A strategy for observing echoed replies on the open probe sockets.
pub trait ReplyReactor: Send + Sync {
    /// Start watching a freshly created probe socket.
    fn register(&self, socket: &Arc<ProbeSocket>) -> io::Result<()>;

    /// Stop watching a socket; called just before its bucket closes it.
    fn deregister(&self, socket: &ProbeSocket) -> io::Result<()>;

    /// `true` when the engine must drive readiness checks itself.
    fn is_polling(&self) -> bool {
        false
    }

    /// Sweep for ready replies now (fallback strategy only; a no-op for the
    /// edge-triggered strategy, whose own thread does the draining).
    fn poll_now(&self) {}

    /// Stop the background worker, if any.  Idempotent.
    fn shutdown(&self);
}

/// Select the best available strategy for this platform.
///
/// Prefers the edge-triggered reactor; falls back to polling when the OS
/// readiness facility cannot be set up.
pub fn detect(tracker: Arc<ReplyTracker>) -> Box<dyn ReplyReactor> {
    #[cfg(unix)]
    match EpollReactor::spawn(Arc::clone(&tracker)) {
        Ok(reactor) => {
            log::info!("reply reactor: edge-triggered");
            return Box::new(reactor);
        }
        Err(e) => {
            log::warn!("readiness facility unavailable ({e}); falling back to polling");
        }
    }
    log::info!("reply reactor: polling fallback (batch={POLL_BATCH})");
    Box::new(PollingReactor::new(tracker))
}

/// Drain one ready socket: read every waiting datagram and stamp the
/// matching pending entries.  Unknown sequence numbers (already evicted, or
/// noise) are ignored by contract.
fn drain_socket(socket: &ProbeSocket, tracker: &ReplyTracker) {
    loop {
        match socket.try_recv() {
            Ok(Some(payload)) => {
                let now = Instant::now();
                match std::str::from_utf8(&payload).ok().and_then(|s| s.trim().parse::<u32>().ok())
                {
                    Some(seq) => {
                        if !tracker.mark_received(seq, now) {
                            log::debug!("late reply for evicted seq {seq}; ignored");
                        }
                    }
                    None => log::debug!("undecodable reply payload ({} bytes); ignored", payload.len()),
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("recv on {} failed: {e}", socket.local_addr);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Edge-triggered strategy (unix)
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub use edge::EpollReactor;

#[cfg(unix)]
mod edge {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll, Registry, Token};

    /// How long the poll thread sleeps when no events are ready.
    const IDLE_SLEEP: Duration = Duration::from_millis(1);

    /// Edge-triggered readiness reactor backed by `mio::Poll`.
    ///
    /// Sockets are keyed by raw fd (the fd doubles as the poll token), like
    /// the fd-indexed connection table the strategy classically uses.
    pub struct EpollReactor {
        registry: Registry,
        /// fd → socket, so the poll thread can map events back to sockets.
        connections: Arc<Mutex<HashMap<usize, Arc<ProbeSocket>>>>,
        stop: Arc<AtomicBool>,
        handle: Mutex<Option<thread::JoinHandle<()>>>,
    }

    impl EpollReactor {
        /// Set up the poll instance and spawn the reader thread.
        pub fn spawn(tracker: Arc<ReplyTracker>) -> io::Result<Self> {
            let poll = Poll::new()?;
            let registry = poll.registry().try_clone()?;
            let connections: Arc<Mutex<HashMap<usize, Arc<ProbeSocket>>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let stop = Arc::new(AtomicBool::new(false));

            let thread_conns = Arc::clone(&connections);
            let thread_stop = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name("reply-reactor".into())
                .spawn(move || reader_loop(poll, thread_conns, tracker, thread_stop))?;

            Ok(Self {
                registry,
                connections,
                stop,
                handle: Mutex::new(Some(handle)),
            })
        }
    }

    impl ReplyReactor for EpollReactor {
        fn register(&self, socket: &Arc<ProbeSocket>) -> io::Result<()> {
            let fd = socket.as_raw_fd();
            self.registry
                .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)?;
            self.connections
                .lock()
                .unwrap()
                .insert(fd as usize, Arc::clone(socket));
            Ok(())
        }

        fn deregister(&self, socket: &ProbeSocket) -> io::Result<()> {
            let fd = socket.as_raw_fd();
            self.connections.lock().unwrap().remove(&(fd as usize));
            self.registry.deregister(&mut SourceFd(&fd))
        }

        fn shutdown(&self) {
            self.stop.store(true, Ordering::Release);
            if let Some(handle) = self.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }

    /// The dedicated reader thread: zero-timeout poll, drain, brief sleep
    /// when idle.
    fn reader_loop(
        mut poll: Poll,
        connections: Arc<Mutex<HashMap<usize, Arc<ProbeSocket>>>>,
        tracker: Arc<ReplyTracker>,
        stop: Arc<AtomicBool>,
    ) {
        let mut events = Events::with_capacity(1024);
        while !stop.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, Some(Duration::ZERO)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("reply reactor poll failed: {e}");
                break;
            }
            if events.is_empty() {
                thread::sleep(IDLE_SLEEP);
                continue;
            }
            for event in events.iter() {
                // The socket may have been deregistered between the poll
                // and the lookup; that is just a race with bucket closure.
                let socket = connections.lock().unwrap().get(&event.token().0).cloned();
                if let Some(socket) = socket {
                    drain_socket(&socket, &tracker);
                }
            }
        }
        log::debug!("reply reactor thread exiting");
    }
}

// ---------------------------------------------------------------------------
// Polling fallback strategy
// ---------------------------------------------------------------------------

/// Portable fallback: the engine drives readiness sweeps over the tracker's
/// open sockets, at most [`POLL_BATCH`] sockets per call.
///
/// A cursor carried across calls makes the bound real: a sweep picks up
/// where the last one stopped, so a socket population larger than the batch
/// is covered round-robin instead of re-walked in full every time.
pub struct PollingReactor {
    tracker: Arc<ReplyTracker>,
    cursor: AtomicUsize,
}

impl PollingReactor {
    pub fn new(tracker: Arc<ReplyTracker>) -> Self {
        Self {
            tracker,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl ReplyReactor for PollingReactor {
    fn register(&self, _socket: &Arc<ProbeSocket>) -> io::Result<()> {
        // Sweeps walk the tracker directly; nothing extra to track.
        Ok(())
    }

    fn deregister(&self, _socket: &ProbeSocket) -> io::Result<()> {
        Ok(())
    }

    fn is_polling(&self) -> bool {
        true
    }

    fn poll_now(&self) {
        let sockets = self.tracker.open_sockets();
        if sockets.is_empty() {
            return;
        }
        let count = sockets.len().min(POLL_BATCH);
        let start = self.cursor.fetch_add(count, Ordering::Relaxed);
        for i in 0..count {
            drain_socket(&sockets[(start + i) % sockets.len()], &self.tracker);
        }
    }

    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::{Duration, Instant};

    fn tracked_probe(tracker: &ReplyTracker, seq: u32) -> Arc<ProbeSocket> {
        let socket = Arc::new(ProbeSocket::bind(0).unwrap());
        tracker.insert(seq, Instant::now(), Arc::clone(&socket));
        socket
    }

    fn echo_to(probe: &ProbeSocket, payload: &[u8]) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = format!("127.0.0.1:{}", probe.local_addr.port());
        peer.send_to(payload, dest).unwrap();
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn polling_sweep_stamps_replies() {
        let tracker = Arc::new(ReplyTracker::new());
        let reactor = PollingReactor::new(Arc::clone(&tracker));
        assert!(reactor.is_polling());

        let probe = tracked_probe(&tracker, 31);
        echo_to(&probe, b"31");
        reactor.poll_now();

        let entry = tracker.remove(31).unwrap();
        assert!(entry.received_at.is_some());
    }

    /// Track `count` probes and land one matching reply on each, from a
    /// single peer socket so large populations stay within fd limits.
    fn tracked_population_with_replies(tracker: &ReplyTracker, count: u32) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let probes: Vec<_> = (1..=count).map(|seq| (seq, tracked_probe(tracker, seq))).collect();
        for (seq, probe) in &probes {
            let dest = format!("127.0.0.1:{}", probe.local_addr.port());
            peer.send_to(seq.to_string().as_bytes(), dest).unwrap();
        }
        std::thread::sleep(Duration::from_millis(300));
    }

    #[test]
    fn sweeps_are_bounded_and_resume_until_every_socket_is_covered() {
        let tracker = Arc::new(ReplyTracker::new());
        let reactor = PollingReactor::new(Arc::clone(&tracker));
        let population = POLL_BATCH + 3;

        tracked_population_with_replies(&tracker, population as u32);

        // One call sweeps exactly the batch; the next resumes where it
        // stopped and reaches the stragglers.
        reactor.poll_now();
        assert_eq!(tracker.received_len(), POLL_BATCH);
        reactor.poll_now();
        assert_eq!(tracker.received_len(), population);
    }

    #[test]
    fn garbage_and_evicted_replies_are_ignored() {
        let tracker = Arc::new(ReplyTracker::new());
        let reactor = PollingReactor::new(Arc::clone(&tracker));

        let probe = tracked_probe(&tracker, 5);
        echo_to(&probe, b"not-a-number");
        echo_to(&probe, b"999999"); // never sent
        reactor.poll_now();

        let entry = tracker.remove(5).unwrap();
        assert!(entry.received_at.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn edge_reactor_stamps_replies_from_its_own_thread() {
        let tracker = Arc::new(ReplyTracker::new());
        let reactor = EpollReactor::spawn(Arc::clone(&tracker)).unwrap();

        let probe = tracked_probe(&tracker, 77);
        reactor.register(&probe).unwrap();
        echo_to(&probe, b"77");

        // Give the reactor thread a moment to observe the event.
        std::thread::sleep(Duration::from_millis(200));
        reactor.deregister(&probe).unwrap();
        reactor.shutdown();

        let entry = tracker.remove(77).unwrap();
        assert!(entry.received_at.is_some());
    }
}
