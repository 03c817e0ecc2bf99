//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Background receive loop shared by all transports."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Cancellable background receive loop.
//!
//! A [`Listener`] owns at most one thread. The thread repeatedly asks its
//! [`UnitSource`] for one unit and hands each unit to the registered
//! [`Handler`] synchronously, so a slow handler throttles the receive rate.
//! Sources must bound every receive (returning [`Received::Idle`] on a
//! heartbeat) so that [`Listener::stop`] is observed promptly; a source that
//! can block indefinitely delays shutdown until its next unit arrives.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acp_logging::{acp_error, acp_warn, log_lifecycle_event, LifecycleOutcome, LogContext};
use parking_lot::RwLock;
use tracing::debug;

use crate::{CommsError, Result};

/// How long [`Listener::stop`] waits for the loop thread before detaching it.
pub const LISTENER_STOP_DEADLINE: Duration = Duration::from_secs(1);

const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Callback invoked once per received unit.
pub type Handler<U> = Arc<dyn Fn(U) + Send + Sync>;

/// Hook run by [`Listener::stop`] to unblock a pending receive.
pub type Waker = Box<dyn FnOnce() + Send>;

/// Outcome of one bounded receive.
#[derive(Debug)]
pub enum Received<U> {
    /// A unit arrived.
    Unit(U),
    /// The receive bound elapsed without data.
    Idle,
}

/// "Receive one unit" capability supplied by a backend.
pub trait UnitSource: Send + 'static {
    /// Unit handed to the handler.
    type Unit: Send + 'static;

    /// Perform one bounded receive.
    fn receive_unit(&mut self) -> Result<Received<Self::Unit>>;

    /// Optional hook that wakes a receive blocked inside [`receive_unit`](Self::receive_unit).
    fn waker(&self) -> Option<Waker> {
        None
    }
}

/// Snapshot of listener activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerMetrics {
    /// Units received while running.
    pub units: u64,
    /// Receive errors reported while running.
    pub errors: u64,
    /// Handler invocations that panicked.
    pub handler_panics: u64,
}

#[derive(Default)]
struct Counters {
    units: AtomicU64,
    errors: AtomicU64,
    handler_panics: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ListenerMetrics {
        ListenerMetrics {
            units: self.units.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

struct ActiveLoop {
    running: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
    thread: thread::JoinHandle<()>,
    wake: Option<Waker>,
}

/// Background dispatch loop with a bounded, cooperative shutdown.
pub struct Listener<U> {
    name: &'static str,
    handler: Arc<RwLock<Option<Handler<U>>>>,
    counters: Arc<Counters>,
    active: Option<ActiveLoop>,
}

impl<U> Listener<U> {
    /// Create an idle listener; `name` tags its thread and log events.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handler: Arc::new(RwLock::new(None)),
            counters: Arc::new(Counters::default()),
            active: None,
        }
    }

    /// Register the callback, replacing any previous one. Takes effect from the next unit.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(U) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Remove the callback; received units are then dropped.
    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    /// Whether a handler is registered.
    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Whether a loop thread is currently owned by this listener.
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Activity counters accumulated across runs.
    pub fn metrics(&self) -> ListenerMetrics {
        self.counters.snapshot()
    }

    /// Stop the loop and wait up to [`LISTENER_STOP_DEADLINE`] for it to exit.
    ///
    /// Returns `false` when the thread was still busy at the deadline and has
    /// been detached; it exits on its own once its current receive or handler
    /// call returns. Always safe to call.
    pub fn stop(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return true;
        };
        active.running.store(false, Ordering::SeqCst);
        if let Some(wake) = active.wake {
            wake();
        }

        let ctx = LogContext::new().with_transport(self.name);
        match active.exited.recv_timeout(LISTENER_STOP_DEADLINE) {
            Err(RecvTimeoutError::Timeout) => {
                log_lifecycle_event(
                    Some(&ctx),
                    "listener.stop",
                    "listener still busy after deadline; detached",
                    LifecycleOutcome::Fault,
                );
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if active.thread.join().is_err() {
                    acp_error!(context = ctx, "listener thread terminated abnormally");
                }
                log_lifecycle_event(
                    Some(&ctx),
                    "listener.stop",
                    "listener stopped",
                    LifecycleOutcome::Success,
                );
                true
            }
        }
    }
}

impl<U: Send + 'static> Listener<U> {
    /// Spawn the loop over `source`. Fails with [`CommsError::AlreadyListening`] if one is running.
    pub fn start<S>(&mut self, mut source: S) -> Result<()>
    where
        S: UnitSource<Unit = U>,
    {
        if self.active.is_some() {
            return Err(CommsError::AlreadyListening);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (exit_tx, exited) = mpsc::channel::<()>();
        let wake = source.waker();
        let name = self.name;
        let flag = Arc::clone(&running);
        let handler = Arc::clone(&self.handler);
        let counters = Arc::clone(&self.counters);

        let thread = thread::Builder::new()
            .name(format!("acp-{name}-listener"))
            .spawn(move || {
                // Dropping the sender on exit is what `stop` waits for.
                let _exit = exit_tx;
                run_loop(name, &mut source, &flag, &handler, &counters);
            })?;

        self.active = Some(ActiveLoop {
            running,
            exited,
            thread,
            wake,
        });
        log_lifecycle_event(
            Some(&LogContext::new().with_transport(name)),
            "listener.start",
            "listener started",
            LifecycleOutcome::Success,
        );
        Ok(())
    }
}

impl<U> Drop for Listener<U> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<S: UnitSource>(
    name: &'static str,
    source: &mut S,
    running: &AtomicBool,
    handler: &RwLock<Option<Handler<S::Unit>>>,
    counters: &Counters,
) {
    let ctx = LogContext::new().with_transport(name);
    while running.load(Ordering::SeqCst) {
        match source.receive_unit() {
            Ok(Received::Unit(unit)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                counters.units.fetch_add(1, Ordering::Relaxed);
                let current = handler.read().clone();
                if let Some(callback) = current {
                    if catch_unwind(AssertUnwindSafe(|| callback(unit))).is_err() {
                        counters.handler_panics.fetch_add(1, Ordering::Relaxed);
                        acp_error!(context = ctx, "handler panicked; listener continues");
                    }
                }
            }
            Ok(Received::Idle) => {}
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    acp_warn!(context = ctx, "receive failed: {err}");
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }
    debug!(listener = name, "listener loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(20);

    struct ChannelSource {
        rx: mpsc::Receiver<Result<u32>>,
    }

    impl UnitSource for ChannelSource {
        type Unit = u32;

        fn receive_unit(&mut self) -> Result<Received<u32>> {
            match self.rx.recv_timeout(POLL) {
                Ok(Ok(unit)) => Ok(Received::Unit(unit)),
                Ok(Err(err)) => Err(err),
                Err(RecvTimeoutError::Timeout) => Ok(Received::Idle),
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(POLL);
                    Ok(Received::Idle)
                }
            }
        }
    }

    fn channel_source() -> (mpsc::Sender<Result<u32>>, ChannelSource) {
        let (tx, rx) = mpsc::channel();
        (tx, ChannelSource { rx })
    }

    fn collecting_listener() -> (Listener<u32>, mpsc::Receiver<u32>) {
        let listener = Listener::new("test");
        let (seen_tx, seen_rx) = mpsc::channel();
        let seen_tx = parking_lot::Mutex::new(seen_tx);
        listener.set_handler(move |unit| {
            let _ = seen_tx.lock().send(unit);
        });
        (listener, seen_rx)
    }

    #[test]
    fn dispatches_units_in_order() {
        let (mut listener, seen) = collecting_listener();
        let (tx, source) = channel_source();
        listener.start(source).expect("start");
        for unit in 1..=3 {
            tx.send(Ok(unit)).unwrap();
        }
        let got: Vec<u32> = (0..3)
            .map(|_| seen.recv_timeout(Duration::from_secs(2)).expect("unit"))
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(listener.stop());
        assert_eq!(listener.metrics().units, 3);
    }

    #[test]
    fn second_start_fails_until_stopped() {
        let (mut listener, _seen) = collecting_listener();
        let (_tx, source) = channel_source();
        listener.start(source).expect("first start");

        let (_tx2, other) = channel_source();
        assert!(matches!(listener.start(other), Err(CommsError::AlreadyListening)));

        let started = Instant::now();
        assert!(listener.stop());
        assert!(started.elapsed() < LISTENER_STOP_DEADLINE);
        assert!(!listener.is_running());

        let (_tx3, again) = channel_source();
        listener.start(again).expect("restart after stop");
        assert!(listener.stop());
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut listener: Listener<u32> = Listener::new("idle");
        assert!(listener.stop());
        assert!(listener.stop());
    }

    #[test]
    fn receive_errors_do_not_end_the_loop() {
        let (mut listener, seen) = collecting_listener();
        let (tx, source) = channel_source();
        listener.start(source).expect("start");
        tx.send(Err(CommsError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))))
        .unwrap();
        tx.send(Ok(7)).unwrap();
        assert_eq!(seen.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        listener.stop();
        assert_eq!(listener.metrics().errors, 1);
    }

    #[test]
    fn handler_panic_is_contained() {
        let mut listener: Listener<u32> = Listener::new("panicky");
        let (seen_tx, seen) = mpsc::channel();
        let seen_tx = parking_lot::Mutex::new(seen_tx);
        listener.set_handler(move |unit| {
            if unit == 0 {
                panic!("boom");
            }
            let _ = seen_tx.lock().send(unit);
        });
        let (tx, source) = channel_source();
        listener.start(source).expect("start");
        tx.send(Ok(0)).unwrap();
        tx.send(Ok(5)).unwrap();
        assert_eq!(seen.recv_timeout(Duration::from_secs(2)).unwrap(), 5);
        listener.stop();
        assert_eq!(listener.metrics().handler_panics, 1);
    }

    #[test]
    fn units_without_handler_are_dropped() {
        let mut listener: Listener<u32> = Listener::new("headless");
        let (tx, source) = channel_source();
        listener.start(source).expect("start");
        tx.send(Ok(1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.metrics().units == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(listener.metrics().units, 1);
        assert!(!listener.has_handler());
        listener.stop();
    }

    #[test]
    fn slow_handler_is_detached_after_deadline() {
        let mut listener: Listener<u32> = Listener::new("slow");
        listener.set_handler(|_| thread::sleep(Duration::from_millis(1500)));
        let (tx, source) = channel_source();
        listener.start(source).expect("start");
        tx.send(Ok(1)).unwrap();
        while listener.metrics().units == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        let started = Instant::now();
        assert!(!listener.stop());
        assert!(started.elapsed() < Duration::from_millis(1400));
        assert!(!listener.is_running());
    }
}
