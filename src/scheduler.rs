use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use log::{debug, error, info};
use thiserror::Error;

pub const QUEUE_DEPTH: usize = 5;
/// Poll interval while waiting for the start edge.
pub const START_POLL: Duration = Duration::from_millis(50);
/// Poll interval while waiting for the stop window.
pub const STOP_POLL: Duration = Duration::from_secs(1);
/// How long the idle worker blocks on the queue before rechecking shutdown.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Source of UTC time. Abstracted so alignment can be driven by a simulated clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, d: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, d: Duration) {
        thread::sleep(d);
    }
}

/// Work run on the scheduler thread once the wait completes.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

pub enum Request {
    WaitStart(Action),
    WaitStop(Action),
}

/// Which end of a transmission a wait is aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEdge {
    Start,
    Stop,
}

impl std::fmt::Display for TxEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TxEdge::Start => "start",
            TxEdge::Stop => "stop",
        })
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler queue full ({QUEUE_DEPTH} pending)")]
    QueueFull,
    #[error("scheduler stopped")]
    Stopped,
}

#[derive(Default)]
struct Flags {
    cancel: AtomicBool,
    shutdown: AtomicBool,
    waiting: AtomicBool,
    /// Edge of the request being served, from dequeue until its action returns.
    active: Mutex<Option<TxEdge>>,
}

impl Flags {
    fn set_active(&self, edge: Option<TxEdge>) {
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) = edge;
    }

    fn interrupted(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst)
    }
}

/// Block until the clock shows second 1 of an even minute.
///
/// The even-minute boundary has to be observed first (second 0), so a request
/// that arrives at 12:02:01.3 waits for 12:04:01. Returns false if interrupted.
fn align_start(clock: &dyn Clock, flags: &Flags) -> bool {
    loop {
        if flags.interrupted() {
            return false;
        }
        let now = clock.now();
        if now.second() == 0 && now.minute() % 2 == 0 {
            loop {
                if flags.interrupted() {
                    return false;
                }
                if clock.now().second() != 0 {
                    return true;
                }
                clock.sleep(START_POLL);
            }
        }
        clock.sleep(START_POLL);
    }
}

/// Block until second 55 or later of an odd minute, at least 110.6 s after
/// the start edge and before the next one. Returns false if interrupted.
fn align_stop(clock: &dyn Clock, flags: &Flags) -> bool {
    loop {
        if flags.interrupted() {
            return false;
        }
        let now = clock.now();
        if now.second() >= 55 && now.minute() % 2 == 1 {
            return true;
        }
        clock.sleep(STOP_POLL);
    }
}

/// Single worker serving start/stop waits in arrival order.
///
/// A WSPR transmission starts one second into an even UTC minute and lasts
/// 110.6 s. Each request is held on the worker thread until the clock reaches
/// its point in that cycle, and only then is its action run.
pub struct TxScheduler {
    tx: Option<Sender<Request>>,
    flags: Arc<Flags>,
    worker: Option<JoinHandle<()>>,
}

impl TxScheduler {
    pub fn spawn(clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let flags = Arc::new(Flags::default());
        let worker_flags = Arc::clone(&flags);
        let worker = thread::Builder::new()
            .name("tx-scheduler".into())
            .spawn(move || run(rx, clock, worker_flags))
            .ok();
        if worker.is_none() {
            error!("failed to start scheduler thread");
        }
        Self {
            tx: Some(tx),
            flags,
            worker,
        }
    }

    /// Queue `action` to run at the next transmit start edge.
    pub fn wait_start(&self, action: Action) -> Result<(), SchedulerError> {
        self.submit(Request::WaitStart(action))
    }

    /// Queue `action` to run in the next stop window.
    pub fn wait_stop(&self, action: Action) -> Result<(), SchedulerError> {
        self.submit(Request::WaitStop(action))
    }

    /// Abandon the wait in progress without running its action. Queued
    /// requests are unaffected; with nothing waiting this is a no-op.
    pub fn cancel(&self) {
        if self.is_waiting() {
            self.flags.cancel.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.flags.waiting.load(Ordering::SeqCst)
    }

    /// Edge of the request the worker is serving, waiting or running its
    /// action. Requests still in the queue are not reported.
    pub fn active_edge(&self) -> Option<TxEdge> {
        *self.flags.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stop the worker, dropping any pending requests, and join it.
    pub fn shutdown(&mut self) {
        self.flags.shutdown.store(true, Ordering::SeqCst);
        self.tx.take();
        if let Some(h) = self.worker.take() {
            if h.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }

    fn submit(&self, req: Request) -> Result<(), SchedulerError> {
        let tx = self.tx.as_ref().ok_or(SchedulerError::Stopped)?;
        if self.worker.is_none() {
            return Err(SchedulerError::Stopped);
        }
        tx.try_send(req).map_err(|e| match e {
            TrySendError::Full(_) => SchedulerError::QueueFull,
            TrySendError::Disconnected(_) => SchedulerError::Stopped,
        })
    }
}

impl Drop for TxScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<Request>, clock: Arc<dyn Clock>, flags: Arc<Flags>) {
    debug!("scheduler running");
    while !flags.shutdown.load(Ordering::SeqCst) {
        let req = match rx.recv_timeout(IDLE_POLL) {
            Ok(r) => r,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let (edge, action) = match req {
            Request::WaitStart(a) => (TxEdge::Start, a),
            Request::WaitStop(a) => (TxEdge::Stop, a),
        };

        // a cancel aimed at an earlier wait must not leak into this one
        flags.cancel.store(false, Ordering::SeqCst);
        flags.set_active(Some(edge));
        flags.waiting.store(true, Ordering::SeqCst);
        info!("waiting for {} time", edge);
        let reached = match edge {
            TxEdge::Start => align_start(&*clock, &flags),
            TxEdge::Stop => align_stop(&*clock, &flags),
        };
        flags.waiting.store(false, Ordering::SeqCst);
        flags.cancel.store(false, Ordering::SeqCst);

        if flags.shutdown.load(Ordering::SeqCst) {
            flags.set_active(None);
            break;
        }
        if !reached {
            flags.set_active(None);
            info!("{} wait cancelled", edge);
            continue;
        }

        info!("{} time reached at {}", edge, clock.now().format("%H:%M:%S%.3f"));
        if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
            error!("{} action panicked", edge);
        }
        flags.set_active(None);
    }
    debug!("scheduler exiting");
}
