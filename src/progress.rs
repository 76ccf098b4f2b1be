use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TaskState;

/// Snapshot of a run, taken right after a task changed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub flow_name: String,
    pub all: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub blocked: Vec<String>,
    pub running: Vec<String>,
    pub pending: Vec<String>,
    /// Task that just transitioned and its new state; `None` for the
    /// snapshot taken before anything started.
    pub last_transition: Option<(String, TaskState)>,
}

impl Stats {
    /// Share of succeeded or skipped tasks, 0 to 100. Never decreases within
    /// a run. An empty flow is complete.
    pub fn progress_percent(&self) -> u8 {
        if self.all == 0 {
            return 100;
        }
        ((self.succeeded.len() + self.skipped.len()) * 100 / self.all) as u8
    }

    pub fn is_finished(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }
}

pub type ProgressCallback = Arc<dyn Fn(Stats) + Send + Sync>;

/// Sink for run progress. `report` is called from the scheduling loop and
/// must not block. One reporter serves one run at a time.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    fn start(&self);
    fn report(&self, stats: Stats);
    /// Delivers outstanding snapshots and shuts the reporter down.
    async fn stop(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Forwarder {
    tx: mpsc::UnboundedSender<Stats>,
    handle: JoinHandle<()>,
}

/// Forwards every snapshot, in order, to a callback running on tokio's
/// blocking pool, so a slow callback never holds up scheduling.
pub struct ImmediateProgressReporter {
    callback: ProgressCallback,
    forwarder: Mutex<Option<Forwarder>>,
}

impl ImmediateProgressReporter {
    pub fn new(callback: impl Fn(Stats) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
            forwarder: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProgressReporter for ImmediateProgressReporter {
    fn start(&self) {
        let mut forwarder = lock(&self.forwarder);
        if forwarder.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Stats>();
        let callback = Arc::clone(&self.callback);
        // callbacks may block; keep them off the runtime workers
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(stats) = rx.blocking_recv() {
                callback(stats);
            }
        });
        *forwarder = Some(Forwarder { tx, handle });
    }

    fn report(&self, stats: Stats) {
        if let Some(forwarder) = lock(&self.forwarder).as_ref() {
            // the receiver only goes away on stop
            let _ = forwarder.tx.send(stats);
        }
    }

    async fn stop(&self) {
        let forwarder = lock(&self.forwarder).take();
        if let Some(Forwarder { tx, handle }) = forwarder {
            drop(tx);
            if let Err(e) = handle.await {
                warn!(error = %e, "Progress callback panicked");
            }
        }
    }
}

struct Ticker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Forwards only the latest snapshot, at most once per `period`. The final
/// snapshot is always delivered on stop.
pub struct DelayingProgressReporter {
    callback: ProgressCallback,
    period: Duration,
    latest: Arc<Mutex<Option<Stats>>>,
    ticker: Mutex<Option<Ticker>>,
}

impl DelayingProgressReporter {
    pub fn new(period: Duration, callback: impl Fn(Stats) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
            period,
            latest: Arc::new(Mutex::new(None)),
            ticker: Mutex::new(None),
        }
    }

    fn flush(latest: &Mutex<Option<Stats>>, callback: &ProgressCallback) {
        let stats = lock(latest).take();
        if let Some(stats) = stats {
            callback(stats);
        }
    }
}

#[async_trait]
impl ProgressReporter for DelayingProgressReporter {
    fn start(&self) {
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let latest = Arc::clone(&self.latest);
        let callback = Arc::clone(&self.callback);
        let period = if self.period.is_zero() {
            Duration::from_millis(1)
        } else {
            self.period
        };

        let handle = tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = ticks.tick() => Self::flush(&latest, &callback),
                }
            }
            Self::flush(&latest, &callback);
        });
        *ticker = Some(Ticker { stop, handle });
    }

    fn report(&self, stats: Stats) {
        *lock(&self.latest) = Some(stats);
    }

    async fn stop(&self) {
        let ticker = lock(&self.ticker).take();
        if let Some(Ticker { stop, handle }) = ticker {
            stop.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Progress callback panicked");
            }
        }
    }
}
