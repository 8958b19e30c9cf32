//! Ingestion progress tracking
//!
//! The ingester is the only writer of [`LoadTracker`]; everyone else reads
//! snapshots through a [`LoadMonitor`]. Progress is observed by polling on a
//! [`Ticker`] rather than by notification, so the writer never waits on
//! readers.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Ingestion state machine: NotStarted -> Loading -> Ready | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    NotStarted,
    Loading,
    Ready,
    Failed,
}

impl LoadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoadState::NotStarted,
            1 => LoadState::Loading,
            2 => LoadState::Ready,
            _ => LoadState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LoadState::NotStarted => 0,
            LoadState::Loading => 1,
            LoadState::Ready => 2,
            LoadState::Failed => 3,
        }
    }

    /// No further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadState::Ready | LoadState::Failed)
    }
}

/// Point-in-time view of ingestion progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadStatus {
    pub loaded_matchers: usize,
    pub loaded_nodes: usize,
    pub state: LoadState,
    /// Set once the state is Failed
    pub error: Option<String>,
}

impl LoadStatus {
    pub fn is_ready(&self) -> bool {
        self.state == LoadState::Ready
    }

    pub fn loaded_records(&self) -> usize {
        self.loaded_matchers + self.loaded_nodes
    }
}

/// Shared counters written by the ingester
#[derive(Debug, Default)]
pub struct LoadTracker {
    matchers: AtomicUsize,
    nodes: AtomicUsize,
    state: AtomicU8,
    error: Mutex<Option<String>>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// NotStarted -> Loading; false if ingestion already started
    pub fn start(&self) -> bool {
        self.transition(LoadState::NotStarted, LoadState::Loading)
    }

    pub fn add_matchers(&self, n: usize) {
        self.matchers.fetch_add(n, Ordering::Release);
    }

    pub fn add_nodes(&self, n: usize) {
        self.nodes.fetch_add(n, Ordering::Release);
    }

    /// Loading -> Ready
    pub fn finish(&self) -> bool {
        self.transition(LoadState::Loading, LoadState::Ready)
    }

    /// Any non-terminal state -> Failed
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if LoadState::from_u8(current).is_terminal() {
                return false;
            }
            // Record the message before publishing the state so readers that
            // see Failed always see its cause.
            if let Ok(mut slot) = self.error.lock() {
                *slot = Some(message.clone());
            }
            match self.state.compare_exchange(
                current,
                LoadState::Failed.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> LoadStatus {
        let state = self.state();
        let error = if state == LoadState::Failed {
            self.error.lock().ok().and_then(|e| e.clone())
        } else {
            None
        };
        LoadStatus {
            loaded_matchers: self.matchers.load(Ordering::Acquire),
            loaded_nodes: self.nodes.load(Ordering::Acquire),
            state,
            error,
        }
    }

    fn transition(&self, from: LoadState, to: LoadState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Cancellable fixed-interval sleeper
#[derive(Debug)]
pub struct Ticker {
    interval: Duration,
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cancelled: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep one interval. Returns false if the ticker was cancelled.
    pub fn wait(&self) -> bool {
        let guard = match self.cancelled.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        match self
            .wakeup
            .wait_timeout_while(guard, self.interval, |cancelled| !*cancelled)
        {
            Ok((cancelled, _)) => !*cancelled,
            Err(_) => false,
        }
    }

    /// Wake any waiter; every later wait returns false immediately
    pub fn cancel(&self) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            *cancelled = true;
        }
        self.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.lock().map(|c| *c).unwrap_or(true)
    }
}

/// What a polling consumer is told
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoadEvent {
    /// Loading is under way; show the progress toolbar
    Started { total: usize },
    Progress { total: usize, current: usize },
    Complete,
    Failed { message: String },
}

/// How a poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    AlreadyReady,
    Complete,
    Failed,
    Cancelled,
}

/// Read-only access to ingestion progress
#[derive(Debug, Clone)]
pub struct LoadMonitor {
    tracker: Arc<LoadTracker>,
    total: usize,
}

impl LoadMonitor {
    pub fn new(tracker: Arc<LoadTracker>, total: usize) -> Self {
        Self { tracker, total }
    }

    pub fn status(&self) -> LoadStatus {
        self.tracker.snapshot()
    }

    pub fn is_ready(&self) -> bool {
        self.tracker.state() == LoadState::Ready
    }

    /// Expected matchers + nodes once loading completes
    pub fn total(&self) -> usize {
        self.total
    }

    /// Sample the load status once per tick until loading ends or the ticker
    /// is cancelled, reporting each sample to `sink`.
    pub fn poll<F>(&self, ticker: &Ticker, mut sink: F) -> PollOutcome
    where
        F: FnMut(LoadEvent),
    {
        let mut status = self.status();
        if status.is_ready() {
            return PollOutcome::AlreadyReady;
        }

        let total = self.total;
        sink(LoadEvent::Started { total });

        loop {
            if status.state == LoadState::Failed {
                let message = status
                    .error
                    .unwrap_or_else(|| "ingestion failed".to_string());
                log::warn!("Trace load failed: {}", message);
                sink(LoadEvent::Failed { message });
                return PollOutcome::Failed;
            }
            if status.is_ready() {
                break;
            }
            if !ticker.wait() {
                log::debug!("Load status polling cancelled");
                return PollOutcome::Cancelled;
            }
            status = self.status();
            sink(LoadEvent::Progress {
                total,
                current: status.loaded_records(),
            });
        }

        sink(LoadEvent::Complete);
        PollOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_state_machine_transitions() {
        let tracker = LoadTracker::new();
        assert_eq!(tracker.state(), LoadState::NotStarted);
        assert!(!tracker.finish());
        assert!(tracker.start());
        assert!(!tracker.start());
        assert!(tracker.finish());
        assert_eq!(tracker.state(), LoadState::Ready);
        // Ready is final
        assert!(!tracker.fail("late error"));
        assert!(tracker.snapshot().is_ready());
        assert!(tracker.snapshot().error.is_none());
    }

    #[test]
    fn test_failure_records_message() {
        let tracker = LoadTracker::new();
        tracker.start();
        tracker.add_matchers(3);
        assert!(tracker.fail("disk full"));
        let status = tracker.snapshot();
        assert_eq!(status.state, LoadState::Failed);
        assert_eq!(status.error.as_deref(), Some("disk full"));
        assert_eq!(status.loaded_matchers, 3);
        assert!(!tracker.finish());
    }

    #[test]
    fn test_ticker_cancel_wakes_waiter() {
        let ticker = Arc::new(Ticker::new(Duration::from_secs(30)));
        let t = ticker.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || t.wait());
        thread::sleep(Duration::from_millis(20));
        ticker.cancel();
        assert!(!handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!ticker.wait());
    }

    #[test]
    fn test_poll_already_ready_emits_nothing() {
        let tracker = Arc::new(LoadTracker::new());
        tracker.start();
        tracker.finish();
        let monitor = LoadMonitor::new(tracker, 10);
        let mut events = Vec::new();
        let outcome = monitor.poll(&Ticker::new(Duration::from_millis(1)), |e| events.push(e));
        assert_eq!(outcome, PollOutcome::AlreadyReady);
        assert!(events.is_empty());
    }

    #[test]
    fn test_poll_reports_monotonic_progress_until_complete() {
        let tracker = Arc::new(LoadTracker::new());
        tracker.start();
        let monitor = LoadMonitor::new(tracker.clone(), 12);

        let (go_tx, go_rx) = std::sync::mpsc::channel();
        let writer = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                go_rx.recv().unwrap();
                tracker.add_matchers(2);
                for _ in 0..10 {
                    thread::sleep(Duration::from_millis(2));
                    tracker.add_nodes(1);
                }
                tracker.finish();
            })
        };

        let mut events = Vec::new();
        let outcome = monitor.poll(&Ticker::new(Duration::from_millis(1)), |e| {
            if matches!(e, LoadEvent::Started { .. }) {
                go_tx.send(()).unwrap();
            }
            events.push(e)
        });
        writer.join().unwrap();

        assert_eq!(outcome, PollOutcome::Complete);
        assert_eq!(events.first(), Some(&LoadEvent::Started { total: 12 }));
        assert_eq!(events.last(), Some(&LoadEvent::Complete));

        let currents: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::Progress { total, current } => {
                    assert_eq!(*total, 12);
                    Some(*current)
                }
                _ => None,
            })
            .collect();
        assert!(currents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(currents.last(), Some(&12));
    }

    #[test]
    fn test_poll_stops_on_failure() {
        let tracker = Arc::new(LoadTracker::new());
        tracker.start();
        tracker.fail("corrupt record");
        let monitor = LoadMonitor::new(tracker, 5);
        let mut events = Vec::new();
        let outcome = monitor.poll(&Ticker::new(Duration::from_millis(1)), |e| events.push(e));
        assert_eq!(outcome, PollOutcome::Failed);
        assert_eq!(
            events.last(),
            Some(&LoadEvent::Failed {
                message: "corrupt record".into()
            })
        );
    }

    #[test]
    fn test_poll_cancelled() {
        let tracker = Arc::new(LoadTracker::new());
        tracker.start();
        let monitor = LoadMonitor::new(tracker, 5);
        let ticker = Ticker::new(Duration::from_millis(1));
        ticker.cancel();
        let outcome = monitor.poll(&ticker, |_| {});
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
