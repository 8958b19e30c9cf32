//! View refresh barrier and subscriber lists
//!
//! A refresh fans out to every registered view, each of which reloads on its
//! own schedule and signals completion through a [`RefreshHandle`]. Further
//! refreshes are refused until all of them are done.

use crate::load::LoadMonitor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// Returned by [`Subscribers::subscribe`]; pass it back to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of subscribers with explicit unsubscription
#[derive(Debug)]
pub struct Subscribers<T> {
    next: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, T)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: T) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut entries) = self.entries.write() {
            entries.push((id, subscriber));
        }
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|(entry, _)| *entry != id);
                entries.len() != before
            }
            Err(_) => false,
        }
    }

    /// Current subscribers in subscription order
    ///
    /// Callers iterate the copy, so subscribers may (un)subscribe while
    /// being notified.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries
            .read()
            .map(|entries| entries.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

/// Count-down latch
#[derive(Debug)]
pub struct Latch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.zero.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.lock()
    }

    pub fn wait(&self) {
        let _guard = self
            .zero
            .wait_while(self.lock(), |remaining| *remaining > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Returns false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (_guard, result) = self
            .zero
            .wait_timeout_while(self.lock(), timeout, |remaining| *remaining > 0)
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }

    // Poisoning leaves the count intact; keep counting
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion signal handed to a refreshing view
///
/// Dropping it without calling [`done`](Self::done) also signals completion,
/// so a view that fails cannot hold the barrier forever.
#[derive(Debug)]
pub struct RefreshHandle {
    latch: Option<Arc<Latch>>,
}

impl RefreshHandle {
    fn new(latch: Arc<Latch>) -> Self {
        Self { latch: Some(latch) }
    }

    pub fn done(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.count_down();
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Something that reloads its data from the store on request
pub trait RefreshableView: Send + Sync {
    fn name(&self) -> &str;

    /// Start reloading; signal `done` once finished (possibly on another
    /// thread). Must not block on the refresh itself.
    fn refresh(&self, done: RefreshHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Views reloaded, loading still in progress
    Refreshed,
    /// Views reloaded and loading is over; the progress toolbar can go
    LoadComplete,
    /// Another refresh is in progress
    Busy,
}

/// Fans refresh requests out to the registered views
pub struct RefreshCoordinator {
    views: Subscribers<Arc<dyn RefreshableView>>,
    monitor: LoadMonitor,
    refreshing: AtomicBool,
}

/// Re-enables refresh even if a view panics mid-fan-out
struct Enabled<'a>(&'a AtomicBool);

impl Drop for Enabled<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RefreshCoordinator {
    pub fn new(monitor: LoadMonitor) -> Self {
        Self {
            views: Subscribers::new(),
            monitor,
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn register(&self, view: Arc<dyn RefreshableView>) -> SubscriptionId {
        self.views.subscribe(view)
    }

    pub fn unregister(&self, id: SubscriptionId) -> bool {
        self.views.unsubscribe(id)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Refresh every view and wait until all have completed
    pub fn refresh_all(&self) -> RefreshOutcome {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RefreshOutcome::Busy;
        }
        let _enabled = Enabled(&self.refreshing);

        let views = self.views.snapshot();
        let latch = Arc::new(Latch::new(views.len()));
        for view in &views {
            log::debug!("Refreshing view {}", view.name());
            view.refresh(RefreshHandle::new(latch.clone()));
        }
        latch.wait();

        if self.monitor.is_ready() {
            RefreshOutcome::LoadComplete
        } else {
            RefreshOutcome::Refreshed
        }
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("views", &self.views.len())
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadTracker;
    use std::sync::mpsc;
    use std::thread;

    /// Completes on a background thread after `delay`
    struct SlowView {
        name: String,
        delay: Duration,
        finished: Arc<AtomicBool>,
    }

    impl RefreshableView for SlowView {
        fn name(&self) -> &str {
            &self.name
        }

        fn refresh(&self, done: RefreshHandle) {
            let delay = self.delay;
            let finished = self.finished.clone();
            thread::spawn(move || {
                thread::sleep(delay);
                finished.store(true, Ordering::SeqCst);
                done.done();
            });
        }
    }

    /// Drops its handle without signalling
    struct BrokenView;

    impl RefreshableView for BrokenView {
        fn name(&self) -> &str {
            "broken"
        }

        fn refresh(&self, _done: RefreshHandle) {}
    }

    fn view(name: &str, millis: u64) -> (Arc<SlowView>, Arc<AtomicBool>) {
        let finished = Arc::new(AtomicBool::new(false));
        let view = Arc::new(SlowView {
            name: name.into(),
            delay: Duration::from_millis(millis),
            finished: finished.clone(),
        });
        (view, finished)
    }

    fn coordinator(ready: bool) -> RefreshCoordinator {
        let tracker = Arc::new(LoadTracker::new());
        tracker.start();
        if ready {
            tracker.finish();
        }
        RefreshCoordinator::new(LoadMonitor::new(tracker, 0))
    }

    #[test]
    fn test_waits_for_every_view() {
        let coordinator = coordinator(false);
        let mut flags = Vec::new();
        for (name, millis) in [("tree", 5), ("rules", 10), ("depth", 150)] {
            let (view, finished) = view(name, millis);
            coordinator.register(view);
            flags.push(finished);
        }
        coordinator.register(Arc::new(BrokenView));

        assert_eq!(coordinator.refresh_all(), RefreshOutcome::Refreshed);
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
        assert!(!coordinator.is_refreshing());
    }

    #[test]
    fn test_refresh_disabled_while_in_progress() {
        let coordinator = Arc::new(coordinator(true));
        let (view, _) = view("slow", 300);
        coordinator.register(view);

        let (tx, rx) = mpsc::channel();
        let background = {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                tx.send(()).unwrap();
                coordinator.refresh_all()
            })
        };
        rx.recv().unwrap();
        while !coordinator.is_refreshing() {
            thread::yield_now();
        }
        assert_eq!(coordinator.refresh_all(), RefreshOutcome::Busy);
        assert_eq!(background.join().unwrap(), RefreshOutcome::LoadComplete);
        // Enabled again afterwards
        assert_eq!(coordinator.refresh_all(), RefreshOutcome::LoadComplete);
    }

    #[test]
    fn test_no_views() {
        assert_eq!(coordinator(true).refresh_all(), RefreshOutcome::LoadComplete);
    }

    #[test]
    fn test_subscribers() {
        let subscribers: Subscribers<&'static str> = Subscribers::new();
        let a = subscribers.subscribe("a");
        let b = subscribers.subscribe("b");
        assert_ne!(a, b);
        assert_eq!(subscribers.snapshot(), vec!["a", "b"]);
        assert!(subscribers.unsubscribe(a));
        assert!(!subscribers.unsubscribe(a));
        assert_eq!(subscribers.snapshot(), vec!["b"]);
        subscribers.clear();
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_latch_timeout() {
        let latch = Latch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(5)));
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_poisoned_latch_keeps_counting() {
        let latch = Arc::new(Latch::new(2));
        let poisoner = latch.clone();
        let result = thread::spawn(move || {
            let _guard = poisoner.remaining.lock().unwrap();
            panic!("view crashed while holding the latch");
        })
        .join();
        assert!(result.is_err());
        assert!(latch.remaining.is_poisoned());

        assert_eq!(latch.count(), 2);
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
        latch.count_down();
        assert_eq!(latch.count(), 1);
        assert!(!latch.wait_timeout(Duration::from_millis(5)));

        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        latch.count_down();
        waiter.join().unwrap();
        assert_eq!(latch.count(), 0);
    }
}
