//! Trace sessions
//!
//! A [`Session`] ties one capture file to its trace database, the background
//! ingester and the read-side components. [`SessionManager`] keeps track of
//! every open session.

use crate::capture::TraceCapture;
use crate::config::Config;
use crate::db::TraceDb;
use crate::error::{Result, TraceError};
use crate::ingest::Ingester;
use crate::input::{InputText, MatchFragments};
use crate::load::{LoadEvent, LoadMonitor, LoadStatus, PollOutcome, Ticker};
use crate::model::{NodeId, ParseInfo};
use crate::refresh::{RefreshCoordinator, RefreshOutcome, RefreshableView, SubscriptionId, Subscribers};
use crate::stats::Statistics;
use crate::tasks::TaskRunner;
use crate::tree::ParseTree;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Receives errors that cannot be returned to a caller
pub trait ErrorReporter: Send + Sync {
    fn report(&self, title: &str, message: &str, cause: Option<&(dyn std::error::Error + 'static)>);
}

/// Reports through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, title: &str, message: &str, cause: Option<&(dyn std::error::Error + 'static)>) {
        match cause {
            Some(cause) => log::error!("{}: {} ({})", title, message, cause),
            None => log::error!("{}: {}", title, message),
        }
    }
}

/// Called with every load event observed by [`Session::poll_load`]
pub type LoadListener = Arc<dyn Fn(&LoadEvent) + Send + Sync>;

pub struct Session {
    path: PathBuf,
    db: Arc<TraceDb>,
    input: Arc<InputText>,
    tree: Arc<ParseTree>,
    stats: Statistics,
    tasks: TaskRunner,
    ticker: Ticker,
    ingester: Mutex<Option<Ingester>>,
    refresh: RefreshCoordinator,
    listeners: Subscribers<LoadListener>,
    reporter: Arc<dyn ErrorReporter>,
    closed: AtomicBool,
}

impl Session {
    /// Open `path` and start loading it in the background
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        Self::open_with_reporter(path, config, Arc::new(LogReporter))
    }

    pub fn open_with_reporter<P: AsRef<Path>>(
        path: P,
        config: &Config,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_readable(&path)?;

        let capture = TraceCapture::open(&path)?;
        let input = Arc::new(InputText::new(capture.input_text()?));
        let info = capture.parse_info().clone();
        let db = Arc::new(TraceDb::create(
            path.display().to_string(),
            info,
            &config.storage,
        )?);

        let ingester = match Ingester::spawn(capture, db.clone(), config.load.batch_size) {
            Ok(ingester) => ingester,
            Err(e) => {
                let _ = db.close();
                return Err(e);
            }
        };
        log::info!("Opened trace {}", path.display());

        Ok(Self {
            tree: Arc::new(ParseTree::new(db.clone())),
            stats: Statistics::new(db.clone(), input.clone()),
            tasks: TaskRunner::new(config.tasks.workers),
            ticker: Ticker::new(config.load.poll_interval()),
            ingester: Mutex::new(Some(ingester)),
            refresh: RefreshCoordinator::new(db.load_monitor()),
            listeners: Subscribers::new(),
            reporter,
            closed: AtomicBool::new(false),
            path,
            db,
            input,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &Arc<TraceDb> {
        &self.db
    }

    pub fn tree(&self) -> &Arc<ParseTree> {
        &self.tree
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn input(&self) -> &Arc<InputText> {
        &self.input
    }

    pub fn tasks(&self) -> &TaskRunner {
        &self.tasks
    }

    pub fn parse_info(&self) -> ParseInfo {
        self.db.get_parse_info()
    }

    pub fn load_status(&self) -> LoadStatus {
        self.db.get_load_status()
    }

    pub fn monitor(&self) -> LoadMonitor {
        self.db.load_monitor()
    }

    pub fn subscribe_load(&self, listener: LoadListener) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe_load(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Poll the load status until loading ends or the session is closed
    ///
    /// Events go to `sink` and to every load listener.
    pub fn poll_load<F>(&self, mut sink: F) -> PollOutcome
    where
        F: FnMut(&LoadEvent),
    {
        self.monitor().poll(&self.ticker, |event| {
            for listener in self.listeners.snapshot() {
                (*listener)(&event);
            }
            sink(&event);
        })
    }

    pub fn register_view(&self, view: Arc<dyn RefreshableView>) -> SubscriptionId {
        self.refresh.register(view)
    }

    pub fn unregister_view(&self, id: SubscriptionId) -> bool {
        self.refresh.unregister(id)
    }

    pub fn refresh_all(&self) -> RefreshOutcome {
        self.refresh.refresh_all()
    }

    /// Input split around node `id`: its match when it succeeded, a marker
    /// where it failed otherwise
    pub fn node_fragments(&self, id: NodeId) -> Result<MatchFragments> {
        let node = self.db.get_node(id)?;
        Ok(if node.success {
            self.input.success_fragments(node.start, node.end)
        } else {
            self.input.failure_fragments(node.end)
        })
    }

    /// Run `query` in the background and hand its result to `on_ok`
    ///
    /// Failures other than a node that is not loaded yet go to the error
    /// reporter.
    pub fn run_query<T, Q, K>(&self, query: Q, on_ok: K)
    where
        T: 'static,
        Q: FnOnce() -> Result<T> + Send + 'static,
        K: FnOnce(T) + Send + 'static,
    {
        let reporter = self.reporter.clone();
        self.tasks.compute_or_fail(query, on_ok, move |e| {
            if !e.is_recoverable() {
                reporter.report(e.title(), "Background query failed", Some(&e));
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop loading and release the trace database
    ///
    /// Never fails: problems are handed to the error reporter. Returns false
    /// if one was reported. Closing twice is a no-op.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.ticker.cancel();

        let mut clean = true;
        let ingester = self
            .ingester
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut ingester) = ingester {
            ingester.stop();
            if let Err(e) = ingester.join() {
                self.reporter.report(e.title(), "Unable to stop trace loading", Some(&e));
                clean = false;
            }
        }
        // Skipped when closing from a task: queries still queued fail with
        // Closed once the store is gone.
        self.tasks.join();

        if let Err(e) = self.db.close() {
            self.reporter.report(
                e.title(),
                &format!("Unable to close trace {}", self.path.display()),
                Some(&e),
            );
            clean = false;
        }
        log::debug!("Closed trace {}", self.path.display());
        clean
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("status", &self.db.get_load_status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_readable(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(TraceError::FileNotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(TraceError::NotReadable(path.to_path_buf()));
    }
    File::open(path).map_err(|e| {
        log::debug!("Cannot open {}: {}", path.display(), e);
        TraceError::NotReadable(path.to_path_buf())
    })?;
    Ok(())
}

// ============================================================================
// Session registry
// ============================================================================

/// Identifies an open session within a [`SessionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct SessionManager {
    config: Config,
    reporter: Arc<dyn ErrorReporter>,
    next: AtomicU64,
    sessions: Mutex<BTreeMap<SessionHandle, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        Self::with_reporter(config, Arc::new(LogReporter))
    }

    pub fn with_reporter(config: Config, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            config,
            reporter,
            next: AtomicU64::new(1),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<SessionHandle> {
        let session = Session::open_with_reporter(path, &self.config, self.reporter.clone())?;
        let handle = SessionHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.lock()?.insert(handle, Arc::new(session));
        Ok(handle)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.lock().ok()?.get(&handle).cloned()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.lock()
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget one session; false if the handle is unknown
    pub fn close(&self, handle: SessionHandle) -> bool {
        let session = match self.lock() {
            Ok(mut sessions) => sessions.remove(&handle),
            Err(_) => None,
        };
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let sessions = match self.lock() {
            Ok(mut sessions) => std::mem::take(&mut *sessions),
            Err(_) => return,
        };
        for session in sessions.values() {
            session.close();
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<SessionHandle, Arc<Session>>>> {
        self.sessions
            .lock()
            .map_err(|_| TraceError::StorageFailure("session registry poisoned".into()))
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.handles())
            .finish()
    }
}
