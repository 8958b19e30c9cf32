//! Background ingestion of a capture into a trace database
//!
//! A single thread streams the capture into the store batch by batch. Errors
//! never reach readers directly: they move the load state to `Failed` and
//! are logged.

use crate::capture::TraceCapture;
use crate::db::TraceDb;
use crate::error::{Result, TraceError};
use crate::model::{NodeId, RuleInfo, TraceEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Message recorded when ingestion is stopped before completion
pub const CANCELLED_MESSAGE: &str = "ingestion cancelled";

/// What one ingestion run stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub matchers: usize,
    pub nodes: usize,
}

/// Handle on the ingestion thread
#[derive(Debug)]
pub struct Ingester {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ingester {
    /// Start ingesting `capture` into `db` on a new thread
    pub fn spawn(capture: TraceCapture, db: Arc<TraceDb>, batch_size: usize) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let handle = thread::Builder::new()
            .name("trace-ingest".into())
            .spawn(move || run(&capture, &db, batch_size, &flag))
            .map_err(|e| TraceError::StorageFailure(format!("unable to start ingestion: {}", e)))?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Ask the thread to stop after the batch in progress
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Wait for the thread to exit. Calling it again is a no-op.
    pub fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| TraceError::StorageFailure("ingestion thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for Ingester {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}

fn run(capture: &TraceCapture, db: &TraceDb, batch_size: usize, cancel: &AtomicBool) {
    let tracker = db.tracker().clone();
    if !tracker.start() {
        log::warn!("Ingestion of {} already started", db);
        return;
    }

    let started = Instant::now();
    match ingest(capture, db, batch_size, cancel) {
        Ok(summary) => {
            tracker.finish();
            log::info!(
                "Loaded {} matchers and {} nodes from {} in {:.2?}",
                summary.matchers,
                summary.nodes,
                db,
                started.elapsed()
            );
        }
        Err(_) if cancel.load(Ordering::Acquire) => {
            tracker.fail(CANCELLED_MESSAGE);
            log::info!("Ingestion of {} cancelled", db);
        }
        Err(e) => {
            log::error!("Ingestion of {} failed: {}", db, e);
            tracker.fail(e.to_string());
        }
    }
}

/// Stream `capture` into `db`, committing every `batch_size` records
///
/// Returns `Closed` as soon as `cancel` is observed between batches.
pub fn ingest(
    capture: &TraceCapture,
    db: &TraceDb,
    batch_size: usize,
    cancel: &AtomicBool,
) -> Result<IngestSummary> {
    let batch_size = batch_size.max(1);
    let check_cancel = || {
        if cancel.load(Ordering::Acquire) {
            Err(TraceError::Closed)
        } else {
            Ok(())
        }
    };

    let mut rules: Vec<RuleInfo> = Vec::with_capacity(batch_size);
    let mut matchers = 0;
    capture.for_each_matcher(|rule| {
        rules.push(rule);
        if rules.len() >= batch_size {
            check_cancel()?;
            db.append_matchers(&rules)?;
            matchers += rules.len();
            rules.clear();
        }
        Ok::<_, TraceError>(())
    })?;
    check_cancel()?;
    db.append_matchers(&rules)?;
    matchers += rules.len();
    log::debug!("{}: {} matchers stored", db, matchers);

    let mut events: Vec<TraceEvent> = Vec::with_capacity(batch_size);
    let mut next: NodeId = 0;
    let flush = |events: &mut Vec<TraceEvent>, next: NodeId| -> Result<()> {
        check_cancel()?;
        let expected = next - events.len() as NodeId;
        let first = db.append_batch(events)?;
        if first != expected {
            return Err(TraceError::CorruptFormat(format!(
                "batch stored at node {} instead of {}",
                first, expected
            )));
        }
        events.clear();
        Ok(())
    };

    capture.for_each_node(|id, event| {
        if id != next {
            return Err(TraceError::CorruptFormat(format!(
                "expected node {} but the capture lists node {}",
                next, id
            )));
        }
        events.push(event);
        next += 1;
        if events.len() >= batch_size {
            flush(&mut events, next)?;
        }
        Ok(())
    })?;
    if !events.is_empty() {
        flush(&mut events, next)?;
    }

    let nodes = next as usize;
    let expected = db.get_parse_info();
    if expected.nr_nodes != nodes || expected.nr_matchers != matchers {
        log::warn!(
            "{}: header announces {} matchers and {} nodes, found {} and {}",
            db,
            expected.nr_matchers,
            expected.nr_nodes,
            matchers,
            nodes
        );
    }
    Ok(IngestSummary { matchers, nodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureBuilder;
    use crate::config::StorageConfig;
    use crate::load::LoadState;
    use crate::capture::{INFO_ENTRY, INPUT_ENTRY, MATCHERS_ENTRY, NODES_ENTRY};
    use crate::model::MatcherType;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn capture(dir: &TempDir, nodes: usize) -> TraceCapture {
        let mut builder = CaptureBuilder::new("1+2");
        let expr = builder.rule("SequenceMatcher", MatcherType::Sequence, "Expr");
        let digit = builder.rule("CharRangeMatcher", MatcherType::Terminal, "Digit");
        let root = builder.node(None, expr, true, 0, 3, 500);
        for i in 1..nodes {
            builder.node(Some(root), digit, i % 2 == 0, 0, 1, 5);
        }
        let path = dir.path().join("trace.zip");
        builder.write_to(&path).unwrap();
        TraceCapture::open(&path).unwrap()
    }

    fn store(capture: &TraceCapture) -> Arc<TraceDb> {
        Arc::new(
            TraceDb::create("test", capture.parse_info().clone(), &StorageConfig::default())
                .unwrap(),
        )
    }

    #[test]
    fn test_ingest_in_small_batches() {
        let dir = TempDir::new().unwrap();
        let capture = capture(&dir, 25);
        let db = store(&capture);
        let summary = ingest(&capture, &db, 4, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary, IngestSummary { matchers: 2, nodes: 25 });
        assert_eq!(db.get_children(0).unwrap().len(), 24);
        assert_eq!(db.get_load_status().loaded_nodes, 25);
    }

    #[test]
    fn test_spawned_ingester_reaches_ready() {
        let dir = TempDir::new().unwrap();
        let capture = capture(&dir, 10);
        let db = store(&capture);
        let mut ingester = Ingester::spawn(capture, db.clone(), 3).unwrap();
        ingester.join().unwrap();
        assert!(ingester.is_finished());
        let status = db.get_load_status();
        assert_eq!(status.state, LoadState::Ready);
        assert_eq!(status.loaded_records(), 12);
        ingester.join().unwrap();
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let capture = capture(&dir, 10);
        let db = store(&capture);
        let result = ingest(&capture, &db, 3, &AtomicBool::new(true));
        assert!(matches!(result, Err(TraceError::Closed)));
        assert_eq!(db.get_load_status().loaded_nodes, 0);
    }

    #[test]
    fn test_failure_sets_failed_state() {
        let dir = TempDir::new().unwrap();
        let capture = capture(&dir, 5);
        let db = store(&capture);
        // A closed store rejects the first batch
        db.close().unwrap();
        let mut ingester = Ingester::spawn(capture, db.clone(), 2).unwrap();
        ingester.join().unwrap();
        let status = db.get_load_status();
        assert_eq!(status.state, LoadState::Failed);
        assert!(status.error.is_some());
    }

    /// Capture with three nodes listed verbatim as `nodes`
    fn raw_capture(dir: &TempDir, nodes: &str) -> TraceCapture {
        let path = dir.path().join("raw.zip");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        for (name, body) in [
            (INFO_ENTRY, "0;1;3;3\n"),
            (MATCHERS_ENTRY, "0;SequenceMatcher;SEQUENCE;Rule\n"),
            (NODES_ENTRY, nodes),
            (INPUT_ENTRY, "abc"),
        ] {
            zip.start_file(name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        TraceCapture::open(&path).unwrap()
    }

    fn corrupt_message(nodes: &str) -> String {
        let dir = TempDir::new().unwrap();
        let capture = raw_capture(&dir, nodes);
        let db = store(&capture);
        match ingest(&capture, &db, 2, &AtomicBool::new(false)) {
            Err(TraceError::CorruptFormat(message)) => message,
            other => panic!("expected a corrupt capture, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_in_node_ids() {
        let message = corrupt_message("-1;0;0;1;0;0;3;5\n0;2;1;1;0;0;1;5\n2;3;2;1;0;0;1;5\n");
        assert_eq!(message, "expected node 1 but the capture lists node 2");
    }

    #[test]
    fn test_skipped_level() {
        let message = corrupt_message("-1;0;0;1;0;0;3;5\n0;1;2;1;0;0;1;5\n1;2;3;1;0;0;1;5\n");
        assert_eq!(message, "node 1 has level 2 but its parent 0 has level 0");
    }

    #[test]
    fn test_unknown_matcher() {
        let message = corrupt_message("-1;0;0;1;0;0;3;5\n0;1;1;1;7;0;1;5\n1;2;2;1;0;0;1;5\n");
        assert_eq!(message, "node 1 refers to unknown matcher 7");
    }

    #[test]
    fn test_corrupt_capture_fails_the_load() {
        let dir = TempDir::new().unwrap();
        let capture = raw_capture(&dir, "-1;0;0;1;0;0;3;5\n0;1;1;9;0;0;1;5\n");
        let db = store(&capture);
        let mut ingester = Ingester::spawn(capture, db.clone(), 1).unwrap();
        ingester.join().unwrap();

        let status = db.get_load_status();
        assert_eq!(status.state, LoadState::Failed);
        let error = status.error.unwrap();
        assert!(error.starts_with("Corrupt trace capture:"), "{}", error);
        assert!(error.contains("success flag must be 0 or 1, got 9"), "{}", error);
        assert_eq!(status.loaded_nodes, 1);
    }
}
