//! parsedebug - post-mortem debugging of parser traces
//!
//! A tracing parser run records every rule invocation: which rule ran, over
//! which part of the input, whether it matched, how long it took and which
//! invocation called it. parsedebug loads such a capture into a SQLite trace
//! database on a background thread and answers questions about it while the
//! load is still running.
//!
//! # Components
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`capture`] | Reads (and writes) zip trace captures |
//! | [`db`] | Trace store: single writer, concurrent readers |
//! | [`ingest`] | Background ingestion thread |
//! | [`load`] | Load state machine and progress polling |
//! | [`tree`] | Lazy parse tree materialization |
//! | [`stats`] | Per-rule, per-class and per-type statistics |
//! | [`input`] | Line/column lookup and match fragments |
//! | [`refresh`] | View refresh barrier and subscriber lists |
//! | [`session`] | Session lifecycle and registry |
//!
//! # Quick Start
//!
//! ```no_run
//! use parsedebug::{Config, Session};
//!
//! let session = Session::open("trace.zip", &Config::load()).unwrap();
//! session.poll_load(|event| eprintln!("{:?}", event));
//!
//! let root = session.tree().root().unwrap();
//! println!("{} took {} ns", root, root.nanos);
//! for rule in session.statistics().rule_statistics().unwrap() {
//!     println!("{}: {} invocations", rule.name, rule.invocations);
//! }
//! session.close();
//! ```

pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod input;
pub mod load;
pub mod model;
pub mod refresh;
pub mod schema;
pub mod session;
pub mod stats;
pub mod tasks;
pub mod tree;

pub use capture::{CaptureBuilder, TraceCapture};
pub use config::Config;
pub use db::{TraceDb, CURRENT_SCHEMA};
pub use error::{CaptureError, Result, TraceError};
pub use input::{InputText, InputTextInfo, MatchFragments, Position};
pub use load::{LoadEvent, LoadMonitor, LoadState, LoadStatus, PollOutcome, Ticker};
pub use model::{MatcherId, MatcherType, NodeId, ParseInfo, ParseTreeNode, RuleInfo, TraceEvent, ROOT_NODE};
pub use refresh::{RefreshCoordinator, RefreshHandle, RefreshOutcome, RefreshableView, SubscriptionId, Subscribers};
pub use session::{ErrorReporter, LogReporter, Session, SessionHandle, SessionManager};
pub use stats::{format_nanos, PerClassStatistics, RuleStatistics, Statistics};
pub use tasks::TaskRunner;
pub use tree::{ParseTree, TreeItem};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify core types are re-exported from crate root
        assert_eq!(CURRENT_SCHEMA.version_string(), "1.0.0");
        assert_eq!(ROOT_NODE, 0);
    }
}
