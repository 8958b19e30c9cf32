//! SQLite trace database with Diesel ORM
//!
//! Every session gets its own database in a private temporary directory.
//! One ingestion thread writes; any number of readers query concurrently.
//! The database runs in WAL mode, so readers see the last committed batch
//! and never wait for the writer.

use crate::config::StorageConfig;
use crate::error::{Result, TraceError};
use crate::load::{LoadMonitor, LoadStatus, LoadTracker};
use crate::model::{MatcherId, NodeId, ParseInfo, ParseTreeNode, RuleInfo, TraceEvent};
use crate::schema::*;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tempfile::TempDir;

/// Current schema version for trace databases
pub const CURRENT_SCHEMA: TraceSchema = TraceSchema {
    major: 1,
    minor: 0,
    patch: 0,
    name: "parse-trace",
    features: &["matchers", "nodes"],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone)]
pub struct TraceSchema {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl TraceSchema {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl fmt::Display for TraceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} ({})", self.version_string(), self.name)
    }
}

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable schema version
#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
struct NewSchemaVersion<'a> {
    version: &'a str,
    name: &'a str,
    features: &'a str,
    introduced_at: &'a str,
}

/// Insertable matcher declaration
#[derive(Insertable)]
#[diesel(table_name = matchers)]
struct NewMatcher<'a> {
    id: i32,
    class_name: &'a str,
    matcher_type: &'a str,
    name: &'a str,
}

/// Queryable matcher declaration
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = matchers)]
struct MatcherRow {
    id: i32,
    class_name: String,
    matcher_type: String,
    name: String,
}

impl TryFrom<MatcherRow> for RuleInfo {
    type Error = TraceError;

    fn try_from(row: MatcherRow) -> Result<Self> {
        Ok(RuleInfo {
            id: row.id,
            matcher_type: row.matcher_type.parse().map_err(TraceError::StorageFailure)?,
            class_name: row.class_name,
            name: row.name,
        })
    }
}

/// Insertable invocation
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = nodes)]
struct NewNode {
    id: i32,
    parent_id: Option<i32>,
    level: i32,
    success: bool,
    matcher_id: i32,
    start_index: i32,
    end_index: i32,
    nanos: i64,
}

/// Queryable invocation
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = nodes)]
struct NodeRow {
    id: i32,
    parent_id: Option<i32>,
    level: i32,
    success: bool,
    #[allow(dead_code)]
    matcher_id: i32,
    start_index: i32,
    end_index: i32,
    nanos: i64,
}

fn to_tree_node(row: NodeRow, matcher: MatcherRow, children: Vec<NodeId>) -> Result<ParseTreeNode> {
    Ok(ParseTreeNode {
        id: row.id,
        parent: row.parent_id,
        level: row.level as u32,
        rule: RuleInfo::try_from(matcher)?,
        success: row.success,
        start: row.start_index as usize,
        end: row.end_index as usize,
        nanos: row.nanos as u64,
        children,
    })
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Rows per statement, well below SQLite's bound-variable limit
const CHUNK_SIZE: usize = 500;

/// Applied to every pooled connection
#[derive(Debug)]
struct SqliteTuning {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqliteTuning {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Ingestion-side bookkeeping, only touched by the writer
#[derive(Debug, Default)]
struct WriterState {
    next_node: NodeId,
    /// Root-to-current path of (id, level), the usual parent candidates
    path: Vec<(NodeId, u32)>,
    known_matchers: HashSet<MatcherId>,
}

/// Trace store for one session
pub struct TraceDb {
    // Declared before `dir` so connections close before the directory goes
    pool: RwLock<Option<DbPool>>,
    dir: Mutex<Option<TempDir>>,
    db_path: PathBuf,
    label: String,
    info: ParseInfo,
    tracker: Arc<LoadTracker>,
    writer: Mutex<WriterState>,
}

impl TraceDb {
    /// Create an empty trace database in a fresh temporary directory
    pub fn create(label: impl Into<String>, info: ParseInfo, config: &StorageConfig) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("parsedebug-");
        let dir = match &config.temp_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| TraceError::StorageFailure(format!("unable to create database directory: {}", e)))?;

        let db_path = dir.path().join("trace.db");
        let manager = ConnectionManager::<SqliteConnection>::new(db_path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(config.pool_size.max(2))
            .connection_customizer(Box::new(SqliteTuning {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)?;

        let db = Self {
            pool: RwLock::new(Some(pool)),
            dir: Mutex::new(Some(dir)),
            db_path,
            label: label.into(),
            info,
            tracker: Arc::new(LoadTracker::new()),
            writer: Mutex::new(WriterState::default()),
        };
        db.init_schema()?;
        log::debug!("Created trace database {}", db.db_path.display());
        Ok(db)
    }

    /// Location of the SQLite file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` with a pooled connection
    ///
    /// The pool read lock is held for the whole call so that `close` waits
    /// for in-flight queries instead of pulling storage from under them.
    pub(crate) fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T>,
    {
        let guard = self
            .pool
            .read()
            .map_err(|_| TraceError::StorageFailure("connection pool lock poisoned".into()))?;
        let pool = guard.as_ref().ok_or(TraceError::Closed)?;
        let mut conn: DbConn = pool.get()?;
        f(&mut conn)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS schema_versions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                    version TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    features TEXT NOT NULL,
                    introduced_at TEXT NOT NULL
                )
            "#,
            )
            .execute(conn)?;

            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS matchers (
                    id INTEGER PRIMARY KEY NOT NULL,
                    class_name TEXT NOT NULL,
                    matcher_type TEXT NOT NULL,
                    name TEXT NOT NULL
                )
            "#,
            )
            .execute(conn)?;

            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS nodes (
                    id INTEGER PRIMARY KEY NOT NULL,
                    parent_id INTEGER,
                    level INTEGER NOT NULL,
                    success BOOLEAN NOT NULL,
                    matcher_id INTEGER NOT NULL,
                    start_index INTEGER NOT NULL,
                    end_index INTEGER NOT NULL,
                    nanos BIGINT NOT NULL,
                    FOREIGN KEY (parent_id) REFERENCES nodes(id),
                    FOREIGN KEY (matcher_id) REFERENCES matchers(id)
                )
            "#,
            )
            .execute(conn)?;

            // Create indexes
            diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)")
                .execute(conn)?;
            diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_nodes_matcher ON nodes(matcher_id)")
                .execute(conn)?;
            diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_nodes_start ON nodes(start_index)")
                .execute(conn)?;

            let now = chrono::Local::now().to_rfc3339();
            let features = serde_json::to_string(&CURRENT_SCHEMA.features).unwrap_or_default();
            diesel::insert_or_ignore_into(schema_versions::table)
                .values(&NewSchemaVersion {
                    version: &CURRENT_SCHEMA.version_string(),
                    name: CURRENT_SCHEMA.name,
                    features: &features,
                    introduced_at: &now,
                })
                .execute(conn)?;
            Ok(())
        })
    }

    // ========================================================================
    // Ingestion (single writer)
    // ========================================================================

    /// Store one matcher declaration
    pub fn append_matcher(&self, rule: &RuleInfo) -> Result<MatcherId> {
        self.append_matchers(std::slice::from_ref(rule))?;
        Ok(rule.id)
    }

    /// Store matcher declarations in one transaction
    pub fn append_matchers(&self, rules: &[RuleInfo]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let mut writer = self.lock_writer()?;
        let type_names: Vec<&'static str> = rules.iter().map(|r| r.matcher_type.as_str()).collect();
        let rows: Vec<NewMatcher<'_>> = rules
            .iter()
            .zip(&type_names)
            .map(|(r, t)| NewMatcher {
                id: r.id,
                class_name: &r.class_name,
                matcher_type: t,
                name: &r.name,
            })
            .collect();

        self.with_conn(|conn| {
            conn.transaction(|conn| {
                for chunk in rows.chunks(CHUNK_SIZE) {
                    diesel::insert_into(matchers::table).values(chunk).execute(conn)?;
                }
                Ok::<_, TraceError>(())
            })
        })?;

        writer.known_matchers.extend(rules.iter().map(|r| r.id));
        self.tracker.add_matchers(rules.len());
        Ok(())
    }

    /// Store one invocation and return the id it was given
    pub fn append(&self, event: &TraceEvent) -> Result<NodeId> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Store invocations in one transaction; ids are assigned consecutively.
    /// Returns the id given to the first event.
    ///
    /// Every event must name a known matcher and a previously stored parent
    /// one level up; only the first event ever appended may be a root.
    pub fn append_batch(&self, events: &[TraceEvent]) -> Result<NodeId> {
        let mut writer = self.lock_writer()?;
        let first = writer.next_node;
        if events.is_empty() {
            return Ok(first);
        }

        let (rows, path) = self.with_conn(|conn| {
            let mut path = writer.path.clone();
            let mut rows = Vec::with_capacity(events.len());
            for (offset, event) in events.iter().enumerate() {
                let id = first
                    .checked_add(offset as NodeId)
                    .ok_or_else(|| corrupt("too many nodes"))?;
                check_event(conn, &writer.known_matchers, &mut path, (first, rows.as_slice()), id, event)?;
                rows.push(new_node_row(id, event)?);
                path.push((id, event.level));
            }

            conn.transaction(|conn| {
                for chunk in rows.chunks(CHUNK_SIZE) {
                    diesel::insert_into(nodes::table).values(chunk).execute(conn)?;
                }
                Ok::<_, TraceError>(())
            })?;
            Ok((rows, path))
        })?;

        writer.next_node = first + rows.len() as NodeId;
        writer.path = path;
        self.tracker.add_nodes(rows.len());
        Ok(first)
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, WriterState>> {
        self.writer
            .lock()
            .map_err(|_| TraceError::StorageFailure("writer state poisoned".into()))
    }

    pub(crate) fn tracker(&self) -> &Arc<LoadTracker> {
        &self.tracker
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Fetch one node with its rule and child ids
    pub fn get_node(&self, id: NodeId) -> Result<ParseTreeNode> {
        self.with_conn(|conn| {
            conn.transaction(|conn| {
                let (row, matcher) = nodes::table
                    .inner_join(matchers::table)
                    .filter(nodes::id.eq(id))
                    .select((NodeRow::as_select(), MatcherRow::as_select()))
                    .first::<(NodeRow, MatcherRow)>(conn)
                    .optional()?
                    .ok_or(TraceError::NotFound(id))?;
                let children = child_ids(conn, id)?;
                to_tree_node(row, matcher, children)
            })
        })
    }

    /// Ids of the direct children of `id`, in source order
    ///
    /// An unknown or not yet ingested `id` yields `NotFound`.
    pub fn get_children(&self, id: NodeId) -> Result<Vec<NodeId>> {
        self.with_conn(|conn| {
            conn.transaction(|conn| {
                ensure_node(conn, id)?;
                child_ids(conn, id)
            })
        })
    }

    /// Fetch the direct children of `id` fully, in source order
    pub fn get_child_nodes(&self, id: NodeId) -> Result<Vec<ParseTreeNode>> {
        self.with_conn(|conn| {
            conn.transaction(|conn| {
                ensure_node(conn, id)?;
                let rows: Vec<(NodeRow, MatcherRow)> = nodes::table
                    .inner_join(matchers::table)
                    .filter(nodes::parent_id.eq(id))
                    .order(nodes::id.asc())
                    .select((NodeRow::as_select(), MatcherRow::as_select()))
                    .load(conn)?;

                let ids: Vec<NodeId> = rows.iter().map(|(n, _)| n.id).collect();
                let mut grandchildren: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
                for chunk in ids.chunks(CHUNK_SIZE) {
                    let pairs: Vec<(Option<i32>, i32)> = nodes::table
                        .filter(nodes::parent_id.eq_any(chunk.to_vec()))
                        .order(nodes::id.asc())
                        .select((nodes::parent_id, nodes::id))
                        .load(conn)?;
                    for (parent, child) in pairs {
                        if let Some(parent) = parent {
                            grandchildren.entry(parent).or_default().push(child);
                        }
                    }
                }

                rows.into_iter()
                    .map(|(row, matcher)| {
                        let children = grandchildren.remove(&row.id).unwrap_or_default();
                        to_tree_node(row, matcher, children)
                    })
                    .collect()
            })
        })
    }

    /// All matcher declarations loaded so far, by id
    pub fn get_rules(&self) -> Result<Vec<RuleInfo>> {
        self.with_conn(|conn| {
            let rows: Vec<MatcherRow> = matchers::table
                .order(matchers::id.asc())
                .select(MatcherRow::as_select())
                .load(conn)?;
            rows.into_iter().map(RuleInfo::try_from).collect()
        })
    }

    pub fn get_parse_info(&self) -> ParseInfo {
        self.info.clone()
    }

    pub fn get_load_status(&self) -> LoadStatus {
        self.tracker.snapshot()
    }

    pub fn load_monitor(&self) -> LoadMonitor {
        LoadMonitor::new(self.tracker.clone(), self.info.total_records())
    }

    pub fn is_closed(&self) -> bool {
        self.pool.read().map(|p| p.is_none()).unwrap_or(true)
    }

    /// Release the database and delete its directory
    ///
    /// Waits for in-flight queries, after which every query fails with
    /// `Closed`. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let pool = self
            .pool
            .write()
            .map_err(|_| TraceError::StorageFailure("connection pool lock poisoned".into()))?
            .take();
        let Some(pool) = pool else {
            return Ok(());
        };
        drop(pool);

        let dir = self
            .dir
            .lock()
            .map_err(|_| TraceError::StorageFailure("database directory lock poisoned".into()))?
            .take();
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            dir.close().map_err(|e| {
                TraceError::StorageFailure(format!("unable to remove {}: {}", path.display(), e))
            })?;
        }
        log::debug!("Closed trace database for {}", self.label);
        Ok(())
    }
}

impl fmt::Display for TraceDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl fmt::Debug for TraceDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceDb")
            .field("label", &self.label)
            .field("db_path", &self.db_path)
            .field("status", &self.tracker.snapshot())
            .finish()
    }
}

fn corrupt(msg: impl Into<String>) -> TraceError {
    TraceError::CorruptFormat(msg.into())
}

fn child_ids(conn: &mut SqliteConnection, id: NodeId) -> Result<Vec<NodeId>> {
    Ok(nodes::table
        .filter(nodes::parent_id.eq(id))
        .order(nodes::id.asc())
        .select(nodes::id)
        .load(conn)?)
}

fn ensure_node(conn: &mut SqliteConnection, id: NodeId) -> Result<()> {
    let found: Option<i32> = nodes::table
        .filter(nodes::id.eq(id))
        .select(nodes::id)
        .first(conn)
        .optional()?;
    found.map(|_| ()).ok_or(TraceError::NotFound(id))
}

/// Validate `event` as node `id` against the tree built so far
fn check_event(
    conn: &mut SqliteConnection,
    known_matchers: &HashSet<MatcherId>,
    path: &mut Vec<(NodeId, u32)>,
    (batch_first, batch): (NodeId, &[NewNode]),
    id: NodeId,
    event: &TraceEvent,
) -> Result<()> {
    if !known_matchers.contains(&event.matcher_id) {
        return Err(corrupt(format!(
            "node {} refers to unknown matcher {}",
            id, event.matcher_id
        )));
    }
    if event.start > event.end {
        return Err(corrupt(format!(
            "node {} ends ({}) before it starts ({})",
            id, event.end, event.start
        )));
    }

    let parent = match event.parent {
        None if id == 0 && event.level == 0 => return Ok(()),
        None if id == 0 => {
            return Err(corrupt(format!("root node has level {}", event.level)));
        }
        None => return Err(corrupt(format!("node {} has no parent", id))),
        Some(parent) => parent,
    };
    if parent >= id {
        return Err(corrupt(format!(
            "node {} has parent {} which was not ingested before it",
            id, parent
        )));
    }

    // Nodes normally arrive depth first, so the parent is on the open path
    while path.last().is_some_and(|(top, _)| *top != parent) {
        path.pop();
    }
    let parent_level = match path.last() {
        Some((_, level)) => *level,
        None => {
            let level: Option<i32> = if parent >= batch_first {
                batch.get((parent - batch_first) as usize).map(|row| row.level)
            } else {
                nodes::table
                    .filter(nodes::id.eq(parent))
                    .select(nodes::level)
                    .first(conn)
                    .optional()?
            };
            let level = level.ok_or_else(|| {
                corrupt(format!("node {} refers to unknown parent {}", id, parent))
            })? as u32;
            path.push((parent, level));
            level
        }
    };

    if event.level != parent_level + 1 {
        return Err(corrupt(format!(
            "node {} has level {} but its parent {} has level {}",
            id, event.level, parent, parent_level
        )));
    }
    Ok(())
}

fn new_node_row(id: NodeId, event: &TraceEvent) -> Result<NewNode> {
    let too_large = |what: &str| corrupt(format!("node {}: {} out of range", id, what));
    Ok(NewNode {
        id,
        parent_id: event.parent,
        level: i32::try_from(event.level).map_err(|_| too_large("level"))?,
        success: event.success,
        matcher_id: event.matcher_id,
        start_index: i32::try_from(event.start).map_err(|_| too_large("start"))?,
        end_index: i32::try_from(event.end).map_err(|_| too_large("end"))?,
        nanos: i64::try_from(event.nanos).map_err(|_| too_large("nanos"))?,
    })
}
