//! Rule and matcher statistics
//!
//! Nothing is cached: each call runs one aggregate statement over whatever
//! has been ingested so far, so results are a consistent snapshot and later
//! calls see at least as much data.

use crate::db::TraceDb;
use crate::error::{Result, TraceError};
use crate::input::InputText;
use crate::model::{MatcherId, MatcherType, ROOT_NODE};
use crate::schema::nodes;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Aggregates for one matcher class
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerClassStatistics {
    pub class_name: String,
    pub invocations: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub total_nanos: u64,
    pub average_nanos: u64,
}

/// Aggregates for one rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStatistics {
    pub matcher_id: MatcherId,
    pub name: String,
    pub class_name: String,
    pub matcher_type: MatcherType,
    pub invocations: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub total_nanos: u64,
    pub average_nanos: u64,
}

/// successes / invocations, 0 when nothing ran
pub fn success_rate(successes: u64, invocations: u64) -> f64 {
    if invocations == 0 {
        0.0
    } else {
        successes as f64 / invocations as f64
    }
}

/// total / invocations, 0 when nothing ran
pub fn average_nanos(total_nanos: u64, invocations: u64) -> u64 {
    total_nanos.checked_div(invocations).unwrap_or(0)
}

// ============================================================================
// Raw aggregate rows
// ============================================================================

#[derive(QueryableByName, Debug)]
struct TypeCountRow {
    #[diesel(sql_type = Text)]
    matcher_type: String,
    #[diesel(sql_type = BigInt)]
    invocations: i64,
}

#[derive(QueryableByName, Debug)]
struct ClassRow {
    #[diesel(sql_type = Text)]
    class_name: String,
    #[diesel(sql_type = BigInt)]
    invocations: i64,
    #[diesel(sql_type = BigInt)]
    successes: i64,
    #[diesel(sql_type = BigInt)]
    total_nanos: i64,
}

#[derive(QueryableByName, Debug)]
struct RuleRow {
    #[diesel(sql_type = Integer)]
    id: i32,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    class_name: String,
    #[diesel(sql_type = Text)]
    matcher_type: String,
    #[diesel(sql_type = BigInt)]
    invocations: i64,
    #[diesel(sql_type = BigInt)]
    successes: i64,
    #[diesel(sql_type = BigInt)]
    total_nanos: i64,
}

fn count(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn matcher_type(raw: &str) -> Result<MatcherType> {
    raw.parse().map_err(TraceError::StorageFailure)
}

/// Statistics over one trace store
#[derive(Debug, Clone)]
pub struct Statistics {
    db: Arc<TraceDb>,
    input: Arc<InputText>,
}

impl Statistics {
    pub fn new(db: Arc<TraceDb>, input: Arc<InputText>) -> Self {
        Self { db, input }
    }

    /// Invocation count per matcher type, for types invoked at least once
    pub fn matchers_by_type(&self) -> Result<BTreeMap<MatcherType, u64>> {
        let rows: Vec<TypeCountRow> = self.db.with_conn(|conn| {
            Ok(diesel::sql_query(
                r#"
                SELECT m.matcher_type AS matcher_type, COUNT(*) AS invocations
                FROM nodes n
                JOIN matchers m ON m.id = n.matcher_id
                GROUP BY m.matcher_type
            "#,
            )
            .load(conn)?)
        })?;

        let mut by_type = BTreeMap::new();
        for row in rows {
            *by_type.entry(matcher_type(&row.matcher_type)?).or_insert(0) += count(row.invocations);
        }
        Ok(by_type)
    }

    /// Per matcher class, busiest first, ties by class name
    pub fn rules_by_class(&self) -> Result<Vec<PerClassStatistics>> {
        let rows: Vec<ClassRow> = self.db.with_conn(|conn| {
            Ok(diesel::sql_query(
                r#"
                SELECT m.class_name AS class_name,
                       COUNT(n.id) AS invocations,
                       COALESCE(SUM(n.success), 0) AS successes,
                       COALESCE(SUM(n.nanos), 0) AS total_nanos
                FROM matchers m
                LEFT JOIN nodes n ON n.matcher_id = m.id
                GROUP BY m.class_name
                ORDER BY invocations DESC, m.class_name ASC
            "#,
            )
            .load(conn)?)
        })?;

        log::debug!("{}: {} matcher classes", self.db, rows.len());
        Ok(rows
            .into_iter()
            .map(|row| {
                let (invocations, successes, total_nanos) =
                    (count(row.invocations), count(row.successes), count(row.total_nanos));
                PerClassStatistics {
                    class_name: row.class_name,
                    invocations,
                    successes,
                    success_rate: success_rate(successes, invocations),
                    total_nanos,
                    average_nanos: average_nanos(total_nanos, invocations),
                }
            })
            .collect())
    }

    /// Per rule, busiest first, ties by rule name then matcher id
    pub fn rule_statistics(&self) -> Result<Vec<RuleStatistics>> {
        let rows: Vec<RuleRow> = self.db.with_conn(|conn| {
            Ok(diesel::sql_query(
                r#"
                SELECT m.id AS id, m.name AS name, m.class_name AS class_name,
                       m.matcher_type AS matcher_type,
                       COUNT(n.id) AS invocations,
                       COALESCE(SUM(n.success), 0) AS successes,
                       COALESCE(SUM(n.nanos), 0) AS total_nanos
                FROM matchers m
                LEFT JOIN nodes n ON n.matcher_id = m.id
                GROUP BY m.id
                ORDER BY invocations DESC, m.name ASC, m.id ASC
            "#,
            )
            .load(conn)?)
        })?;

        rows.into_iter()
            .map(|row| {
                let (invocations, successes, total_nanos) =
                    (count(row.invocations), count(row.successes), count(row.total_nanos));
                Ok(RuleStatistics {
                    matcher_id: row.id,
                    matcher_type: matcher_type(&row.matcher_type)?,
                    name: row.name,
                    class_name: row.class_name,
                    invocations,
                    successes,
                    success_rate: success_rate(successes, invocations),
                    total_nanos,
                    average_nanos: average_nanos(total_nanos, invocations),
                })
            })
            .collect()
    }

    pub fn is_load_complete(&self) -> bool {
        self.db.get_load_status().is_ready()
    }

    /// Time spent in the root rule, i.e. the whole parse
    pub fn total_parse_time(&self) -> Result<u64> {
        let nanos: Option<i64> = self.db.with_conn(|conn| {
            Ok(nodes::table
                .filter(nodes::id.eq(ROOT_NODE))
                .select(nodes::nanos)
                .first(conn)
                .optional()?)
        })?;
        nanos.map(count).ok_or(TraceError::NotFound(ROOT_NODE))
    }

    /// Deepest level of the nodes starting on each line of a window
    ///
    /// `start_line` is 1-based; the window is cut at the last input line.
    /// Lines where no node starts report 0.
    pub fn depth_by_line(&self, start_line: usize, nr_lines: usize) -> Result<Vec<u32>> {
        let line_count = self.input.line_count();
        if start_line == 0 || start_line > line_count {
            return Err(TraceError::RangeError {
                start: start_line,
                end: start_line.saturating_add(nr_lines),
                length: line_count,
            });
        }
        if nr_lines == 0 {
            return Ok(Vec::new());
        }
        let last_line = start_line.saturating_add(nr_lines - 1).min(line_count);
        let mut depths = vec![0u32; last_line - start_line + 1];

        let (lo, _) = self.span(start_line)?;
        // Nodes starting at the very end of the input belong to the last line
        let hi = if last_line == line_count {
            self.input.len() + 1
        } else {
            self.span(last_line)?.1
        };
        let to_db = |offset: usize| i32::try_from(offset).unwrap_or(i32::MAX);

        let rows: Vec<(i32, Option<i32>)> = self.db.with_conn(|conn| {
            Ok(nodes::table
                .filter(nodes::start_index.ge(to_db(lo)))
                .filter(nodes::start_index.lt(to_db(hi)))
                .group_by(nodes::start_index)
                .select((nodes::start_index, diesel::dsl::max(nodes::level)))
                .load(conn)?)
        })?;

        for (start, level) in rows {
            let (Ok(offset), Some(level)) = (usize::try_from(start), level) else {
                continue;
            };
            let Ok(line) = self.input.line_of(offset.min(self.input.len())) else {
                continue;
            };
            if let Some(slot) = line.checked_sub(start_line).and_then(|i| depths.get_mut(i)) {
                *slot = (*slot).max(u32::try_from(level).unwrap_or(0));
            }
        }
        Ok(depths)
    }

    fn span(&self, line: usize) -> Result<(usize, usize)> {
        self.input.line_span(line).ok_or(TraceError::RangeError {
            start: line,
            end: line,
            length: self.input.line_count(),
        })
    }
}

/// Human-readable duration
pub fn format_nanos(nanos: u64) -> String {
    const MICRO: u64 = 1_000;
    const MILLI: u64 = 1_000_000;
    const SECOND: u64 = 1_000_000_000;

    match nanos {
        n if n < MICRO => format!("{} ns", n),
        n if n < MILLI => format!("{:.2} µs", n as f64 / MICRO as f64),
        n if n < SECOND => format!("{:.2} ms", n as f64 / MILLI as f64),
        n => format!("{:.2} s", n as f64 / SECOND as f64),
    }
}
