//! Trace domain types shared by the store, the tree and the statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable node identifier, assigned in source order starting at 0 (the root)
pub type NodeId = i32;

/// Identifier of a matcher declaration (a rule)
pub type MatcherId = i32;

/// Root of every parse tree
pub const ROOT_NODE: NodeId = 0;

/// Kind of matcher a rule is implemented by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatcherType {
    Terminal,
    Composite,
    Sequence,
    Choice,
    Predicate,
    Action,
    Custom,
}

impl MatcherType {
    pub const ALL: [MatcherType; 7] = [
        MatcherType::Terminal,
        MatcherType::Composite,
        MatcherType::Sequence,
        MatcherType::Choice,
        MatcherType::Predicate,
        MatcherType::Action,
        MatcherType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatcherType::Terminal => "TERMINAL",
            MatcherType::Composite => "COMPOSITE",
            MatcherType::Sequence => "SEQUENCE",
            MatcherType::Choice => "CHOICE",
            MatcherType::Predicate => "PREDICATE",
            MatcherType::Action => "ACTION",
            MatcherType::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for MatcherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatcherType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatcherType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| format!("unknown matcher type '{}'", s))
    }
}

/// A matcher declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub id: MatcherId,
    pub class_name: String,
    pub matcher_type: MatcherType,
    pub name: String,
}

/// One rule invocation as handed to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// None for the root invocation
    pub parent: Option<NodeId>,
    pub level: u32,
    pub matcher_id: MatcherId,
    pub success: bool,
    pub start: usize,
    pub end: usize,
    pub nanos: u64,
}

/// A stored invocation with its rule and direct children resolved to ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseTreeNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub level: u32,
    pub rule: RuleInfo,
    pub success: bool,
    pub start: usize,
    pub end: usize,
    pub nanos: u64,
    pub children: Vec<NodeId>,
}

impl ParseTreeNode {
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

impl fmt::Display for ParseTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "SUCCESS" } else { "FAILURE" };
        write!(f, "{} ({})", self.rule.name, status)
    }
}

/// Trace-level summary, known before ingestion starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseInfo {
    pub capture_date: DateTime<Utc>,
    /// Distinct matcher declarations
    pub nr_matchers: usize,
    /// Matcher invocations
    pub nr_nodes: usize,
    pub tree_depth: u32,
}

impl ParseInfo {
    /// Record count used as the progress total
    pub fn total_records(&self) -> usize {
        self.nr_matchers + self.nr_nodes
    }
}
