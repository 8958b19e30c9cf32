//! Lazy parse tree over a trace store
//!
//! Nodes are addressed by id and resolved only when asked for. Every call
//! goes to the store: child lists can still grow while the trace is loading
//! and a closed store must fail every query.

use crate::db::TraceDb;
use crate::error::{Result, TraceError};
use crate::model::{NodeId, ParseInfo, ParseTreeNode, ROOT_NODE};
use serde::Serialize;
use std::sync::Arc;

/// A node together with its resolved subtree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeItem {
    pub node: ParseTreeNode,
    /// Resolved children; empty past the requested depth even when
    /// `node.children` is not
    pub children: Vec<TreeItem>,
}

impl TreeItem {
    /// Number of resolved nodes in this subtree
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TreeItem::size).sum::<usize>()
    }
}

#[derive(Debug)]
pub struct ParseTree {
    db: Arc<TraceDb>,
}

impl ParseTree {
    pub fn new(db: Arc<TraceDb>) -> Self {
        Self { db }
    }

    pub fn root(&self) -> Result<ParseTreeNode> {
        self.node(ROOT_NODE)
    }

    pub fn node(&self, id: NodeId) -> Result<ParseTreeNode> {
        self.db.get_node(id)
    }

    /// Direct children of `id` in source order
    pub fn children_of(&self, id: NodeId) -> Result<Vec<ParseTreeNode>> {
        self.db.get_child_nodes(id)
    }

    /// Resolve the whole subtree under `id`
    pub fn expand_fully(&self, id: NodeId) -> Result<TreeItem> {
        self.expand(id, None)
    }

    /// Resolve the subtree under `id`, `max_depth` levels deep at most
    /// (`Some(0)` resolves `id` alone)
    pub fn expand(&self, id: NodeId, max_depth: Option<u32>) -> Result<TreeItem> {
        let node = self.node(id)?;
        self.expand_node(node, max_depth)
    }

    fn expand_node(&self, node: ParseTreeNode, depth: Option<u32>) -> Result<TreeItem> {
        let children = match depth {
            Some(0) => Vec::new(),
            _ if !node.has_children() => Vec::new(),
            _ => {
                let next = depth.map(|d| d - 1);
                self.children_of(node.id)?
                    .into_iter()
                    .map(|child| self.expand_node(child, next))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        Ok(TreeItem { node, children })
    }

    /// Ids from `id` up to the root, `id` first
    pub fn ancestors(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let depth = self.tree_depth() as usize;
        let mut chain = vec![id];
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            if chain.len() > depth.max(1) {
                return Err(TraceError::CorruptFormat(format!(
                    "parent chain of node {} exceeds the tree depth",
                    id
                )));
            }
            chain.push(parent);
            current = self.node(parent)?;
        }
        Ok(chain)
    }

    pub fn parse_info(&self) -> ParseInfo {
        self.db.get_parse_info()
    }

    pub fn nr_invocations(&self) -> usize {
        self.db.get_parse_info().nr_nodes
    }

    pub fn tree_depth(&self) -> u32 {
        self.db.get_parse_info().tree_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::{MatcherType, RuleInfo, TraceEvent};
    use chrono::Utc;
    use std::thread;

    fn event(parent: Option<NodeId>, level: u32) -> TraceEvent {
        TraceEvent {
            parent,
            level,
            matcher_id: 0,
            success: true,
            start: 0,
            end: 0,
            nanos: 1,
        }
    }

    /// 0 -> (1 -> (3, 4), 2)
    fn tree() -> ParseTree {
        let info = ParseInfo {
            capture_date: Utc::now(),
            nr_matchers: 1,
            nr_nodes: 5,
            tree_depth: 3,
        };
        let db = TraceDb::create("tree", info, &StorageConfig::default()).unwrap();
        db.append_matchers(&[RuleInfo {
            id: 0,
            class_name: "SequenceMatcher".into(),
            matcher_type: MatcherType::Sequence,
            name: "Rule".into(),
        }])
        .unwrap();
        db.append_batch(&[
            event(None, 0),
            event(Some(0), 1),
            event(Some(1), 2),
            event(Some(1), 2),
            event(Some(0), 1),
        ])
        .unwrap();
        ParseTree::new(Arc::new(db))
    }

    fn finish(tree: &ParseTree) {
        let tracker = tree.db.tracker();
        tracker.start();
        tracker.finish();
    }

    #[test]
    fn test_children_in_source_order() {
        let tree = tree();
        let root = tree.root().unwrap();
        assert_eq!(root.id, ROOT_NODE);
        let ids: Vec<NodeId> = tree.children_of(0).unwrap().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(tree.children_of(1).unwrap()[0].level, 2);
        assert!(tree.children_of(4).unwrap().is_empty());
        assert!(matches!(tree.children_of(99), Err(TraceError::NotFound(99))));
    }

    #[test]
    fn test_children_after_close() {
        let tree = tree();
        finish(&tree);
        let first = tree.children_of(0).unwrap();
        assert_eq!(first, tree.children_of(0).unwrap());
        tree.expand_fully(0).unwrap();

        tree.db.close().unwrap();
        assert!(matches!(tree.root(), Err(TraceError::Closed)));
        assert!(matches!(tree.children_of(0), Err(TraceError::Closed)));
        assert!(matches!(tree.expand(0, Some(1)), Err(TraceError::Closed)));
    }

    #[test]
    fn test_expand() {
        let tree = tree();
        let full = tree.expand_fully(0).unwrap();
        assert_eq!(full.size(), 5);
        assert_eq!(full.children[0].children.len(), 2);

        let shallow = tree.expand(0, Some(1)).unwrap();
        assert_eq!(shallow.size(), 3);
        assert!(shallow.children[0].children.is_empty());
        assert!(shallow.children[0].node.has_children());
    }

    #[test]
    fn test_ancestors() {
        let tree = tree();
        assert_eq!(tree.ancestors(3).unwrap(), vec![3, 1, 0]);
        assert_eq!(tree.ancestors(0).unwrap(), vec![0]);
    }

    #[test]
    fn test_concurrent_resolution_is_consistent() {
        let tree = Arc::new(tree());
        finish(&tree);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tree = tree.clone();
                thread::spawn(move || tree.children_of(i % 2).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (i, children) in results.iter().enumerate() {
            assert_eq!(*children, results[i % 2]);
        }
        assert_eq!(tree.nr_invocations(), 5);
        assert_eq!(tree.tree_depth(), 3);
    }
}
