//! Directory exclusion propagation.
//!
//! A directory is syncable iff neither it nor any ancestor is excluded. The
//! same filter prunes the orchestrator's walk (no upstream call is made for an
//! excluded subtree) and the read-side listings (cached rows under an
//! excluded directory are never returned).
//!
//! The filter is pure: it is built from a snapshot of the tree and answers
//! membership questions without I/O.
//!
//! Malformed trees are handled conservatively:
//! - a `parent_id` naming a directory that is not in the snapshot ends the
//!   chain, so the node is treated as a root;
//! - a parent chain that loops back on itself is excluded.

use std::collections::{HashMap, HashSet};

use crate::models::DirectoryRecord;

/// The minimal view of a directory the filter needs.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryNode<'a> {
    pub id: &'a str,
    pub parent_id: Option<&'a str>,
    pub excluded: bool,
}

impl<'a> From<&'a DirectoryRecord> for DirectoryNode<'a> {
    fn from(record: &'a DirectoryRecord) -> Self {
        DirectoryNode {
            id: &record.id,
            parent_id: record.parent_id.as_deref(),
            excluded: record.excluded(),
        }
    }
}

/// Resolved set of syncable directory ids for one tree snapshot.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    syncable: HashSet<String>,
    total: usize,
}

impl ExclusionFilter {
    pub fn new<'a, I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = DirectoryNode<'a>>,
    {
        let nodes: HashMap<&str, DirectoryNode<'a>> =
            nodes.into_iter().map(|n| (n.id, n)).collect();
        let mut resolved: HashMap<&str, bool> = HashMap::with_capacity(nodes.len());

        for &id in nodes.keys() {
            resolve(id, &nodes, &mut resolved);
        }

        let syncable = resolved
            .into_iter()
            .filter(|(_, ok)| *ok)
            .map(|(id, _)| id.to_string())
            .collect();

        Self {
            syncable,
            total: nodes.len(),
        }
    }

    pub fn from_records(records: &[DirectoryRecord]) -> Self {
        Self::new(records.iter().map(DirectoryNode::from))
    }

    /// `false` for unknown ids: a directory that is not in the snapshot
    /// cannot be proven syncable.
    pub fn is_syncable(&self, directory_id: &str) -> bool {
        self.syncable.contains(directory_id)
    }

    pub fn syncable_ids(&self) -> &HashSet<String> {
        &self.syncable
    }

    pub fn excluded_count(&self) -> usize {
        self.total - self.syncable.len()
    }
}

/// Resolve `start` and every unresolved ancestor on its chain.
fn resolve<'a>(
    start: &'a str,
    nodes: &HashMap<&'a str, DirectoryNode<'a>>,
    resolved: &mut HashMap<&'a str, bool>,
) -> bool {
    if let Some(&ok) = resolved.get(start) {
        return ok;
    }

    // Walk up until a resolved ancestor, a root, an excluded node or a loop.
    let mut chain: Vec<&'a str> = Vec::new();
    let mut on_chain: HashSet<&'a str> = HashSet::new();
    let mut current = Some(start);
    let outcome = loop {
        let Some(id) = current else {
            break true;
        };
        if let Some(&ok) = resolved.get(id) {
            break ok;
        }
        let Some(node) = nodes.get(id) else {
            // Dangling parent reference: the chain ends here.
            break true;
        };
        if !on_chain.insert(id) {
            break false;
        }
        chain.push(id);
        if node.excluded {
            break false;
        }
        current = node.parent_id;
    };

    // Every node on the walked chain shares the outcome: an excluded ancestor
    // excludes all descendants, and a clean chain keeps them all syncable.
    for id in chain {
        resolved.insert(id, outcome);
    }
    outcome
}
