//! Per-operation decision DAG. Vertices are node offsets; each
//! non-terminal contributes a match edge and an unmatch edge, and
//! shared subtrees collapse because vertices are keyed by offset.

use anyhow::{anyhow, Result};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use std::collections::HashSet;

use crate::op_node::{NodeTable, OperationNode};

pub mod partition;

/// Which branches of the source node lead to the target. `Both`
/// appears when match and unmatch point at the same child; folding
/// the two edges keeps the if-then-else reading of the node intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Match,
    Unmatch,
    Both,
}

impl EdgeKind {
    pub fn on_match(self) -> bool {
        matches!(self, EdgeKind::Match | EdgeKind::Both)
    }

    pub fn on_unmatch(self) -> bool {
        matches!(self, EdgeKind::Unmatch | EdgeKind::Both)
    }

    fn merged(self, other: EdgeKind) -> EdgeKind {
        if self == other {
            self
        } else {
            EdgeKind::Both
        }
    }
}

pub struct OperationGraph {
    pub graph: DiGraphMap<u16, EdgeKind>,
    pub root: u16,
    /// Every vertex in topological order.
    pub topo: Vec<u16>,
    /// Terminal vertices in topological order.
    pub sinks: Vec<u16>,
}

/// Walk the match/unmatch tree from `root` and collapse it into a
/// DAG. The root must be a non-terminal; terminal-rooted operations
/// have no graph to build.
pub fn build_operation_graph(
    nodes: &NodeTable,
    root: u16,
) -> Result<OperationGraph> {
    let root_node = nodes
        .get(root)
        .ok_or_else(|| anyhow!("operation root {root} is not in the node table"))?;
    if root_node.is_terminal() {
        return Err(anyhow!("operation root {root} is a terminal"));
    }

    let mut graph: DiGraphMap<u16, EdgeKind> = DiGraphMap::new();
    let mut visited: HashSet<u16> = HashSet::new();
    let mut work = vec![root];
    while let Some(offset) = work.pop() {
        if !visited.insert(offset) {
            continue;
        }
        let node = nodes
            .get(offset)
            .ok_or_else(|| anyhow!("node {offset} vanished mid-walk"))?;
        let OperationNode::NonTerminal(nt) = node else {
            continue;
        };
        graph.add_node(offset);
        for (child, kind) in [
            (nt.match_offset, EdgeKind::Match),
            (nt.unmatch_offset, EdgeKind::Unmatch),
        ] {
            let kind = match graph.edge_weight(offset, child) {
                Some(existing) => existing.merged(kind),
                None => kind,
            };
            graph.add_edge(offset, child, kind);
            if !visited.contains(&child) {
                work.push(child);
            }
        }
    }

    let topo = toposort(&graph, None)
        .map_err(|cycle| {
            anyhow!("cycle through node {} in operation graph", cycle.node_id())
        })?;
    let sinks = topo
        .iter()
        .copied()
        .filter(|&offset| {
            nodes.get(offset).is_some_and(OperationNode::is_terminal)
        })
        .collect();
    Ok(OperationGraph {
        graph,
        root,
        topo,
        sinks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::op_node::NodeTable;

    fn non_terminal(
        filter_id: u8,
        match_offset: u16,
        unmatch_offset: u16,
    ) -> [u8; 8] {
        let m = match_offset.to_le_bytes();
        let u = unmatch_offset.to_le_bytes();
        [0x00, filter_id, 0x00, 0x00, m[0], m[1], u[0], u[1]]
    }

    fn terminal(flags: u8) -> [u8; 8] {
        [0x01, flags, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    }

    fn table(records: &[[u8; 8]]) -> NodeTable {
        let bytes: Vec<u8> = records.concat();
        NodeTable::read(&mut &bytes[..], records.len() as u16).unwrap()
    }

    #[test]
    fn shared_subtree_collapses_into_a_dag() {
        // 0 and 1 both fall through to 2; 2 decides between the two
        // terminals
        let nodes = table(&[
            non_terminal(1, 1, 2),
            non_terminal(2, 2, 3),
            non_terminal(3, 3, 4),
            terminal(0),
            terminal(1),
        ]);
        let graph = build_operation_graph(&nodes, 0).unwrap();
        assert_eq!(graph.graph.node_count(), 5);
        let mut sinks = graph.sinks.clone();
        sinks.sort_unstable();
        assert_eq!(sinks, [3, 4]);
        assert_eq!(
            graph.graph.edge_weight(0, 1).copied(),
            Some(EdgeKind::Match)
        );
        assert_eq!(
            graph.graph.edge_weight(2, 4).copied(),
            Some(EdgeKind::Unmatch)
        );
    }

    #[test]
    fn coinciding_branches_merge_into_both() {
        let nodes = table(&[non_terminal(1, 1, 1), terminal(0)]);
        let graph = build_operation_graph(&nodes, 0).unwrap();
        assert_eq!(
            graph.graph.edge_weight(0, 1).copied(),
            Some(EdgeKind::Both)
        );
    }

    #[test]
    fn terminal_root_is_rejected() {
        let nodes = table(&[terminal(0)]);
        assert!(build_operation_graph(&nodes, 0).is_err());
    }

    #[test]
    fn unreachable_nodes_stay_out_of_the_graph() {
        let nodes = table(&[
            non_terminal(1, 2, 3),
            non_terminal(2, 2, 3), // not reachable from 0
            terminal(0),
            terminal(1),
        ]);
        let graph = build_operation_graph(&nodes, 0).unwrap();
        assert_eq!(graph.graph.node_count(), 3);
        assert!(!graph.graph.contains_node(1));
    }
}
