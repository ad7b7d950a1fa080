//! Sink partitioning: carve the operation DAG into one sub-DAG per
//! terminal so each decision can be printed as its own rule, and
//! extract the boolean condition a partition encodes.

use petgraph::Direction;

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::expr::Expr;
use crate::graph::OperationGraph;

/// One sink plus every vertex of its backward cone, including the
/// guard vertices where the cone borders another sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkPartition {
    pub sink: u16,
    pub nodes: BTreeSet<u16>,
}

/// Partition the DAG sink by sink. `sinks` carries the candidate
/// sinks in topological order; sinks restating the profile default
/// are left out by the caller and act as frontier `false` leaves.
/// Each round scores every remaining candidate by the number of
/// unmatch edges inside its cone (fewer first, discovery order
/// breaking ties) and commits the best; the committed vertices are
/// off-limits to later rounds, which keeps the partitions disjoint.
pub fn partition_by_sink(
    op: &OperationGraph,
    sinks: &[u16],
) -> Vec<SinkPartition> {
    let mut remaining = sinks.to_vec();
    let mut claimed: HashSet<u16> = HashSet::new();
    let mut partitions = Vec::new();

    while !remaining.is_empty() {
        let mut best: Option<(usize, usize, u16, BTreeSet<u16>)> = None;
        for (index, &sink) in remaining.iter().enumerate() {
            let guards: HashSet<u16> = sinks
                .iter()
                .filter(|&&other| other != sink)
                .flat_map(|&other| {
                    op.graph.neighbors_directed(other, Direction::Incoming)
                })
                .collect();
            let nodes = backward_cone(op, sink, &guards, &claimed);
            let weight = unmatch_edges_inside(op, &nodes);
            let improves = match &best {
                None => true,
                Some((w, i, ..)) => (weight, index) < (*w, *i),
            };
            if improves {
                best = Some((weight, index, sink, nodes));
            }
        }
        let (_, _, sink, nodes) = best.expect("remaining is non-empty");
        claimed.extend(nodes.iter().copied());
        partitions.push(SinkPartition { sink, nodes });
        remaining.retain(|&s| s != sink);
    }
    adopt_stranded(op, &mut partitions);
    partitions
}

/// A vertex whose every backward cone stops at a guard ends up in no
/// cone at all. Walking in reverse topological order, hand each
/// stranded vertex to the partition owning its match successor
/// (unmatch as fallback); the successors sit further down the order,
/// so their owners are settled first. Vertices that only reach elided
/// default sinks stay unowned.
fn adopt_stranded(op: &OperationGraph, partitions: &mut [SinkPartition]) {
    let mut owner: HashMap<u16, usize> = HashMap::new();
    for (index, part) in partitions.iter().enumerate() {
        for &node in &part.nodes {
            owner.insert(node, index);
        }
    }
    for &offset in op.topo.iter().rev() {
        if owner.contains_key(&offset) {
            continue;
        }
        let mut successors: Vec<(u16, bool)> = op
            .graph
            .edges_directed(offset, Direction::Outgoing)
            .map(|(_, target, kind)| (target, kind.on_match()))
            .collect();
        successors.sort_by_key(|&(_, on_match)| !on_match);
        let Some(index) = successors
            .iter()
            .find_map(|(target, _)| owner.get(target).copied())
        else {
            continue;
        };
        partitions[index].nodes.insert(offset);
        owner.insert(offset, index);
    }
}

/// Backward traversal from `sink`, skipping vertices claimed by
/// earlier partitions and not expanding past guard vertices.
fn backward_cone(
    op: &OperationGraph,
    sink: u16,
    guards: &HashSet<u16>,
    claimed: &HashSet<u16>,
) -> BTreeSet<u16> {
    let mut nodes = BTreeSet::new();
    let mut stack = vec![sink];
    while let Some(offset) = stack.pop() {
        if claimed.contains(&offset) || !nodes.insert(offset) {
            continue;
        }
        if guards.contains(&offset) {
            continue;
        }
        stack.extend(
            op.graph
                .neighbors_directed(offset, Direction::Incoming)
                .filter(|p| !claimed.contains(p) && !nodes.contains(p)),
        );
    }
    nodes
}

fn unmatch_edges_inside(op: &OperationGraph, nodes: &BTreeSet<u16>) -> usize {
    nodes
        .iter()
        .flat_map(|&from| {
            op.graph
                .edges_directed(from, Direction::Outgoing)
                .filter(|(_, to, kind)| {
                    nodes.contains(to) && kind.on_unmatch()
                })
        })
        .count()
}

/// Condition under which the operation's decision is this partition's
/// sink. Reverse-topological if-then-else assembly: the sink itself
/// is `true`, branches leaving the partition are `false`, and the
/// partition's entry vertices are joined by disjunction.
pub fn sink_condition(op: &OperationGraph, part: &SinkPartition) -> Expr {
    let mut expr_of: HashMap<u16, Expr> = HashMap::new();
    for &offset in op.topo.iter().rev() {
        if !part.nodes.contains(&offset) {
            continue;
        }
        if offset == part.sink {
            expr_of.insert(offset, Expr::True);
            continue;
        }
        let mut on_match = Expr::False;
        let mut on_unmatch = Expr::False;
        for (_, target, kind) in
            op.graph.edges_directed(offset, Direction::Outgoing)
        {
            let Some(target_expr) = expr_of.get(&target) else {
                continue;
            };
            if kind.on_match() {
                on_match = target_expr.clone();
            }
            if kind.on_unmatch() {
                on_unmatch = target_expr.clone();
            }
        }
        expr_of.insert(
            offset,
            Expr::ite(Expr::Var(offset), on_match, on_unmatch),
        );
    }

    let entries: Vec<Expr> = part
        .nodes
        .iter()
        .filter(|&&offset| {
            op.graph
                .neighbors_directed(offset, Direction::Incoming)
                .all(|p| !part.nodes.contains(&p))
        })
        .filter_map(|offset| expr_of.get(offset).cloned())
        .collect();
    Expr::or_all(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::expr::{to_nnf, Expr};
    use crate::graph::build_operation_graph;
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
    fn single_sink_takes_the_whole_graph() {
        let nodes = table(&[
            non_terminal(1, 1, 2),
            non_terminal(2, 2, 2),
            terminal(0),
        ]);
        let graph = build_operation_graph(&nodes, 0).unwrap();
        let partitions = partition_by_sink(&graph, &graph.sinks);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].sink, 2);
        assert_eq!(
            partitions[0].nodes,
            BTreeSet::from([0, 1, 2])
        );
    }

    #[test]
    fn partitions_cover_interior_exactly_once() {
        // diamond: 0 splits, both arms reach both sinks through 1/2
        let nodes = table(&[
            non_terminal(1, 1, 2),
            non_terminal(2, 3, 4),
            non_terminal(3, 4, 3),
            terminal(0),
            terminal(1),
        ]);
        let graph = build_operation_graph(&nodes, 0).unwrap();
        let partitions = partition_by_sink(&graph, &graph.sinks);
        assert_eq!(partitions.len(), 2);
        let mut seen: Vec<u16> = Vec::new();
        for part in &partitions {
            for &node in &part.nodes {
                assert!(!seen.contains(&node), "{node} partitioned twice");
                seen.push(node);
            }
        }
        // every interior vertex landed in exactly one partition
        for interior in [0u16, 1, 2] {
            assert!(seen.contains(&interior));
        }
    }

    #[test]
    fn fewer_unmatch_edges_wins_the_round() {
        // sink 3 is reached by a match edge, sink 4 by an unmatch
        // edge; the allow-ish cone must be carved out first
        let nodes = table(&[
            non_terminal(1, 1, 2),
            non_terminal(2, 3, 4),
            non_terminal(3, 3, 4),
            terminal(0),
            terminal(1),
        ]);
        let graph = build_operation_graph(&nodes, 0).unwrap();
        let partitions = partition_by_sink(&graph, &graph.sinks);
        assert_eq!(partitions[0].sink, 3);
    }

    #[test]
    fn condition_of_a_simple_branch() {
        // 0: match -> allow sink (1), unmatch -> deny sink (2)
        let nodes =
            table(&[non_terminal(1, 1, 2), terminal(0), terminal(1)]);
        let graph = build_operation_graph(&nodes, 0).unwrap();
        let partitions = partition_by_sink(&graph, &graph.sinks);
        let allow = partitions
            .iter()
            .find(|part| part.sink == 1)
            .expect("allow sink partitioned");
        let condition = to_nnf(&sink_condition(&graph, allow));
        assert_eq!(condition, Expr::Var(0));
    }

    /// Chain into the allow sink, with the deny sink fed through a
    /// separate funnel node so the chain's cone stays unblocked.
    fn chain_table() -> NodeTable {
        table(&[
            non_terminal(1, 1, 4),
            non_terminal(2, 2, 4),
            terminal(0),
            terminal(1),
            non_terminal(3, 3, 3),
        ])
    }

    #[test]
    fn condition_through_a_chain() {
        // the allow sink is reached exactly when 0 and 1 both match
        let nodes = chain_table();
        let graph = build_operation_graph(&nodes, 0).unwrap();
        let partitions = partition_by_sink(&graph, &graph.sinks);
        assert_eq!(partitions[0].sink, 2);
        let condition = to_nnf(&sink_condition(&graph, &partitions[0]));
        assert_eq!(
            condition,
            Expr::And(vec![Expr::Var(0), Expr::Var(1)])
        );
    }

    #[test]
    fn first_partition_formula_matches_operational_semantics() {
        // exhaustive check over all assignments; later partitions are
        // frontier-trimmed and rely on rule order, so only the first
        // one is required to be exact
        let nodes = chain_table();
        let graph = build_operation_graph(&nodes, 0).unwrap();
        let partitions = partition_by_sink(&graph, &graph.sinks);
        let first = &partitions[0];
        assert_eq!(first.sink, 2);

        let run = |x0: bool, x1: bool, x4: bool| -> u16 {
            let mut offset = 0u16;
            loop {
                offset = match offset {
                    0 => {
                        if x0 {
                            1
                        } else {
                            4
                        }
                    }
                    1 => {
                        if x1 {
                            2
                        } else {
                            4
                        }
                    }
                    4 => {
                        let _ = x4;
                        3
                    }
                    sink => return sink,
                };
            }
        };
        fn eval(expr: &Expr, x0: bool, x1: bool, x4: bool) -> bool {
            match expr {
                Expr::True => true,
                Expr::False => false,
                Expr::Var(0) => x0,
                Expr::Var(1) => x1,
                Expr::Var(_) => x4,
                Expr::Not(inner) => !eval(inner, x0, x1, x4),
                Expr::And(parts) => {
                    parts.iter().all(|part| eval(part, x0, x1, x4))
                }
                Expr::Or(parts) => {
                    parts.iter().any(|part| eval(part, x0, x1, x4))
                }
                Expr::Ite(c, t, f) => {
                    if eval(c, x0, x1, x4) {
                        eval(t, x0, x1, x4)
                    } else {
                        eval(f, x0, x1, x4)
                    }
                }
            }
        }

        let condition = sink_condition(&graph, first);
        for x0 in [false, true] {
            for x1 in [false, true] {
                for x4 in [false, true] {
                    assert_eq!(
                        eval(&condition, x0, x1, x4),
                        run(x0, x1, x4) == first.sink,
                        "sink {} disagrees at ({x0}, {x1}, {x4})",
                        first.sink,
                    );
                }
            }
        }
    }
}
