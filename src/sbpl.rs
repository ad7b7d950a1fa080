//! SBPL emission: turn per-sink conditions into `(allow ...)` /
//! `(deny ...)` rules and drive the whole per-operation pipeline.

use anyhow::{anyhow, ensure, Result};
use tracing::debug;

use std::time::Duration;

use crate::expr::{to_nnf, Expr, NnfSimplifier, Simplifier};
use crate::filter::FilterArgument;
use crate::graph::build_operation_graph;
use crate::graph::partition::{partition_by_sink, sink_condition};
use crate::op_node::{NodeTable, OperationNode, TerminalNode};
use crate::profile::DecodedProfile;

#[derive(Debug, Clone)]
pub struct DecompileOptions {
    /// Only decompile these operations; `None` means all of them.
    pub operations: Option<Vec<String>>,
    /// Wall-clock budget for simplifying each rule's condition.
    pub simplify_budget: Duration,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            operations: None,
            simplify_budget: Duration::from_millis(600),
        }
    }
}

pub fn decompile_profile(
    profile: &DecodedProfile,
    sb_ops: &[String],
    options: &DecompileOptions,
) -> Result<String> {
    decompile_with(profile, sb_ops, options, &NnfSimplifier)
}

/// Decompile with a caller-provided simplifier; the default entry
/// point uses the built-in syntactic one.
pub fn decompile_with(
    profile: &DecodedProfile,
    sb_ops: &[String],
    options: &DecompileOptions,
    simplifier: &dyn Simplifier,
) -> Result<String> {
    if let Some(selection) = &options.operations {
        for name in selection {
            ensure!(
                sb_ops.contains(name),
                "operation {name:?} is not in the operations list",
            );
        }
    }
    let default = profile.default_terminal()?;

    let mut out = String::from("(version 1)\n");
    for (index, &root) in profile.op_table.iter().enumerate().skip(1) {
        let operation = &sb_ops[index];
        if let Some(selection) = &options.operations {
            if !selection.contains(operation) {
                continue;
            }
        }
        let root_node = profile
            .nodes
            .get(root)
            .expect("dispatch entries are validated at decode time");
        match root_node {
            OperationNode::Terminal(terminal) => {
                // covered by the profile default unless it says
                // something different
                if terminal.same_outcome(default) {
                    continue;
                }
                out.push_str(&render_rule(
                    operation,
                    terminal,
                    &Expr::True,
                    &profile.nodes,
                ));
            }
            OperationNode::NonTerminal(_) => {
                let graph = build_operation_graph(&profile.nodes, root)?;
                // sinks restating the profile default carry no rule of
                // their own; they become frontier false leaves
                let candidates: Vec<u16> = graph
                    .sinks
                    .iter()
                    .copied()
                    .filter(|&sink| {
                        profile
                            .nodes
                            .get(sink)
                            .and_then(OperationNode::as_terminal)
                            .is_some_and(|terminal| {
                                !terminal.same_outcome(default)
                            })
                    })
                    .collect();
                for part in partition_by_sink(&graph, &candidates) {
                    let sink = profile
                        .nodes
                        .get(part.sink)
                        .and_then(OperationNode::as_terminal)
                        .ok_or_else(|| {
                            anyhow!(
                                "partition sink {} is not a terminal",
                                part.sink
                            )
                        })?;
                    let condition = simplifier.simplify(
                        &sink_condition(&graph, &part),
                        options.simplify_budget,
                    );
                    if condition == Expr::False {
                        debug!(
                            operation = %operation,
                            sink = part.sink,
                            "unsatisfiable condition, rule elided",
                        );
                        continue;
                    }
                    out.push_str(&render_rule(
                        operation,
                        sink,
                        &condition,
                        &profile.nodes,
                    ));
                }
            }
        }
    }
    Ok(out)
}

/// One rule line: action head, operation, condition body, `(with ...)`
/// parts. A `true` condition prints no body.
fn render_rule(
    operation: &str,
    terminal: &TerminalNode,
    condition: &Expr,
    nodes: &NodeTable,
) -> String {
    let mut line = String::from("(");
    line.push_str(&terminal.decision().to_string());
    line.push(' ');
    line.push_str(operation);
    if *condition != Expr::True {
        line.push(' ');
        line.push_str(&render_expr(condition, nodes));
    }
    if let Some(decision) = &terminal.rendered {
        if let Some(alias) = &decision.alias_operation {
            line.push(' ');
            line.push_str(alias);
        }
        for part in &decision.modifiers {
            line.push(' ');
            line.push_str(part);
        }
    }
    line.push_str(")\n");
    line
}

fn render_expr(expr: &Expr, nodes: &NodeTable) -> String {
    match expr {
        // `true` is handled by the caller, `false` by rule elision
        Expr::True | Expr::False => String::new(),
        Expr::Var(offset) => render_variable(*offset, nodes),
        Expr::Not(inner) => {
            format!("(require-not {})", render_expr(inner, nodes))
        }
        Expr::And(parts) => format!("(require-all {})", join(parts, nodes)),
        Expr::Or(parts) => format!("(require-any {})", join(parts, nodes)),
        Expr::Ite(..) => render_expr(&to_nnf(expr), nodes),
    }
}

fn join(parts: &[Expr], nodes: &NodeTable) -> String {
    let rendered: Vec<String> =
        parts.iter().map(|part| render_expr(part, nodes)).collect();
    rendered.join(" ")
}

/// `(filter-name value)` for one decision variable. A pattern-set
/// argument of more than one string expands into a `require-any` of
/// single-pattern forms.
fn render_variable(offset: u16, nodes: &NodeTable) -> String {
    let Some(node) =
        nodes.get(offset).and_then(OperationNode::as_non_terminal)
    else {
        return format!("(unknown-node-{offset})");
    };
    let Some(resolved) = &node.filter else {
        return format!(
            "(unknown-filter-{} {})",
            node.filter_id, node.argument_id
        );
    };
    let name = &resolved.name;
    match &resolved.argument {
        FilterArgument::Boolean(true) => format!("({name} #t)"),
        FilterArgument::Boolean(false) => format!("({name} #f)"),
        FilterArgument::Symbol(token) => format!("({name} {token})"),
        FilterArgument::Literal(text) => format!("({name} \"{text}\")"),
        FilterArgument::Regex(regex) => format!("({name} #\"{regex}\")"),
        FilterArgument::Patterns(patterns) => match patterns.as_slice() {
            [] => format!("({name})"),
            [only] => format!("({name} \"{only}\")"),
            many => {
                let parts: Vec<String> = many
                    .iter()
                    .map(|pattern| format!("({name} \"{pattern}\")"))
                    .collect();
                format!("(require-any {})", parts.join(" "))
            }
        },
    }
}
