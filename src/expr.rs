//! Boolean formulas extracted from decision sub-DAGs. Variables are
//! node offsets ("the filter at this node matched the request").

use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    True,
    False,
    Var(u16),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Ite(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn ite(condition: Expr, when_true: Expr, when_false: Expr) -> Expr {
        Expr::Ite(
            Box::new(condition),
            Box::new(when_true),
            Box::new(when_false),
        )
    }

    pub fn not(inner: Expr) -> Expr {
        Expr::Not(Box::new(inner))
    }

    pub fn or_all(mut parts: Vec<Expr>) -> Expr {
        match parts.len() {
            0 => Expr::False,
            1 => parts.pop().unwrap(),
            _ => Expr::Or(parts),
        }
    }
}

/// Negation-normal form: no if-then-else, negations only on
/// variables, flattened and lightly simplified. Idempotent.
pub fn to_nnf(expr: &Expr) -> Expr {
    simplify(push_negations(expr, false))
}

fn push_negations(expr: &Expr, negate: bool) -> Expr {
    match expr {
        Expr::True => {
            if negate {
                Expr::False
            } else {
                Expr::True
            }
        }
        Expr::False => {
            if negate {
                Expr::True
            } else {
                Expr::False
            }
        }
        Expr::Var(offset) => {
            if negate {
                Expr::not(Expr::Var(*offset))
            } else {
                Expr::Var(*offset)
            }
        }
        Expr::Not(inner) => push_negations(inner, !negate),
        Expr::And(parts) => {
            let parts: Vec<Expr> = parts
                .iter()
                .map(|part| push_negations(part, negate))
                .collect();
            if negate {
                Expr::Or(parts)
            } else {
                Expr::And(parts)
            }
        }
        Expr::Or(parts) => {
            let parts: Vec<Expr> = parts
                .iter()
                .map(|part| push_negations(part, negate))
                .collect();
            if negate {
                Expr::And(parts)
            } else {
                Expr::Or(parts)
            }
        }
        Expr::Ite(condition, when_true, when_false) => {
            // ite(c, t, f) == (c and t) or (not c and f)
            let expanded = Expr::Or(vec![
                Expr::And(vec![(**condition).clone(), (**when_true).clone()]),
                Expr::And(vec![
                    Expr::not((**condition).clone()),
                    (**when_false).clone(),
                ]),
            ]);
            push_negations(&expanded, negate)
        }
    }
}

/// Flatten nested connectives, drop identity elements, collapse
/// singletons and duplicated siblings.
fn simplify(expr: Expr) -> Expr {
    match expr {
        Expr::And(parts) => {
            let mut out: Vec<Expr> = Vec::new();
            for part in parts {
                match simplify(part) {
                    Expr::True => {}
                    Expr::False => return Expr::False,
                    Expr::And(inner) => {
                        for item in inner {
                            if !out.contains(&item) {
                                out.push(item);
                            }
                        }
                    }
                    other => {
                        if !out.contains(&other) {
                            out.push(other);
                        }
                    }
                }
            }
            match out.len() {
                0 => Expr::True,
                1 => out.pop().unwrap(),
                _ => Expr::And(out),
            }
        }
        Expr::Or(parts) => {
            let mut out: Vec<Expr> = Vec::new();
            for part in parts {
                match simplify(part) {
                    Expr::False => {}
                    Expr::True => return Expr::True,
                    Expr::Or(inner) => {
                        for item in inner {
                            if !out.contains(&item) {
                                out.push(item);
                            }
                        }
                    }
                    other => {
                        if !out.contains(&other) {
                            out.push(other);
                        }
                    }
                }
            }
            match out.len() {
                0 => Expr::False,
                1 => out.pop().unwrap(),
                _ => Expr::Or(out),
            }
        }
        Expr::Not(inner) => match simplify(*inner) {
            Expr::True => Expr::False,
            Expr::False => Expr::True,
            other => Expr::not(other),
        },
        leaf => leaf,
    }
}

/// Best-effort simplification capability. The decompiler only
/// requires that the result is NNF and logically equivalent; an
/// implementation backed by a real boolean-reasoning engine can be
/// swapped in at the call site.
pub trait Simplifier {
    fn simplify(&self, expr: &Expr, budget: Duration) -> Expr;
}

/// Default simplifier: syntactic NNF plus complement elimination and
/// absorption, both abandoned wholesale when the budget runs out.
#[derive(Debug, Default, Clone, Copy)]
pub struct NnfSimplifier;

impl Simplifier for NnfSimplifier {
    fn simplify(&self, expr: &Expr, budget: Duration) -> Expr {
        let nnf = to_nnf(expr);
        let deadline = Instant::now() + budget;
        match refine(&nnf, deadline) {
            Some(refined) => simplify(refined),
            None => {
                tracing::debug!(
                    "simplification budget exhausted, keeping syntactic \
                     normal form"
                );
                nnf
            }
        }
    }
}

fn complements(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Not(inner), other) | (other, Expr::Not(inner)) => {
            **inner == *other
        }
        _ => false,
    }
}

/// One bounded rewriting pass: x and not-x cancel, `a or (a and b)`
/// drops the conjunction (dually for `and`/`or`). Returns `None` when
/// the deadline passes.
fn refine(expr: &Expr, deadline: Instant) -> Option<Expr> {
    if Instant::now() >= deadline {
        return None;
    }
    match expr {
        Expr::And(parts) => {
            let parts: Vec<Expr> = parts
                .iter()
                .map(|part| refine(part, deadline))
                .collect::<Option<_>>()?;
            for (i, a) in parts.iter().enumerate() {
                for b in &parts[i + 1..] {
                    if complements(a, b) {
                        return Some(Expr::False);
                    }
                }
            }
            let absorbed: Vec<Expr> = parts
                .iter()
                .filter(|part| match part {
                    Expr::Or(inner) => !inner
                        .iter()
                        .any(|item| parts.contains(item)),
                    _ => true,
                })
                .cloned()
                .collect();
            Some(Expr::And(absorbed))
        }
        Expr::Or(parts) => {
            let parts: Vec<Expr> = parts
                .iter()
                .map(|part| refine(part, deadline))
                .collect::<Option<_>>()?;
            for (i, a) in parts.iter().enumerate() {
                for b in &parts[i + 1..] {
                    if complements(a, b) {
                        return Some(Expr::True);
                    }
                }
            }
            let absorbed: Vec<Expr> = parts
                .iter()
                .filter(|part| match part {
                    Expr::And(inner) => !inner
                        .iter()
                        .any(|item| parts.contains(item)),
                    _ => true,
                })
                .cloned()
                .collect();
            Some(Expr::Or(absorbed))
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(offset: u16) -> Expr {
        Expr::Var(offset)
    }

    #[test]
    fn ite_expands_to_disjunction() {
        let expr = Expr::ite(var(1), var(2), var(3));
        assert_eq!(
            to_nnf(&expr),
            Expr::Or(vec![
                Expr::And(vec![var(1), var(2)]),
                Expr::And(vec![Expr::not(var(1)), var(3)]),
            ])
        );
    }

    #[test]
    fn ite_with_constant_branches_collapses() {
        let expr = Expr::ite(var(1), Expr::True, Expr::False);
        assert_eq!(to_nnf(&expr), var(1));
        let expr = Expr::ite(var(1), Expr::False, Expr::True);
        assert_eq!(to_nnf(&expr), Expr::not(var(1)));
    }

    #[test]
    fn negation_pushes_to_literals() {
        let expr = Expr::not(Expr::And(vec![var(1), Expr::not(var(2))]));
        assert_eq!(
            to_nnf(&expr),
            Expr::Or(vec![Expr::not(var(1)), var(2)])
        );
    }

    #[test]
    fn nnf_is_idempotent() {
        let expr = Expr::ite(
            var(1),
            Expr::ite(var(2), Expr::True, Expr::False),
            Expr::not(Expr::Or(vec![var(3), Expr::False, var(3)])),
        );
        let once = to_nnf(&expr);
        assert_eq!(to_nnf(&once), once);
    }

    #[test]
    fn duplicate_siblings_collapse() {
        let expr = Expr::Or(vec![var(1), var(1), var(2)]);
        assert_eq!(to_nnf(&expr), Expr::Or(vec![var(1), var(2)]));
    }

    #[test]
    fn complement_elimination() {
        let simplifier = NnfSimplifier;
        let expr = Expr::And(vec![var(1), Expr::not(var(1))]);
        assert_eq!(
            simplifier.simplify(&expr, Duration::from_millis(100)),
            Expr::False
        );
        let expr = Expr::Or(vec![var(1), Expr::not(var(1))]);
        assert_eq!(
            simplifier.simplify(&expr, Duration::from_millis(100)),
            Expr::True
        );
    }

    #[test]
    fn absorption() {
        let simplifier = NnfSimplifier;
        let expr =
            Expr::Or(vec![var(1), Expr::And(vec![var(1), var(2)])]);
        assert_eq!(
            simplifier.simplify(&expr, Duration::from_millis(100)),
            var(1)
        );
    }

    #[test]
    fn exhausted_budget_falls_back_to_plain_nnf() {
        let simplifier = NnfSimplifier;
        let expr = Expr::And(vec![var(1), Expr::not(var(1))]);
        // zero budget: the refinement pass never runs
        let out = simplifier.simplify(&expr, Duration::ZERO);
        assert_eq!(out, Expr::And(vec![var(1), Expr::not(var(1))]));
    }
}
