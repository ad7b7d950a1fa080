//! ε-NFA construction, subset construction, DFA minimization and the
//! state-elimination pass that turns the minimal DFA back into a
//! regex string. Symbols are placeholders (one per `chr` instruction)
//! substituted for their rendered fragments at the very end.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::{Fragment, RegexInstr};

/// One NFA state per instruction (index + 1) plus the start state 0.
pub(super) struct Nfa {
    finals: BTreeSet<usize>,
    eps: BTreeMap<usize, BTreeSet<usize>>,
    trans: BTreeMap<usize, BTreeMap<usize, BTreeSet<usize>>>,
}

pub(super) fn build_nfa(
    instructions: &[RegexInstr],
) -> (Nfa, BTreeMap<usize, Fragment>) {
    let mut nfa = Nfa {
        finals: BTreeSet::new(),
        eps: BTreeMap::new(),
        trans: BTreeMap::new(),
    };
    let mut symbols = BTreeMap::new();

    if !instructions.is_empty() {
        nfa.eps.entry(0).or_default().insert(1);
    }
    for (index, instr) in instructions.iter().enumerate() {
        let state = index + 1;
        let next = index + 2;
        match instr {
            RegexInstr::Chr(Fragment::LineEnd) => {
                // accept here, consume nothing
                nfa.finals.insert(state);
            }
            RegexInstr::Chr(fragment) => {
                // a trailing chr has no fall-through state; its edge
                // would dangle and match nothing
                if index + 1 < instructions.len() {
                    nfa.trans
                        .entry(state)
                        .or_default()
                        .entry(index)
                        .or_default()
                        .insert(next);
                    symbols.insert(index, fragment.clone());
                }
            }
            RegexInstr::Jmp(target) => {
                if *target < instructions.len() {
                    nfa.eps.entry(state).or_default().insert(target + 1);
                }
                if index + 1 < instructions.len() {
                    nfa.eps.entry(state).or_default().insert(next);
                }
            }
            RegexInstr::Accept => {
                nfa.finals.insert(state);
            }
        }
    }
    (nfa, symbols)
}

/// Deterministic automaton over the same placeholder alphabet. May be
/// partial; a missing transition rejects.
pub(super) struct Dfa {
    start: usize,
    finals: BTreeSet<usize>,
    trans: Vec<BTreeMap<usize, usize>>,
}

fn eps_closure(nfa: &Nfa, seed: &BTreeSet<usize>) -> BTreeSet<usize> {
    let mut closure = seed.clone();
    let mut queue: VecDeque<usize> = seed.iter().copied().collect();
    while let Some(state) = queue.pop_front() {
        if let Some(targets) = nfa.eps.get(&state) {
            for &target in targets {
                if closure.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }
    closure
}

pub(super) fn determinize(nfa: &Nfa) -> Dfa {
    let start_set = eps_closure(nfa, &BTreeSet::from([0]));
    let mut ids: BTreeMap<BTreeSet<usize>, usize> = BTreeMap::new();
    ids.insert(start_set.clone(), 0);
    let mut trans: Vec<BTreeMap<usize, usize>> = vec![BTreeMap::new()];
    let mut finals = BTreeSet::new();
    let mut queue = VecDeque::from([start_set]);
    while let Some(set) = queue.pop_front() {
        let id = ids[&set];
        if set.iter().any(|state| nfa.finals.contains(state)) {
            finals.insert(id);
        }
        let mut moves: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for state in &set {
            if let Some(edges) = nfa.trans.get(state) {
                for (&symbol, targets) in edges {
                    moves.entry(symbol).or_default().extend(targets);
                }
            }
        }
        for (symbol, targets) in moves {
            let closure = eps_closure(nfa, &targets);
            let next_id = *ids.entry(closure.clone()).or_insert_with(|| {
                trans.push(BTreeMap::new());
                queue.push_back(closure);
                trans.len() - 1
            });
            trans[id].insert(symbol, next_id);
        }
    }
    Dfa {
        start: 0,
        finals,
        trans,
    }
}

/// Moore partition refinement. The automaton is completed with an
/// implicit dead state for the duration of the refinement; states
/// that end up equivalent to it are dropped again on rebuild.
pub(super) fn minimize(dfa: &Dfa) -> Dfa {
    let real = dfa.trans.len();
    let dead = real;
    let alphabet: BTreeSet<usize> = dfa
        .trans
        .iter()
        .flat_map(|edges| edges.keys().copied())
        .collect();

    let mut class_of: Vec<usize> = (0..=real)
        .map(|state| usize::from(dfa.finals.contains(&state)))
        .collect();
    loop {
        let mut signatures: BTreeMap<(usize, Vec<usize>), usize> =
            BTreeMap::new();
        let mut next: Vec<usize> = Vec::with_capacity(real + 1);
        for state in 0..=real {
            let row: Vec<usize> = alphabet
                .iter()
                .map(|symbol| {
                    let target = if state == dead {
                        dead
                    } else {
                        dfa.trans[state]
                            .get(symbol)
                            .copied()
                            .unwrap_or(dead)
                    };
                    class_of[target]
                })
                .collect();
            let key = (class_of[state], row);
            let id = signatures.len();
            next.push(*signatures.entry(key).or_insert(id));
        }
        if next == class_of {
            break;
        }
        class_of = next;
    }

    let dead_class = class_of[dead];
    // keep one representative per live class, then renumber densely
    let mut rename: BTreeMap<usize, usize> = BTreeMap::new();
    let mut representative: Vec<usize> = Vec::new();
    for state in 0..real {
        let class = class_of[state];
        if class == dead_class {
            continue;
        }
        rename.entry(class).or_insert_with(|| {
            representative.push(state);
            representative.len() - 1
        });
    }

    let mut trans = vec![BTreeMap::new(); representative.len()];
    let mut finals = BTreeSet::new();
    for (new_id, &state) in representative.iter().enumerate() {
        if dfa.finals.contains(&state) {
            finals.insert(new_id);
        }
        for (&symbol, &target) in &dfa.trans[state] {
            let target_class = class_of[target];
            if target_class == dead_class {
                continue;
            }
            trans[new_id].insert(symbol, rename[&target_class]);
        }
    }
    Dfa {
        start: rename.get(&class_of[dfa.start]).copied().unwrap_or(0),
        finals,
        trans,
    }
}

/// Regex AST used while eliminating states from the generalized NFA.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rex {
    /// Matches nothing at all.
    Never,
    /// Matches the empty string.
    Empty,
    Sym(usize),
    Alt(Vec<Rex>),
    Cat(Vec<Rex>),
    Star(Box<Rex>),
}

fn alt(a: Rex, b: Rex) -> Rex {
    let mut unique = Vec::new();
    for part in [a, b] {
        match part {
            Rex::Never => {}
            Rex::Alt(inner) => {
                for item in inner {
                    if !unique.contains(&item) {
                        unique.push(item);
                    }
                }
            }
            other => {
                if !unique.contains(&other) {
                    unique.push(other);
                }
            }
        }
    }
    match unique.len() {
        0 => Rex::Never,
        1 => unique.pop().unwrap(),
        _ => Rex::Alt(unique),
    }
}

fn cat(a: Rex, b: Rex) -> Rex {
    if a == Rex::Never || b == Rex::Never {
        return Rex::Never;
    }
    let mut items = Vec::new();
    for part in [a, b] {
        match part {
            Rex::Empty => {}
            Rex::Cat(inner) => items.extend(inner),
            other => items.push(other),
        }
    }
    match items.len() {
        0 => Rex::Empty,
        1 => items.pop().unwrap(),
        _ => Rex::Cat(items),
    }
}

fn star(inner: Rex) -> Rex {
    match inner {
        Rex::Never | Rex::Empty => Rex::Empty,
        already @ Rex::Star(_) => already,
        other => Rex::Star(Box::new(other)),
    }
}

/// Collapse the DFA to a single expression by eliminating its states
/// one at a time from a generalized NFA with dedicated start/accept.
pub(super) fn to_regex(
    dfa: &Dfa,
    symbols: &BTreeMap<usize, Fragment>,
) -> String {
    let n = dfa.trans.len();
    let (gnfa_start, gnfa_accept) = (n, n + 1);
    let mut edges: BTreeMap<(usize, usize), Rex> = BTreeMap::new();

    if n > 0 {
        connect(&mut edges, gnfa_start, dfa.start, Rex::Empty);
    }
    for &f in &dfa.finals {
        connect(&mut edges, f, gnfa_accept, Rex::Empty);
    }
    for (state, row) in dfa.trans.iter().enumerate() {
        for (&symbol, &target) in row {
            connect(&mut edges, state, target, Rex::Sym(symbol));
        }
    }

    for q in 0..n {
        let self_loop = edges.remove(&(q, q)).unwrap_or(Rex::Never);
        let looped = star(self_loop);
        let incoming: Vec<((usize, usize), Rex)> = edges
            .iter()
            .filter(|((_, to), _)| *to == q)
            .map(|(&key, rex)| (key, rex.clone()))
            .collect();
        let outgoing: Vec<((usize, usize), Rex)> = edges
            .iter()
            .filter(|((from, _), _)| *from == q)
            .map(|(&key, rex)| (key, rex.clone()))
            .collect();
        for (key, _) in incoming.iter().chain(outgoing.iter()) {
            edges.remove(key);
        }
        for ((from, _), rin) in &incoming {
            for ((_, to), rout) in &outgoing {
                let path = cat(
                    cat(rin.clone(), looped.clone()),
                    rout.clone(),
                );
                connect(&mut edges, *from, *to, path);
            }
        }
    }

    let result = edges
        .remove(&(gnfa_start, gnfa_accept))
        .unwrap_or(Rex::Never);
    render(&result, symbols).0
}

fn connect(
    edges: &mut BTreeMap<(usize, usize), Rex>,
    from: usize,
    to: usize,
    rex: Rex,
) {
    let slot = edges.entry((from, to)).or_insert(Rex::Never);
    *slot = alt(std::mem::replace(slot, Rex::Never), rex);
}

#[derive(PartialEq, PartialOrd)]
enum Precedence {
    Alt,
    Cat,
    Atom,
}

/// Render to text, returning the precedence of the produced form so
/// callers know whether to parenthesize.
fn render(
    rex: &Rex,
    symbols: &BTreeMap<usize, Fragment>,
) -> (String, Precedence) {
    match rex {
        // an empty language renders as the empty pattern; the caller
        // has nothing better to print
        Rex::Never | Rex::Empty => (String::new(), Precedence::Atom),
        Rex::Sym(symbol) => {
            let text = symbols
                .get(symbol)
                .map(Fragment::render)
                .unwrap_or_default();
            (text, Precedence::Atom)
        }
        Rex::Alt(items) => {
            if let Some(stripped) = optional_form(items, symbols) {
                return (stripped, Precedence::Atom);
            }
            let parts: Vec<String> = items
                .iter()
                .map(|item| render(item, symbols).0)
                .collect();
            (parts.join("|"), Precedence::Alt)
        }
        Rex::Cat(items) => {
            let mut out = String::new();
            for item in items {
                let (text, precedence) = render(item, symbols);
                if precedence < Precedence::Cat {
                    out.push('(');
                    out.push_str(&text);
                    out.push(')');
                } else {
                    out.push_str(&text);
                }
            }
            (out, Precedence::Cat)
        }
        Rex::Star(inner) => {
            let (text, _) = render(inner, symbols);
            // symbol fragments are already atomic regex units
            if matches!(**inner, Rex::Sym(_)) {
                (format!("{text}*"), Precedence::Atom)
            } else {
                (format!("({text})*"), Precedence::Atom)
            }
        }
    }
}

/// An alternation containing ε reads better as `...?`.
fn optional_form(
    items: &[Rex],
    symbols: &BTreeMap<usize, Fragment>,
) -> Option<String> {
    if !items.contains(&Rex::Empty) {
        return None;
    }
    let rest: Vec<&Rex> = items
        .iter()
        .filter(|item| **item != Rex::Empty)
        .collect();
    match rest.as_slice() {
        [] => Some(String::new()),
        [only] if matches!(only, Rex::Sym(_)) => {
            Some(format!("{}?", render(only, symbols).0))
        }
        [only] => Some(format!("({})?", render(only, symbols).0)),
        many => {
            let parts: Vec<String> = many
                .iter()
                .map(|item| render(item, symbols).0)
                .collect();
            Some(format!("({})?", parts.join("|")))
        }
    }
}
