//! Interpreter for the regex bytecode table. Each payload is decoded
//! into an instruction list, lifted to an ε-NFA, minimized through a
//! DFA and collapsed back into a conventional regex string by state
//! elimination.

use anyhow::{anyhow, ensure, Result};

use std::collections::BTreeMap;

mod automata;

pub const REGEX_MAGIC: u32 = 0x0300_0000;

const HEADER_SIZE: usize = 6;

/// Atomic piece of output regex carried by a `chr` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Char(char),
    Any,
    LineStart,
    LineEnd,
    Class(String),
}

impl Fragment {
    fn render(&self) -> String {
        match self {
            Fragment::Char(c) => escape_regex_char(*c),
            Fragment::Any => String::from("."),
            Fragment::LineStart => String::from("^"),
            Fragment::LineEnd => String::from("$"),
            Fragment::Class(body) => body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegexInstr {
    Chr(Fragment),
    /// Absolute jump; both the target and the fall-through stay live.
    Jmp(usize),
    Accept,
}

/// Decode one regex payload (magic, length, instruction stream) into
/// the equivalent regex string.
pub fn decode_regex(data: &[u8]) -> Result<String> {
    let instructions = remap(parse_instructions(data)?);
    let (nfa, symbols) = automata::build_nfa(&instructions);
    let dfa = automata::minimize(&automata::determinize(&nfa));
    Ok(automata::to_regex(&dfa, &symbols))
}

fn parse_instructions(data: &[u8]) -> Result<BTreeMap<usize, RegexInstr>> {
    ensure!(
        data.len() >= HEADER_SIZE,
        "regex payload of {} bytes is too short for a header",
        data.len(),
    );
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    ensure!(magic == REGEX_MAGIC, "bad regex magic {magic:#010x}");
    let length = u16::from_le_bytes(data[4..6].try_into().unwrap());
    ensure!(
        data.len() == HEADER_SIZE + usize::from(length),
        "regex length field says {length}, payload has {} body bytes",
        data.len() - HEADER_SIZE,
    );

    let body = &data[HEADER_SIZE..];
    let mut instructions = BTreeMap::new();
    let mut i = 0usize;
    while i < body.len() {
        let start = i;
        let op = body[i];
        let instr = match op {
            0x02 => {
                let c = *body.get(i + 1).ok_or_else(|| {
                    anyhow!("truncated regex literal at byte {start}")
                })?;
                i += 2;
                RegexInstr::Chr(Fragment::Char(char::from(c)))
            }
            0x19 => {
                i += 1;
                RegexInstr::Chr(Fragment::LineStart)
            }
            0x29 => {
                i += 1;
                RegexInstr::Chr(Fragment::LineEnd)
            }
            0x09 => {
                i += 1;
                RegexInstr::Chr(Fragment::Any)
            }
            op if op & 0xF == 0x05 => {
                i += 1;
                RegexInstr::Accept
            }
            op if op == 0x2F || op & 0xF == 0x0A => {
                ensure!(
                    i + 3 <= body.len(),
                    "truncated regex jump at byte {start}",
                );
                let target =
                    u16::from_le_bytes([body[i + 1], body[i + 2]]);
                i += 3;
                RegexInstr::Jmp(usize::from(target))
            }
            op if op & 0xF == 0x0B => {
                let count = usize::from(op >> 4);
                ensure!(count > 0, "empty character class at byte {start}");
                ensure!(
                    i + 1 + 2 * count <= body.len(),
                    "truncated character class at byte {start}",
                );
                let pairs = &body[i + 1..i + 1 + 2 * count];
                i += 1 + 2 * count;
                RegexInstr::Chr(Fragment::Class(render_class(pairs)))
            }
            other => {
                return Err(anyhow!(
                    "unknown regex opcode {other:#04x} at byte {start}"
                ));
            }
        };
        instructions.insert(start, instr);
    }
    Ok(instructions)
}

/// Bracket expression from raw (lo, hi) bounds. A pair list whose
/// first bound exceeds its last encodes the complement: the last
/// bound rotates to the front and every bound shifts inward by one.
fn render_class(pairs: &[u8]) -> String {
    let mut bounds: Vec<i32> = pairs.iter().map(|&b| i32::from(b)).collect();
    let mut out = String::from("[");
    if bounds[0] > bounds[bounds.len() - 1] {
        out.push('^');
        bounds.rotate_right(1);
        for (i, bound) in bounds.iter_mut().enumerate() {
            if i % 2 == 0 {
                *bound += 1;
            } else {
                *bound -= 1;
            }
        }
    }
    for pair in bounds.chunks(2) {
        let (lo, hi) = (pair[0], pair[1]);
        out.push(class_char(lo));
        if lo < hi {
            out.push('-');
            out.push(class_char(hi));
        }
    }
    out.push(']');
    out
}

fn class_char(value: i32) -> char {
    u32::try_from(value)
        .ok()
        .and_then(char::from_u32)
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// Renumber instructions densely and rewrite jump targets. A target
/// that is not an instruction boundary is left as-is; the NFA builder
/// drops the dangling edge.
fn remap(instructions: BTreeMap<usize, RegexInstr>) -> Vec<RegexInstr> {
    let index_of: BTreeMap<usize, usize> = instructions
        .keys()
        .enumerate()
        .map(|(index, &offset)| (offset, index))
        .collect();
    instructions
        .into_values()
        .map(|instr| match instr {
            RegexInstr::Jmp(target) => RegexInstr::Jmp(
                index_of.get(&target).copied().unwrap_or(usize::MAX),
            ),
            other => other,
        })
        .collect()
}

fn escape_regex_char(c: char) -> String {
    match c {
        '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{'
        | '}' | '|' | '\\' => format!("\\{c}"),
        ' '..='~' => c.to_string(),
        c if (c as u32) <= 0xFF => format!("\\x{:02x}", c as u32),
        c => format!("\\u{{{:04x}}}", c as u32),
    }
}
