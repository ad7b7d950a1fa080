//! Interpreter for the path-pattern bytecode attached to filter
//! arguments. The program drives a matching automaton; decompilation
//! enumerates every input string that reaches SUCCESS and renders the
//! set as glob-like text.

use anyhow::{anyhow, ensure, Result};

use std::collections::{BTreeMap, BTreeSet};

mod opcode {
    pub const ASSERT_EOS: u8 = 0x00;
    pub const CALLBACK: u8 = 0x01;
    pub const MATCH_BYTE: u8 = 0x02;
    pub const MATCH_SEQ: u8 = 0x03;
    pub const LITERAL: u8 = 0x04;
    pub const RESTORE_POS: u8 = 0x05;
    pub const PUSH_STATE: u8 = 0x06;
    pub const POP_STATE: u8 = 0x07;
    pub const JNE: u8 = 0x08;
    pub const SUCCESS: u8 = 0x0A;
    pub const RANGE: u8 = 0x0B;
    pub const MATCH: u8 = 0x0F;

    pub const CALLBACK_SHORT_LO: u8 = 0x10;
    pub const CALLBACK_SHORT_HI: u8 = 0x1F;
    pub const LITERAL_SHORT_LO: u8 = 0x40;
    pub const LITERAL_SHORT_HI: u8 = 0x7F;
    pub const JNE_SHORT_LO: u8 = 0x80;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternOp {
    /// Require end-of-input at the current position.
    AssertEos,
    /// Splice in global variable `i`.
    Callback(u16),
    /// One or more bytes ending at `c`.
    MatchByte(u8),
    MatchSeq(u8),
    Literal(String),
    /// Rewind to the last saved position, dropping output emitted
    /// since the matching PUSH_STATE.
    RestorePos,
    PushState,
    PopState,
    Success,
    Range {
        exclusive: bool,
        ranges: Vec<(u8, u8)>,
    },
    /// Byte-level match anchor; emits nothing.
    Anchor,
    /// Conditional forward jump. Holds the absolute byte target while
    /// decoding, an instruction index after reindexing.
    Jne(usize),
}

fn byte_at(data: &[u8], pos: usize) -> Result<u8> {
    data.get(pos)
        .copied()
        .ok_or_else(|| anyhow!("truncated pattern operand at byte {pos}"))
}

fn u16_at(data: &[u8], pos: usize) -> Result<u16> {
    ensure!(
        pos + 2 <= data.len(),
        "truncated pattern operand at byte {pos}",
    );
    Ok(u16::from_le_bytes([data[pos], data[pos + 1]]))
}

fn literal_at(data: &[u8], pos: usize, len: usize) -> Result<String> {
    ensure!(
        pos + len <= data.len(),
        "literal at byte {pos} runs past end of pattern",
    );
    Ok(String::from_utf8_lossy(&data[pos..pos + len]).into_owned())
}

/// Decode the byte program into an instruction table keyed by pc.
pub fn decode_program(data: &[u8]) -> Result<BTreeMap<usize, PatternOp>> {
    let mut ops = BTreeMap::new();
    let mut pc = 0usize;
    while pc < data.len() {
        let start = pc;
        let op = match data[pc] {
            opcode::ASSERT_EOS => {
                pc += 1;
                PatternOp::AssertEos
            }
            opcode::CALLBACK => {
                let index = u16_at(data, pc + 1)?;
                pc += 3;
                PatternOp::Callback(index)
            }
            opcode::MATCH_BYTE => {
                let c = byte_at(data, pc + 1)?;
                pc += 2;
                PatternOp::MatchByte(c)
            }
            opcode::MATCH_SEQ => {
                let c = byte_at(data, pc + 1)?;
                pc += 2;
                PatternOp::MatchSeq(c)
            }
            opcode::LITERAL => {
                let len = usize::from(byte_at(data, pc + 1)?) + 0x41;
                let text = literal_at(data, pc + 2, len)?;
                pc += 2 + len;
                PatternOp::Literal(text)
            }
            opcode::RESTORE_POS => {
                pc += 1;
                PatternOp::RestorePos
            }
            opcode::PUSH_STATE => {
                pc += 1;
                PatternOp::PushState
            }
            opcode::POP_STATE => {
                pc += 1;
                PatternOp::PopState
            }
            opcode::SUCCESS => {
                pc += 1;
                PatternOp::Success
            }
            opcode::RANGE => {
                let flags = byte_at(data, pc + 1)?;
                let count = usize::from(flags & 0x7F) + 1;
                let mut ranges = Vec::with_capacity(count);
                for pair in 0..count {
                    let lo = byte_at(data, pc + 2 + 2 * pair)?;
                    let hi = byte_at(data, pc + 3 + 2 * pair)?;
                    ranges.push((lo, hi));
                }
                // one pad byte trails the pair list
                pc += 2 + 2 * count + 1;
                PatternOp::Range {
                    exclusive: flags & 0x80 != 0,
                    ranges,
                }
            }
            opcode::MATCH => {
                pc += 1;
                PatternOp::Anchor
            }
            opcode::JNE => {
                let delta = usize::from(u16_at(data, pc + 1)?);
                pc += 3;
                PatternOp::Jne(start + 3 + delta + 0x84)
            }
            op @ opcode::CALLBACK_SHORT_LO..=opcode::CALLBACK_SHORT_HI => {
                pc += 1;
                PatternOp::Callback(u16::from(op & 0xF))
            }
            op @ opcode::LITERAL_SHORT_LO..=opcode::LITERAL_SHORT_HI => {
                let len = usize::from(op & 0x3F) + 1;
                let text = literal_at(data, pc + 1, len)?;
                pc += 1 + len;
                PatternOp::Literal(text)
            }
            op @ opcode::JNE_SHORT_LO..=u8::MAX => {
                let delta = usize::from(op & 0x7F) + 1;
                pc += 1;
                PatternOp::Jne(start + 1 + delta)
            }
            other => {
                return Err(anyhow!(
                    "unknown pattern opcode {other:#04x} at byte {start}"
                ));
            }
        };
        ops.insert(start, op);
    }
    Ok(ops)
}

/// Renumber instructions 0..n, rewriting jump targets from byte
/// offsets to instruction indices.
fn reindex(ops: BTreeMap<usize, PatternOp>) -> Result<Vec<PatternOp>> {
    let index_of: BTreeMap<usize, usize> = ops
        .keys()
        .enumerate()
        .map(|(index, &pc)| (pc, index))
        .collect();
    ops.into_iter()
        .map(|(pc, op)| match op {
            PatternOp::Jne(target) => index_of
                .get(&target)
                .map(|&index| PatternOp::Jne(index))
                .ok_or_else(|| {
                    anyhow!(
                        "pattern jump at byte {pc} targets byte {target}, \
                         which is not an instruction boundary"
                    )
                }),
            other => Ok(other),
        })
        .collect()
}

/// Walk every accepting path of the program and render it. Paths are
/// explored with an explicit worklist; save-point depth in real
/// profiles exceeds what recursion could take.
fn enumerate_accepted(
    program: &[PatternOp],
    global_vars: &[String],
) -> Result<BTreeSet<String>> {
    let mut accepted = BTreeSet::new();
    let mut work: Vec<(usize, Vec<usize>)> = vec![(0, Vec::new())];
    while let Some((pc, mut path)) = work.pop() {
        let Some(op) = program.get(pc) else {
            continue;
        };
        match op {
            PatternOp::Success => {
                accepted.insert(render_path(&path, program, global_vars)?);
            }
            PatternOp::Jne(target) => {
                // The jump is taken when the previous step failed to
                // match, so that step's output is dropped on the
                // jumping branch.
                let mut jump_path = path.clone();
                jump_path.pop();
                jump_path.push(pc);
                path.push(pc);
                work.push((pc + 1, path));
                work.push((*target, jump_path));
            }
            PatternOp::RestorePos => {
                if let Some(saved) = path
                    .iter()
                    .rposition(|&index| program[index] == PatternOp::PushState)
                {
                    path.truncate(saved);
                }
                work.push((pc + 1, path));
            }
            _ => {
                path.push(pc);
                work.push((pc + 1, path));
            }
        }
    }
    Ok(accepted)
}

fn render_path(
    path: &[usize],
    program: &[PatternOp],
    global_vars: &[String],
) -> Result<String> {
    let mut out = String::new();
    for &index in path {
        match &program[index] {
            PatternOp::Literal(text) => out.push_str(text),
            PatternOp::Callback(i) => {
                let name =
                    global_vars.get(usize::from(*i)).ok_or_else(|| {
                        anyhow!(
                            "pattern callback {i} has no matching global \
                             variable"
                        )
                    })?;
                out.push_str("${");
                out.push_str(&name.to_uppercase());
                out.push('}');
            }
            PatternOp::MatchByte(c) | PatternOp::MatchSeq(c) => {
                out.push_str(".+");
                out.push(char::from(*c));
            }
            PatternOp::Range { exclusive, ranges } => {
                out.push_str(&render_class(*exclusive, ranges));
            }
            _ => {}
        }
    }
    Ok(out)
}

fn render_class(exclusive: bool, ranges: &[(u8, u8)]) -> String {
    let mut body = String::new();
    for &(lo, hi) in ranges {
        body.push_str(&escape_class_byte(lo));
        body.push('-');
        body.push_str(&escape_class_byte(hi));
    }
    if exclusive {
        format!("[^{body}]")
    } else {
        format!("[{body}]")
    }
}

fn escape_class_byte(c: u8) -> String {
    match c {
        0x20..=0x7E if !matches!(c, b'\\' | b'[' | b']' | b'^' | b'-') => {
            char::from(c).to_string()
        }
        _ => format!("\\x{c:02x}"),
    }
}

/// Decode a pattern blob into the sorted set of strings it accepts.
pub fn decode_pattern(
    data: &[u8],
    global_vars: &[String],
) -> Result<Vec<String>> {
    let program = reindex(decode_program(data)?)?;
    let accepted = enumerate_accepted(&program, global_vars)?;
    Ok(accepted.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[test]
    fn literal_path() {
        let program = [
            0x43, // LITERAL_SHORT, 4 bytes
            0x2F, 0x61, 0x61, 0x61, // "/aaa"
            0x0F, // MATCH
            0x00, // ASSERT_EOS
            0x0F, // MATCH
            0x0A, // SUCCESS
        ];
        let set = decode_pattern(&program, &[]).unwrap();
        assert_eq!(set, ["/aaa"]);
    }

    #[test]
    fn alternation_via_jne() {
        let program = [
            0x40, 0x2F, // LITERAL_SHORT "/"
            0x0F, // MATCH
            0x42, 0x62, 0x62, 0x62, // LITERAL_SHORT "bbb"
            0x82, // JNE_SHORT, +3
            0x00, // ASSERT_EOS
            0x0F, // MATCH
            0x0A, // SUCCESS
            0x42, 0x61, 0x61, 0x61, // LITERAL_SHORT "aaa"
            0x0F, // MATCH
            0x00, // ASSERT_EOS
            0x0F, // MATCH
            0x0A, // SUCCESS
        ];
        let set = decode_pattern(&program, &[]).unwrap();
        assert_eq!(set, ["/aaa", "/bbb"]);
    }

    #[test]
    fn character_class() {
        let program = [
            0x40, 0x2F, // LITERAL_SHORT "/"
            0x0F, // MATCH
            0x0B, 0x00, 0x00, 0xFF, // RANGE, one pair \x00-\xff
            0x0F, // pad byte swallowed by RANGE
            0x46, 0x74, 0x72, 0x61, 0x73, 0x68, 0x65,
            0x73, // LITERAL_SHORT "trashes"
            0x0F, // MATCH
            0x0A, // SUCCESS
        ];
        let set = decode_pattern(&program, &[]).unwrap();
        assert_eq!(set, ["/[\\x00-\\xff]trashes"]);
    }

    #[test]
    fn empty_body_accepts_nothing() {
        let set = decode_pattern(&[], &[]).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn callback_splices_global_variable() {
        let program = [
            0x10, // CALLBACK_SHORT 0
            0x41, 0x2F, 0x78, // LITERAL_SHORT "/x"
            0x0A, // SUCCESS
        ];
        let set =
            decode_pattern(&program, &[String::from("home")]).unwrap();
        assert_eq!(set, ["${HOME}/x"]);
    }

    #[test]
    fn callback_without_variable_fails() {
        let program = [0x10, 0x0A];
        assert!(decode_pattern(&program, &[]).is_err());
    }

    #[test]
    fn restore_pos_truncates_to_last_push_state() {
        use PatternOp::*;
        let program = [
            PushState,
            Literal(String::from("ab")),
            RestorePos,
            Literal(String::from("cd")),
            Success,
        ];
        let set = enumerate_accepted(&program, &[]).unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            [String::from("cd")]
        );
    }

    #[test]
    fn match_seq_renders_as_wildcard() {
        let program = [
            0x03, 0x2F, // MATCH_SEQ '/'
            0x0A, // SUCCESS
        ];
        let set = decode_pattern(&program, &[]).unwrap();
        assert_eq!(set, [".+/"]);
    }

    #[rstest]
    #[case(&[0x0C], "unknown pattern opcode")]
    #[case(&[0x01, 0x00], "truncated pattern operand")]
    #[case(&[0x43, 0x2F], "runs past end of pattern")]
    #[case(&[0x08, 0x00, 0x00], "not an instruction boundary")]
    fn malformed_programs(#[case] data: &[u8], #[case] message: &str) {
        let err = decode_pattern(data, &[]).unwrap_err();
        assert!(
            err.to_string().contains(message),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn long_jne_form_lands_past_offset_base() {
        // JNE with a zero delta still skips 0x84 bytes past the
        // operand; place a literal run there to give it a target.
        let mut data = vec![0x08, 0x00, 0x00];
        data.extend(std::iter::repeat(0x0F).take(0x84));
        data.push(0x0A); // target of the jump, also fall-through end
        let ops = decode_program(&data).unwrap();
        assert_eq!(ops[&0], PatternOp::Jne(3 + 0x84));
        let set = decode_pattern(&data, &[]).unwrap();
        assert_eq!(set, [""]);
    }
}
