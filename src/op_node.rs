use anyhow::{anyhow, ensure, Result};
use num_enum::TryFromPrimitive;

use std::collections::VecDeque;
use std::io::Read;

use crate::filter::{ResolvedFilter, TerminalDecision};

/// Terminals with this bit in `modifier_flags` carry an inline action
/// in bytes 4..8 of the record.
pub const INLINE_ACTION_FLAG: u32 = 0x80_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum RawNodeKind {
    NonTerminal = 0,
    Terminal = 1,
}

/// Decision carried by a terminal: the low bit of `modifier_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub(crate) fn from_flags(flags: u32) -> Self {
        if flags & 1 == 0 {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Deny => f.write_str("deny"),
        }
    }
}

/// Interior predicate node: filter plus two successor offsets.
#[derive(Debug, Clone)]
pub struct NonTerminalNode {
    pub offset: u16,
    pub filter_id: u8,
    pub argument_id: u16,
    pub match_offset: u16,
    pub unmatch_offset: u16,
    /// Attached by the resolution pass after the table is linked.
    pub filter: Option<ResolvedFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineAction {
    pub arg_type: u8,
    pub arg_id: u8,
    pub arg_value: u16,
}

/// Decision leaf: 24-bit modifier flags, optionally an inline action.
#[derive(Debug, Clone)]
pub struct TerminalNode {
    pub offset: u16,
    pub modifier_flags: u32,
    pub inline: Option<InlineAction>,
    /// Attached by the resolution pass.
    pub rendered: Option<TerminalDecision>,
}

impl TerminalNode {
    pub fn decision(&self) -> Decision {
        Decision::from_flags(self.modifier_flags)
    }

    /// Two terminals are interchangeable when their raw flags and
    /// inline action agree; used to elide sinks that restate the
    /// profile default.
    pub fn same_outcome(&self, other: &TerminalNode) -> bool {
        self.modifier_flags == other.modifier_flags
            && self.inline == other.inline
    }
}

#[derive(Debug, Clone)]
pub enum OperationNode {
    NonTerminal(NonTerminalNode),
    Terminal(TerminalNode),
}

impl OperationNode {
    /// Decode one packed 8-byte record. `offset` is the record index,
    /// which doubles as the offset used by match/unmatch pointers.
    pub fn parse(offset: u16, raw: [u8; 8]) -> Result<Self> {
        let kind = RawNodeKind::try_from(raw[0]).map_err(|_| {
            anyhow!("invalid node discriminant {:#04x} at node {offset}", raw[0])
        })?;
        match kind {
            RawNodeKind::NonTerminal => {
                Ok(OperationNode::NonTerminal(NonTerminalNode {
                    offset,
                    filter_id: raw[1],
                    argument_id: u16::from_le_bytes([raw[2], raw[3]]),
                    match_offset: u16::from_le_bytes([raw[4], raw[5]]),
                    unmatch_offset: u16::from_le_bytes([raw[6], raw[7]]),
                    filter: None,
                }))
            }
            RawNodeKind::Terminal => {
                let modifier_flags = u32::from(raw[1])
                    | u32::from(raw[2]) << 8
                    | u32::from(raw[3]) << 16;
                let inline = (modifier_flags & INLINE_ACTION_FLAG != 0).then(
                    || InlineAction {
                        arg_type: raw[4],
                        arg_id: raw[5],
                        arg_value: u16::from_le_bytes([raw[6], raw[7]]),
                    },
                );
                Ok(OperationNode::Terminal(TerminalNode {
                    offset,
                    modifier_flags,
                    inline,
                    rendered: None,
                }))
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationNode::Terminal(_))
    }

    pub fn as_terminal(&self) -> Option<&TerminalNode> {
        match self {
            OperationNode::Terminal(node) => Some(node),
            OperationNode::NonTerminal(_) => None,
        }
    }

    pub fn as_non_terminal(&self) -> Option<&NonTerminalNode> {
        match self {
            OperationNode::NonTerminal(node) => Some(node),
            OperationNode::Terminal(_) => None,
        }
    }
}

/// All operation nodes of a profile, keyed by record index.
#[derive(Debug, Clone)]
pub struct NodeTable {
    nodes: Vec<OperationNode>,
}

impl NodeTable {
    pub fn read(input: &mut impl Read, count: u16) -> Result<Self> {
        let mut nodes = Vec::with_capacity(count.into());
        for offset in 0..count {
            let raw: [u8; 8] = bincode::deserialize_from(&mut *input)?;
            nodes.push(OperationNode::parse(offset, raw)?);
        }
        let table = Self { nodes };
        table.check_links()?;
        table.check_acyclic()?;
        Ok(table)
    }

    /// Every match/unmatch pointer must resolve to a record.
    fn check_links(&self) -> Result<()> {
        let len = self.nodes.len();
        for node in &self.nodes {
            let OperationNode::NonTerminal(nt) = node else {
                continue;
            };
            for successor in [nt.match_offset, nt.unmatch_offset] {
                ensure!(
                    usize::from(successor) < len,
                    "node {} references missing successor {successor}",
                    nt.offset,
                );
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the match/unmatch edges; any leftover
    /// node sits on a cycle.
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            if let OperationNode::NonTerminal(nt) = node {
                indegree[usize::from(nt.match_offset)] += 1;
                indegree[usize::from(nt.unmatch_offset)] += 1;
            }
        }
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(offset, _)| offset)
            .collect();
        let mut processed = 0usize;
        while let Some(offset) = queue.pop_front() {
            processed += 1;
            if let OperationNode::NonTerminal(nt) = &self.nodes[offset] {
                for successor in [nt.match_offset, nt.unmatch_offset] {
                    let successor = usize::from(successor);
                    indegree[successor] -= 1;
                    if indegree[successor] == 0 {
                        queue.push_back(successor);
                    }
                }
            }
        }
        ensure!(
            processed == self.nodes.len(),
            "cycle in match/unmatch pointers ({} of {} nodes reachable \
             from the frontier)",
            processed,
            self.nodes.len(),
        );
        Ok(())
    }

    pub fn get(&self, offset: u16) -> Option<&OperationNode> {
        self.nodes.get(usize::from(offset))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationNode> {
        self.nodes.iter()
    }

    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut OperationNode> {
        self.nodes.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_non_terminal(
        filter_id: u8,
        argument_id: u16,
        match_offset: u16,
        unmatch_offset: u16,
    ) -> [u8; 8] {
        let arg = argument_id.to_le_bytes();
        let m = match_offset.to_le_bytes();
        let u = unmatch_offset.to_le_bytes();
        [0x00, filter_id, arg[0], arg[1], m[0], m[1], u[0], u[1]]
    }

    fn raw_terminal(flags: u32) -> [u8; 8] {
        [
            0x01,
            flags as u8,
            (flags >> 8) as u8,
            (flags >> 16) as u8,
            0x00,
            0x00,
            0x00,
            0x00,
        ]
    }

    #[test]
    fn parse_non_terminal_fields() {
        let node =
            OperationNode::parse(5, raw_non_terminal(0x1a, 0x0203, 7, 9))
                .unwrap();
        let nt = node.as_non_terminal().unwrap();
        assert_eq!(nt.offset, 5);
        assert_eq!(nt.filter_id, 0x1a);
        assert_eq!(nt.argument_id, 0x0203);
        assert_eq!(nt.match_offset, 7);
        assert_eq!(nt.unmatch_offset, 9);
    }

    #[test]
    fn parse_terminal_decision_bit() {
        let allow = OperationNode::parse(0, raw_terminal(0)).unwrap();
        assert_eq!(allow.as_terminal().unwrap().decision(), Decision::Allow);
        let deny = OperationNode::parse(0, raw_terminal(1)).unwrap();
        assert_eq!(deny.as_terminal().unwrap().decision(), Decision::Deny);
    }

    #[test]
    fn parse_terminal_inline_action() {
        let raw = [0x01, 0x00, 0x00, 0x80, 0x03, 0x00, 0x02, 0x00];
        let node = OperationNode::parse(0, raw).unwrap();
        let terminal = node.as_terminal().unwrap();
        assert_eq!(
            terminal.inline,
            Some(InlineAction {
                arg_type: 3,
                arg_id: 0,
                arg_value: 2,
            })
        );
    }

    #[test]
    fn invalid_discriminant_is_rejected() {
        let raw = [0x02, 0, 0, 0, 0, 0, 0, 0];
        assert!(OperationNode::parse(0, raw).is_err());
    }

    #[test]
    fn missing_successor_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&raw_non_terminal(1, 0, 1, 9));
        bytes.extend_from_slice(&raw_terminal(0));
        let err = NodeTable::read(&mut &bytes[..], 2).unwrap_err();
        assert!(err.to_string().contains("missing successor"));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&raw_non_terminal(1, 0, 1, 1));
        bytes.extend_from_slice(&raw_non_terminal(1, 0, 0, 0));
        let err = NodeTable::read(&mut &bytes[..], 2).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn shared_subtree_is_accepted() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&raw_non_terminal(1, 0, 1, 2));
        bytes.extend_from_slice(&raw_non_terminal(2, 0, 2, 2));
        bytes.extend_from_slice(&raw_terminal(0));
        let table = NodeTable::read(&mut &bytes[..], 3).unwrap();
        assert_eq!(table.len(), 3);
    }
}
