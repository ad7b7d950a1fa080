//! Container decoder: header, auxiliary tables, operation nodes and
//! the resolution pass that attaches printable text to every node.

use anyhow::{anyhow, ensure, Result};
use tracing::warn;

use std::io::{Read, Seek, SeekFrom};

use crate::filter::{
    resolve_terminal, FilterCatalog, FilterResolver, ModifierCatalog,
};
use crate::op_node::{NodeTable, OperationNode, TerminalNode};
use crate::regex;
use crate::sb_reader::SbSeek;
use crate::ProfileHeader;

/// A fully decoded profile. All tables are read once and frozen; the
/// per-operation analysis borrows from here.
#[derive(Debug)]
pub struct DecodedProfile {
    pub header: ProfileHeader,
    pub regex_list: Vec<String>,
    pub global_vars: Vec<String>,
    /// Entitlement policy roots (empty in this header revision).
    pub policies: Vec<u16>,
    /// Dispatch table: entry 0 is the profile default terminal, entry
    /// `i` the root node of operation `sb_ops[i]`.
    pub op_table: Vec<u16>,
    pub nodes: NodeTable,
}

impl DecodedProfile {
    pub fn read<R: Read + Seek>(
        input: &mut R,
        sb_ops: &[String],
        filters: &FilterCatalog,
        modifiers: &ModifierCatalog,
    ) -> Result<Self> {
        let file_len = input.byte_len()?;
        input.seek(SeekFrom::Start(0))?;
        let header = ProfileHeader::read(input)?;
        header.validate(file_len)?;
        ensure!(
            sb_ops.len() == usize::from(header.sb_ops_count),
            "operations list names {} operations, profile dispatches {}",
            sb_ops.len(),
            header.sb_ops_count,
        );

        let base_addr = header.base_addr();

        // a broken regex poisons only its own slot
        let regex_slots = input.read_u16_table(
            header.regex_table_offset(),
            header.regex_count.into(),
        )?;
        let mut regex_list = Vec::with_capacity(regex_slots.len());
        for (index, &slot) in regex_slots.iter().enumerate() {
            let blob =
                input.read_indirect_record(base_addr, slot, file_len)?;
            let rendered = match regex::decode_regex(&blob) {
                Ok(rendered) => rendered,
                Err(err) => {
                    warn!(index, error = %err, "regex did not decode");
                    format!("unparsed-regex-{index}")
                }
            };
            regex_list.push(rendered);
        }

        let var_slots = input
            .read_u16_table(header.vars_offset(), header.vars_count.into())?;
        let mut global_vars = Vec::with_capacity(var_slots.len());
        for &slot in &var_slots {
            global_vars
                .push(input.read_indirect_c_string(base_addr, slot, file_len)?);
        }

        let policies = input.read_u16_table(
            header.entitlements_offset(),
            header.entitlements_count.into(),
        )?;

        let op_table = input.read_u16_table(
            header.op_table_offset(),
            header.sb_ops_count.into(),
        )?;
        ensure!(!op_table.is_empty(), "profile dispatches no operations");

        input.seek(SeekFrom::Start(header.operation_nodes_offset()))?;
        let mut nodes = NodeTable::read(input, header.op_nodes_count)?;
        for &root in &op_table {
            ensure!(
                usize::from(root) < nodes.len(),
                "dispatch table entry {root} is outside the node table",
            );
        }

        // resolution pass: text for every non-terminal, then every
        // terminal
        let mut resolver = FilterResolver::new(
            input,
            file_len,
            base_addr,
            &regex_list,
            &global_vars,
            filters,
        );
        for node in nodes.iter_mut() {
            if let OperationNode::NonTerminal(nt) = node {
                nt.filter =
                    Some(resolver.resolve(nt.filter_id, nt.argument_id));
            }
        }
        drop(resolver);
        let node_count = nodes.len();
        for node in nodes.iter_mut() {
            if let OperationNode::Terminal(terminal) = node {
                let rendered = resolve_terminal(
                    input,
                    file_len,
                    base_addr,
                    modifiers,
                    sb_ops,
                    &policies,
                    node_count,
                    terminal,
                );
                terminal.rendered = Some(rendered);
            }
        }

        Ok(Self {
            header,
            regex_list,
            global_vars,
            policies,
            op_table,
            nodes,
        })
    }

    /// Entry 0 of the dispatch table; every operation without a rule
    /// of its own falls back to this decision.
    pub fn default_terminal(&self) -> Result<&TerminalNode> {
        let offset = self.op_table[0];
        self.nodes
            .get(offset)
            .and_then(OperationNode::as_terminal)
            .ok_or_else(|| {
                anyhow!("profile default node {offset} is not a terminal")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use crate::test::ProfileImage;

    fn empty_catalogs() -> (FilterCatalog, ModifierCatalog) {
        (
            FilterCatalog::from_json("{}").unwrap(),
            ModifierCatalog::from_json("{}").unwrap(),
        )
    }

    #[test]
    fn decode_minimal_profile() {
        let mut image = ProfileImage::new();
        image.push_node([0x01, 0x01, 0, 0, 0, 0, 0, 0]); // deny default
        image.op_table(&[0]);
        let bytes = image.build();
        let (filters, modifiers) = empty_catalogs();
        let sb_ops = [String::from("default")];
        let mut input = Cursor::new(bytes);
        let profile =
            DecodedProfile::read(&mut input, &sb_ops, &filters, &modifiers)
                .unwrap();
        assert_eq!(profile.op_table, [0]);
        assert_eq!(profile.nodes.len(), 1);
        assert!(profile.default_terminal().is_ok());
    }

    #[test]
    fn global_vars_decode() {
        let mut image = ProfileImage::new();
        image.push_node([0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        image.op_table(&[0]);
        image.push_var("HOME");
        let bytes = image.build();
        let (filters, modifiers) = empty_catalogs();
        let sb_ops = [String::from("default")];
        let mut input = Cursor::new(bytes);
        let profile =
            DecodedProfile::read(&mut input, &sb_ops, &filters, &modifiers)
                .unwrap();
        assert_eq!(profile.global_vars, ["HOME"]);
    }

    #[test]
    fn broken_regex_degrades_to_placeholder() {
        let mut image = ProfileImage::new();
        image.push_node([0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        image.op_table(&[0]);
        image.push_regex(&[0xFF, 0xFF, 0xFF, 0xFF]); // bad magic
        let bytes = image.build();
        let (filters, modifiers) = empty_catalogs();
        let sb_ops = [String::from("default")];
        let mut input = Cursor::new(bytes);
        let profile =
            DecodedProfile::read(&mut input, &sb_ops, &filters, &modifiers)
                .unwrap();
        assert_eq!(profile.regex_list, ["unparsed-regex-0"]);
    }

    #[test]
    fn operations_list_length_must_match() {
        let mut image = ProfileImage::new();
        image.push_node([0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        image.op_table(&[0]);
        let bytes = image.build();
        let (filters, modifiers) = empty_catalogs();
        let sb_ops = [String::from("default"), String::from("extra")];
        let mut input = Cursor::new(bytes);
        let err =
            DecodedProfile::read(&mut input, &sb_ops, &filters, &modifiers)
                .unwrap_err();
        assert!(err.to_string().contains("operations list"));
    }

    #[test]
    fn dispatch_entry_outside_node_table_is_rejected() {
        let mut image = ProfileImage::new();
        image.push_node([0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        image.op_table(&[7]);
        let bytes = image.build();
        let (filters, modifiers) = empty_catalogs();
        let sb_ops = [String::from("default")];
        let mut input = Cursor::new(bytes);
        let err =
            DecodedProfile::read(&mut input, &sb_ops, &filters, &modifiers)
                .unwrap_err();
        assert!(err.to_string().contains("outside the node table"));
    }

    #[test]
    fn non_terminal_default_is_rejected() {
        let mut image = ProfileImage::new();
        image.push_node([0x00, 0x01, 0, 0, 0x01, 0, 0x01, 0]);
        image.push_node([0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        image.op_table(&[0]);
        let bytes = image.build();
        let (filters, modifiers) = empty_catalogs();
        let sb_ops = [String::from("default")];
        let mut input = Cursor::new(bytes);
        let profile =
            DecodedProfile::read(&mut input, &sb_ops, &filters, &modifiers)
                .unwrap();
        assert!(profile.default_terminal().is_err());
    }
}
