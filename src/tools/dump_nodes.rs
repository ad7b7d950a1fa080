use crate::Args;

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};

use anyhow::Result;

use sbp_rs::op_node::{NodeTable, OperationNode};
use sbp_rs::ProfileHeader;

pub fn dump_nodes(args: &Args) -> Result<()> {
    let mut input = BufReader::new(File::open(&args.input)?);
    let header = ProfileHeader::read(&mut input)?;
    input.seek(SeekFrom::Start(header.operation_nodes_offset()))?;
    let nodes = NodeTable::read(&mut input, header.op_nodes_count)?;

    for node in nodes.iter() {
        match node {
            OperationNode::NonTerminal(nt) => {
                println!(
                    "{:04}: filter {:#04x} arg {:#06x} match {:04} \
                     unmatch {:04}",
                    nt.offset,
                    nt.filter_id,
                    nt.argument_id,
                    nt.match_offset,
                    nt.unmatch_offset,
                );
            }
            OperationNode::Terminal(terminal) => {
                println!(
                    "{:04}: {} flags {:#08x}",
                    terminal.offset,
                    terminal.decision(),
                    terminal.modifier_flags,
                );
            }
        }
    }
    Ok(())
}
