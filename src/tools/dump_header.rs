use crate::Args;

use std::fs::File;
use std::io::BufReader;

use anyhow::Result;

use sbp_rs::ProfileHeader;

pub fn dump_header(args: &Args) -> Result<()> {
    let mut input = BufReader::new(File::open(&args.input)?);
    let header = ProfileHeader::read(&mut input)?;
    println!("type:               {:#06x}", header.profile_type);
    println!("operation nodes:    {}", header.op_nodes_count);
    println!("operations:         {}", header.sb_ops_count);
    println!("global variables:   {}", header.vars_count);
    println!("regexes:            {}", header.regex_count);
    println!("regex table:        {:#x}", header.regex_table_offset());
    println!("vars table:         {:#x}", header.vars_offset());
    println!("dispatch table:     {:#x}", header.op_table_offset());
    println!("node array:         {:#x}", header.operation_nodes_offset());
    println!("indirect pool base: {:#x}", header.base_addr());
    Ok(())
}
