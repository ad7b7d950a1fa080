use crate::{Args, DecompileArgs};

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};

use sbp_rs::{
    decompile_profile, DecodedProfile, DecompileOptions, FilterCatalog,
    ModifierCatalog,
};

pub fn decompile(args: &Args, decompile_args: &DecompileArgs) -> Result<()> {
    let sb_ops = read_operations(&decompile_args.operations)?;
    let filters =
        FilterCatalog::from_json(&read_to_string(&decompile_args.filters)?)?;
    let modifiers = ModifierCatalog::from_json(&read_to_string(
        &decompile_args.modifiers,
    )?)?;

    let bytes = fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let mut input = Cursor::new(bytes);
    let profile =
        DecodedProfile::read(&mut input, &sb_ops, &filters, &modifiers)?;

    let options = DecompileOptions {
        operations: decompile_args.only.clone(),
        ..Default::default()
    };
    let output = decompile_profile(&profile, &sb_ops, &options)?;

    // only written after the whole profile decompiled
    fs::write(&decompile_args.output, output).with_context(|| {
        format!("writing {}", decompile_args.output.display())
    })?;
    Ok(())
}

/// One operation name per line; blank lines are skipped. Order is
/// significant, it mirrors the dispatch table.
fn read_operations(path: &Path) -> Result<Vec<String>> {
    Ok(read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))
}
