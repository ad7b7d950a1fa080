mod decompile;
use decompile::decompile;
mod dump_header;
use dump_header::dump_header;
mod dump_nodes;
use dump_nodes::dump_nodes;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Reverse Apple binary sandbox profiles back into SBPL
#[derive(Clone, Debug, Parser)]
struct Args {
    /// compiled sandbox profile to read
    #[arg(short, long)]
    input: PathBuf,
    // operation to execute
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Decompile the profile into SBPL text
    Decompile(DecompileArgs),
    /// Print the header and the derived table layout
    DumpHeader,
    /// Print every operation node record
    DumpNodes,
}

/// Decompile a profile. The operation list and the filter/modifier
/// catalogs come from the sandbox runtime of the matching OS build.
#[derive(Clone, Debug, Parser)]
struct DecompileArgs {
    /// file naming one sandbox operation per line
    #[arg(long)]
    operations: PathBuf,
    /// filter catalog JSON
    #[arg(long)]
    filters: PathBuf,
    /// modifier catalog JSON
    #[arg(long)]
    modifiers: PathBuf,
    /// only decompile these operations
    #[arg(long = "filter", num_args = 1..)]
    only: Option<Vec<String>>,
    /// output filename
    #[arg(long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    match &args.operation {
        Operation::Decompile(decompile_args) => {
            decompile(&args, decompile_args)
        }
        Operation::DumpHeader => dump_header(&args),
        Operation::DumpNodes => dump_nodes(&args),
    }
}
