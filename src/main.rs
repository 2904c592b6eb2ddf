use anyhow::Result;

use cardreader_core::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
