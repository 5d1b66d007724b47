use anyhow::Result;
use clap::Parser;
use tsh_rs_core::cli::Args;

fn main() -> Result<()> {
    let args = Args::parse();
    tsh_rs_core::run_cli(&args)
}
