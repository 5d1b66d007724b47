use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tsh-rs",
    about = "Compiles tsh scripts into the linked-block graph consumed by Scratch-compatible runtimes."
)]
pub struct Args {
    #[arg(value_name = "INPUT", required = true, help = "Unit source files; the first is the stage unless --stage is given.")]
    pub inputs: Vec<PathBuf>,

    #[arg(long, help = "Name (file stem) of the unit to compile as the stage.")]
    pub stage: Option<String>,

    #[arg(
        short,
        long,
        help = "Write the emitted block graph JSON here instead of stdout."
    )]
    pub output: Option<PathBuf>,

    #[arg(
        long,
        help = "Merge additional opcode definitions from a JSON catalog file."
    )]
    pub catalog: Option<PathBuf>,
}
