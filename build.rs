//! Renders the `slurmflow.1` manual page into `OUT_DIR` from the clap
//! definitions shared with the binary.

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

const MAN_PAGE: &str = "slurmflow.1";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(stdout, "cargo:rerun-if-changed={watched}")?;
    }

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let command = cli::Cli::command().version(env!("CARGO_PKG_VERSION"));
    let mut page = Vec::new();
    Man::new(command).render(&mut page)?;
    std::fs::write(out_dir.join(MAN_PAGE), page)?;
    Ok(())
}
