//! Preprocess a generated config file
//!
//! Applies the directive rewrites the apply flow performs before its
//! diff, currently the remap `##OVERRIDE##` handling, and prints the
//! result on stdout. Useful for inspecting what apply would install.

use agent_lib::reconcile::process_remap_overrides;
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cache-agent-preprocess",
    version,
    about = "Preprocess a generated config file and print the result"
)]
struct Cli {
    /// File to preprocess; stdin when omitted
    file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let content = match &cli.file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("reading {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => {
            let mut buf = String::new();
            if let Err(e) = std::io::stdin().read_to_string(&mut buf) {
                eprintln!("reading stdin: {e}");
                std::process::exit(1);
            }
            buf
        }
    };

    match process_remap_overrides(&content) {
        Ok(out) => print!("{out}"),
        Err(e) => {
            eprintln!("preprocessing: {e}");
            std::process::exit(1);
        }
    }
}
