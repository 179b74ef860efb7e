//! Diff a generated config against the file on disk
//!
//! Comments and line endings are ignored, matching the audit logic used by
//! apply. Exit 0 when the files are semantically equal, 1 when they
//! differ.

use agent_lib::reconcile::files_differ;
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cache-agent-diff",
    version,
    about = "Semantically diff a generated config file against disk"
)]
struct Cli {
    /// Generated file; stdin when "-"
    generated: PathBuf,

    /// File on disk to compare against
    disk: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let generated = if cli.generated.as_os_str() == "-" {
        let mut buf = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
            eprintln!("reading stdin: {e}");
            std::process::exit(2);
        }
        buf
    } else {
        match std::fs::read(&cli.generated) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("reading {}: {e}", cli.generated.display());
                std::process::exit(2);
            }
        }
    };

    match files_differ(&generated, &cli.disk) {
        Ok(false) => {}
        Ok(true) => {
            let disk = std::fs::read_to_string(&cli.disk).unwrap_or_default();
            let generated = String::from_utf8_lossy(&generated);
            for line in agent_lib::reconcile::diff_lines(&generated, &disk) {
                println!("{line}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("diffing: {e}");
            std::process::exit(2);
        }
    }
}
