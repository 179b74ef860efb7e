//! Decide the service transition a set of changed files requires
//!
//! Reads `{"changed_files": "<comma separated>", "installed_packages":
//! "<comma separated>"}` from stdin and prints one of `needs-restart`,
//! `needs-reload`, or `nothing` on stdout. The sentinel strings are a
//! versioned interface; callers exec this tool and parse the output.

use agent_lib::reconcile::{classify, ChangedPaths};
use clap::Parser;
use std::io::Read;

#[derive(Parser)]
#[command(
    name = "cache-agent-check-reload",
    version,
    about = "Decide whether changed files need a service restart, reload, or nothing",
    after_help = "Accepts json on stdin: {\"changed_files\": \"<comma separated list of files>\"}"
)]
struct Cli {}

fn main() {
    let _ = Cli::parse();

    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("error reading stdin: {e}");
        std::process::exit(1);
    }

    let changed: ChangedPaths = match serde_json::from_str(&input) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error reading json input: {e}");
            std::process::exit(1);
        }
    };

    let needs = classify(&changed.files(), &changed.packages());
    println!("{}", needs.as_str());
}
