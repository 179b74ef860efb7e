//! Verify plugin references in a remap or plugin config
//!
//! Exit code is the number of references that failed to verify; zero means
//! every named plugin shared object and plugin parameter file is present
//! or about to be written.

use agent_lib::reconcile::{RefsChecker, RefsConfig};
use clap::Parser;
use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "cache-agent-check-refs",
    version,
    about = "Verify plugin references in a config file from a path or stdin"
)]
struct Cli {
    /// Config file to check; stdin when omitted
    file: Option<PathBuf>,

    /// Comma-separated names of files about to be written this run
    #[arg(long = "files-adding", default_value = "")]
    files_adding: String,

    /// Trafficserver plugin directory
    #[arg(long = "ts-plugin-dir", default_value = "/opt/trafficserver/libexec/trafficserver")]
    ts_plugin_dir: PathBuf,

    /// Trafficserver config directory
    #[arg(long = "ts-config-dir", default_value = "/opt/trafficserver/etc/trafficserver")]
    ts_config_dir: PathBuf,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

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

    let files_adding: HashSet<String> = cli
        .files_adding
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let mut checker = RefsChecker::new(RefsConfig {
        plugin_dir: cli.ts_plugin_dir,
        config_dir: cli.ts_config_dir,
    });
    let failures = checker.check_config(&content, &files_adding);
    if failures > 0 {
        eprintln!("there are {failures} plugin references that could not be verified");
        std::process::exit(failures.min(i32::MAX as usize) as i32);
    }
    eprintln!("all configured plugin references have been verified");
}
