//! `cache-agent` dispatcher
//!
//! Thin wrapper over the subtool binaries: `cache-agent <cmd> ...` resolves
//! `cache-agent-<cmd>` on the PATH and execs it, inheriting arguments and
//! environment. The subtools remain directly invocable; this exists so
//! operators and cron entries have one front door.

use std::os::unix::process::CommandExt;
use std::process::Command;

const EXIT_NO_COMMAND: i32 = 1;
const EXIT_UNKNOWN_COMMAND: i32 = 2;
const EXIT_COMMAND_ERR: i32 = 3;

/// Every entry here must have a matching `cache-agent-<cmd>` bin target;
/// config generation has no standalone subtool, it lives inside apply.
const COMMANDS: &[(&str, &str)] = &[
    ("apply", "generate and apply configuration"),
    ("diff", "diff config files, ignoring comments"),
    ("preprocess", "preprocess generated config files"),
    ("request", "request Ops data"),
    ("update", "update a cache's queue and reval status in Ops"),
    ("check-refs", "verify plugin references in a config file"),
    ("check-reload", "decide the required service transition for changed files"),
];

fn usage() -> String {
    let mut s = String::from(
        "usage: cache-agent [--help]\n       <command> [<args>]\n\nFor the arguments of a command, see 'cache-agent <command> --help'.\n\nThese are the available commands:\n\n",
    );
    for (cmd, desc) in COMMANDS {
        s.push_str(&format!("  {cmd:<13} {desc}\n"));
    }
    s
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        None => {
            eprintln!("no command\n\n{}", usage());
            std::process::exit(EXIT_NO_COMMAND);
        }
        Some("--help") | Some("-h") => {
            println!("{}", usage());
            std::process::exit(0);
        }
        Some("--version") | Some("-V") => {
            println!("cache-agent {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Some(cmd) => {
            if !COMMANDS.iter().any(|(name, _)| *name == cmd) {
                eprintln!("unknown command '{cmd}'\n{}", usage());
                std::process::exit(EXIT_UNKNOWN_COMMAND);
            }
            let app = format!("cache-agent-{cmd}");
            // exec never returns on success; the subtool inherits our
            // arguments and environment
            let err = Command::new(&app).args(&args[2..]).exec();
            eprintln!("error executing sub-command '{app}': {err}");
            std::process::exit(EXIT_COMMAND_ERR);
        }
    }
}
