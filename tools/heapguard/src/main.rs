use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod config;
mod logging;
mod ops;

use config::Settings;

#[derive(Parser, Debug)]
#[command(name = "heapguard", version)]
#[command(
    about = "Size a JVM from its container memory limit, launch it, and ship diagnostics when it runs out of memory",
    long_about = None
)]
struct Cli {
    /// Print the computed runtime command line instead of exec'ing it.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log level (error, warn, info, debug, trace). `RUST_LOG` takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(flatten)]
    settings: Settings,

    /// Without a subcommand, compute the memory budget and exec the runtime.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture thread/heap dumps from <PID>, upload them, then kill it.
    ///
    /// Registered as the runtime's OnOutOfMemoryError hook; not meant to be run by hand.
    #[command(name = "oom")]
    Oom {
        #[arg(value_parser = clap::value_parser!(i32).range(1..))]
        pid: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Launch { dry_run: bool },
    CollectDump(i32),
}

impl Cli {
    fn mode(&self) -> Mode {
        match self.command {
            None => Mode::Launch {
                dry_run: self.dry_run,
            },
            Some(Command::Oom { pid }) => Mode::CollectDump(pid),
        }
    }
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        // Rust ignores SIGPIPE by default, which turns `heapguard --dry-run | head` into a
        // noisy panic. Restoring the default makes the process exit quietly.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.mode() {
        Mode::Launch { dry_run } => ops::launch::run(&cli.settings, dry_run).context("launch")?,
        Mode::CollectDump(pid) => {
            // Triggered mode always exits 0; outcomes are in the log.
            ops::oom::run(&cli.settings, pid);
        }
    }

    Ok(())
}
