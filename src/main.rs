use beadsd::config::{self, WorkspacePaths};
use beadsd::daemon::{self, DaemonOptions};
use beadsd::error::{BeadsError, EXIT_FAILURE, EXIT_OK};
use beadsd::merge;
use beadsd::registry::{Registry, cleanup_stale_sockets};
use beadsd::rpc::client;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "beadsd", version, about = "Beads workspace daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workspace daemon in the foreground.
    Run {
        /// Workspace directory (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Explicit database path, overriding discovery.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Seconds between sync ticks.
        #[arg(long)]
        interval: Option<u64>,

        /// Commit and push the JSONL as part of each tick.
        #[arg(long)]
        auto_commit: bool,
    },

    /// 3-way JSONL merge driver for git (`beadsd merge %O %A %B`).
    ///
    /// Writes the merged result over the left file. Exits non-zero when
    /// conflict blocks were emitted, as git expects.
    Merge {
        base: PathBuf,
        left: PathBuf,
        right: PathBuf,
    },

    /// Probe the local workspace daemon and print its status.
    Status {
        /// Workspace directory (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// List daemons registered across workspaces, pruning dead entries.
    Registry {
        /// Also unlink socket files left behind by dead daemons.
        #[arg(long)]
        cleanup: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run {
            workspace,
            db,
            interval,
            auto_commit,
        } => run_daemon(DaemonOptions {
            workspace,
            db,
            interval_secs: interval,
            auto_commit: auto_commit.then_some(true),
        }),
        Commands::Merge { base, left, right } => run_merge(&base, &left, &right),
        Commands::Status { workspace } => run_status(workspace),
        Commands::Registry { cleanup } => run_registry(cleanup),
    };

    std::process::exit(exit_code);
}

fn run_daemon(options: DaemonOptions) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return EXIT_FAILURE;
        }
    };

    match runtime.block_on(daemon::run(options)) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            if e.is_lock_conflict() {
                // Non-alarming: another daemon owns this workspace.
                eprintln!("{e}");
            } else {
                eprintln!("daemon failed: {e}");
            }
            e.exit_code()
        }
    }
}

/// The merge driver runs without a daemon; stderr is its only channel.
fn run_merge(base: &PathBuf, left: &PathBuf, right: &PathBuf) -> i32 {
    init_stderr_logging();

    match merge::merge_files(base, left, right) {
        Ok((content, had_conflicts)) => {
            // git expects the result in place of the "ours" file.
            if let Err(e) = fs::write(left, content) {
                eprintln!("merge failed writing {}: {e}", left.display());
                return EXIT_FAILURE;
            }
            if had_conflicts {
                eprintln!(
                    "beadsd merge: conflicts written to {}; resolve before importing",
                    left.display()
                );
                return 1;
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("merge failed: {e}");
            EXIT_FAILURE
        }
    }
}

fn run_status(workspace: Option<PathBuf>) -> i32 {
    init_stderr_logging();

    let result = (|| -> beadsd::Result<i32> {
        let beads_dir = config::discover_beads_dir(workspace.as_deref())?;
        let paths = WorkspacePaths::resolve(&beads_dir, None)?;

        let runtime = tokio::runtime::Runtime::new().map_err(BeadsError::Io)?;
        let status = runtime.block_on(client::try_connect_with_timeout(
            &paths.socket_path,
            Duration::from_millis(500),
        ))?;

        match status {
            Some(status) => {
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok(EXIT_OK)
            }
            None => {
                eprintln!("no daemon running for {}", paths.workspace_root.display());
                Ok(EXIT_FAILURE)
            }
        }
    })();

    result.unwrap_or_else(|e| {
        eprintln!("{e}");
        e.exit_code()
    })
}

fn run_registry(cleanup: bool) -> i32 {
    init_stderr_logging();

    let result = (|| -> beadsd::Result<i32> {
        let registry = Registry::open_default()?;
        let runtime = tokio::runtime::Runtime::new().map_err(BeadsError::Io)?;
        let report = runtime.block_on(registry.list())?;

        if report.live.is_empty() {
            println!("no live daemons registered");
            // Legacy fallback: daemons predating the registry still leave a
            // well-known socket behind; a bounded walk finds them.
            let sockets = beadsd::registry::discover_sockets(&std::env::current_dir()?);
            for socket in sockets {
                println!("{}\t(unregistered socket)", socket.display());
            }
        }
        for record in &report.live {
            let liveness = if record.responsive {
                "ok"
            } else {
                "alive (unresponsive socket)"
            };
            println!(
                "{}\tpid {}\tv{}\t{}",
                record.entry.workspace_path.display(),
                record.entry.pid,
                record.entry.version,
                liveness
            );
        }

        if cleanup {
            let removed = cleanup_stale_sockets(&report.dead);
            println!("removed {removed} stale socket(s)");
        }

        Ok(EXIT_OK)
    })();

    result.unwrap_or_else(|e| {
        eprintln!("{e}");
        e.exit_code()
    })
}

fn init_stderr_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
