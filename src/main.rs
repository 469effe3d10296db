use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use navcd::{Engine, EngineConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "C source indexing daemon")]
struct Args {
    /// Directory holding the persistent symbol store
    #[arg(long = "db", default_value = ".navc_dbsymbols")]
    db: PathBuf,

    /// Number of parser workers
    #[arg(long = "numThreads", default_value_t = num_cpus::get())]
    num_threads: usize,

    /// Remove the symbol store before starting
    #[arg(long = "resetDB")]
    reset_db: bool,

    /// Unix socket queries are served on
    #[arg(long, default_value = ".navc.sock")]
    socket: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Prefix of a system include tree whose indexed headers are re-checked
    /// instead of dropped when a walk no longer reports them (repeatable)
    #[arg(long = "sys-include-prefix")]
    sys_include_prefixes: Vec<String>,

    /// Log and discard parses that lost a scheduling race instead of
    /// aborting
    #[arg(long)]
    tolerate_stale_parses: bool,

    /// Directories to index (default: current directory)
    #[arg(value_name = "ROOT")]
    roots: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting navcd v{}", env!("CARGO_PKG_VERSION"));

    let roots = if args.roots.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.roots.clone()
    };
    for root in &roots {
        if !root.is_dir() {
            error!("index root {} is not a directory", root.display());
            std::process::exit(1);
        }
    }

    if args.reset_db {
        match std::fs::remove_dir_all(&args.db) {
            Ok(()) => info!("removed existing store at {}", args.db.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                error!("cannot reset store at {}: {err}", args.db.display());
                std::process::exit(1);
            }
        }
    }

    let sys_include_prefixes = if args.sys_include_prefixes.is_empty() {
        vec!["/usr/include/".to_string(), "/usr/lib/".to_string()]
    } else {
        args.sys_include_prefixes.clone()
    };

    let config = EngineConfig {
        db_dir: args.db,
        socket_path: args.socket,
        roots,
        num_workers: args.num_threads.max(1),
        flush_interval: Duration::from_secs(10),
        sys_include_prefixes,
        tolerate_stale: args.tolerate_stale_parses,
    };

    if let Err(err) = Engine::run(config).await {
        error!("daemon error: {err:#}");
        std::process::exit(1);
    }

    info!("daemon exited");
    Ok(())
}
