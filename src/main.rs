use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use spate::{Config, Metainfo, Session, SessionError};

/// Download a torrent to a local directory.
#[derive(Debug, Parser)]
#[command(name = "spate", version, about)]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Destination directory for the downloaded file tree.
    #[arg(short, long, default_value = ".")]
    dest: PathBuf,

    /// Listen port for inbound peers; falls through the next eight ports
    /// when taken.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Maximum simultaneous peer connections.
    #[arg(long, default_value_t = 50)]
    max_peers: usize,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let meta = match Metainfo::load(&args.torrent) {
        Ok(meta) => meta,
        Err(e) => {
            eprintln!("spate: invalid torrent {}: {}", args.torrent.display(), e);
            return ExitCode::from(1);
        }
    };

    tracing::info!(
        name = %meta.name,
        pieces = meta.piece_count(),
        bytes = meta.total_length,
        "loaded torrent"
    );

    let config = Config {
        dest_dir: args.dest,
        listen_port: args.port,
        max_peers: args.max_peers,
        ..Config::default()
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("spate: failed to start runtime: {}", e);
            return ExitCode::from(3);
        }
    };

    match runtime.block_on(Session::new(config, meta).run()) {
        Ok(()) => {
            println!("download complete");
            ExitCode::SUCCESS
        }
        Err(SessionError::NoPeers) => {
            eprintln!("spate: no peers obtainable: every tracker tier failed");
            ExitCode::from(2)
        }
        Err(SessionError::Storage(e)) => {
            eprintln!("spate: storage failure: {}", e);
            ExitCode::from(3)
        }
        Err(SessionError::Interrupted) => {
            eprintln!("spate: interrupted");
            ExitCode::from(130)
        }
    }
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "spate=info",
        1 => "spate=debug",
        _ => "spate=trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
