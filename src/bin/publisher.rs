use std::{path::PathBuf, process::ExitCode};
use clap::Parser;
use sruth::{NodeConfig, SourceNode};

/// Publishes an archive tree: serves every file below the root and
/// announces new drops to subscribers.
#[derive(Parser)]
#[command(name = "publisher")]
struct Args {
    /// Root directory of the archive to publish.
    root: PathBuf,

    /// First of the three consecutive server ports.
    #[arg(long, default_value_t = 3880)]
    port: u16,

    /// Tracker port (0 picks a free one).
    #[arg(long, default_value_t = 0)]
    tracker_port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };
    if !args.root.is_dir() {
        eprintln!("not a directory: {}", args.root.display());
        return ExitCode::from(2);
    }

    let mut config = NodeConfig::with_root(&args.root);
    config.base_port = args.port;
    config.tracker_port = args.tracker_port;

    let node = match SourceNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("publisher failed to start: {}", e);
            return ExitCode::from(3);
        }
    };

    // Subscribers are told this port out of band.
    println!("{}", node.tracker_addr().port());

    tokio::signal::ctrl_c().await.ok();
    node.shutdown();
    ExitCode::SUCCESS
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("SRUTH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
