use std::{path::PathBuf, process::ExitCode};
use clap::Parser;
use sruth::{NodeConfig, SinkNode, Subscription};

/// Mirrors a filtered view of a published archive into a local
/// directory, serving fetched content onward to other subscribers.
#[derive(Parser)]
#[command(name = "subscriber")]
struct Args {
    /// Root directory of the local mirror.
    root: PathBuf,

    /// Subscription spec: `trackerHost:port/pattern`. Omitting the
    /// pattern mirrors everything.
    subscription: String,

    /// First of the three consecutive server ports (0 picks freely).
    #[arg(long, default_value_t = 0)]
    port: u16,
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
    let subscription = match Subscription::parse(&args.subscription) {
        Ok(subscription) => subscription,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(3);
        }
    };

    let mut config = NodeConfig::with_root(&args.root);
    config.base_port = args.port;

    let mut node = match SinkNode::start(config, subscription).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("subscriber failed to start: {}", e);
            return ExitCode::from(4);
        }
    };

    tokio::select! {
        // Bounded subscriptions exit once fully mirrored.
        _ = node.wait_done() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    node.shutdown();
    ExitCode::SUCCESS
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("SRUTH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
