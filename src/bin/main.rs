use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use resolver_bridge::bridge::protocol::AuthEpoch;
use resolver_bridge::config::{load_default_settings, load_settings};
use resolver_bridge::peer::{PeerOptions, run_peer};
use resolver_bridge::{BridgeResult, BridgeSettings, Operation, ProcessSupervisor, Session};

/// Controller-side bridge to a resolver subprocess
#[derive(Parser)]
#[command(name = "resolver-bridge")]
#[command(version)]
#[command(about = "Controller-side bridge to a resolver subprocess")]
struct Cli {
    /// Settings file (default: $RESOLVER_BRIDGE_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reference resolver peer against a listening controller
    Peer {
        /// Controller port to connect back to
        #[arg(long)]
        port: u16,

        /// Authentication value to present in the handshake
        #[arg(long)]
        auth: u64,

        /// Payload to answer with a non-critical failure (repeatable)
        #[arg(long = "fail")]
        fail: Vec<String>,

        /// Payload to answer with a critical failure (repeatable)
        #[arg(long = "critical")]
        critical: Vec<String>,

        /// Disconnect after this many responses
        #[arg(long)]
        exit_after: Option<u64>,

        /// Simulated engine time per request in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Launch the configured resolver and send no-op requests
    Ping {
        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

fn settings(config: Option<PathBuf>) -> BridgeResult<BridgeSettings> {
    match config {
        Some(path) => load_settings(&path),
        None => load_default_settings(),
    }
}

async fn ping(settings: BridgeSettings, count: u32) -> BridgeResult<()> {
    let supervisor = Arc::new(ProcessSupervisor::from_settings(&settings.subprocess)?);
    let session = Session::launch(settings, supervisor).await?;

    let mut outcome = Ok(());
    for _ in 0..count {
        let request = session.request(Operation::NoOp);
        let id = request.id;
        match session.send_sync_request(request).await {
            Ok(value) => println!("{}: {}", id, value),
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    session.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Peer {
            port,
            auth,
            fail,
            critical,
            exit_after,
            delay_ms,
        } => {
            let mut options = PeerOptions::new(port, AuthEpoch::from_raw(auth));
            options.fail_payloads = fail.into_iter().collect();
            options.critical_payloads = critical.into_iter().collect();
            options.exit_after = exit_after;
            options.delay = Duration::from_millis(delay_ms);
            run_peer(options).await.map(|summary| {
                eprintln!(
                    "Peer answered {} requests ({} failed)",
                    summary.answered, summary.failed
                );
            })
        }
        Commands::Ping { count } => match settings(cli.config) {
            Ok(settings) => ping(settings, count).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
