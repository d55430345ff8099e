//! pairlink consumer
//!
//! Listens for producers, stores received pairs and streams the processed
//! results back.

use pairlink::config::{CliCommand, Config};
use pairlink::processing::{CommandProcessor, NoopProcessor, PairProcessor};
use pairlink::{logging, Server};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn, Level};

fn print_help() {
    println!(
        r#"
pairlink-consumer - Receives image pairs and returns processed results

USAGE:
    pairlink-consumer [OPTIONS]

OPTIONS:
    -c, --config <FILE>  TOML configuration file
    -h, --host <HOST>    Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>    Port to listen on (default: 9000)
    -v, --version        Print version information
        --help           Print this help message

ENVIRONMENT:
    PAIRLINK_SERVER_IP     Overrides the bind host
    PAIRLINK_SERVER_PORT   Overrides the bind port
    RUST_LOG               Log filter (e.g. pairlink=debug)

EXAMPLES:
    pairlink-consumer                         # Start on 127.0.0.1:9000
    pairlink-consumer --host 0.0.0.0          # Listen on all interfaces
    pairlink-consumer -c consumer.toml        # Load settings from a file
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
pairlink v{} - consumer
──────────────────────────────────────────────────────────────
Listening on   {}
Received into  {}
Outputs from   {}

Use Ctrl+C to shutdown.
"#,
        pairlink::VERSION,
        config.server_address(),
        config.received_folder.display(),
        config.output_folder.display(),
    );
}

fn build_processor(config: &Config) -> Arc<dyn PairProcessor> {
    match &config.processor {
        Some(processor) => {
            info!(program = %processor.program, "Using external processor");
            Arc::new(CommandProcessor::from_config(
                processor,
                config.output_folder.clone(),
            ))
        }
        None => {
            warn!("No processor configured, pairs will be stored without results");
            Arc::new(NoopProcessor)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = match Config::from_args(std::env::args().skip(1)) {
        Ok(CliCommand::Run(config)) => config,
        Ok(CliCommand::Help) => {
            print_help();
            return Ok(());
        }
        Ok(CliCommand::Version) => {
            println!("pairlink-consumer version {}", pairlink::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    logging::init(Level::INFO, config.log_file.as_deref())?;
    print_banner(&config);

    let config = Arc::new(config);
    let processor = build_processor(&config);
    let server = Server::bind(Arc::clone(&config), processor).await?;
    let stats = server.stats();

    tokio::select! {
        _ = server.run() => {}
        result = signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, stopping consumer...");
        }
    }

    info!(
        sessions = stats.sessions_accepted.load(Ordering::Relaxed),
        pairs = stats.pairs_processed.load(Ordering::Relaxed),
        "Consumer shutdown complete"
    );
    Ok(())
}
