//! pairlink producer
//!
//! Interactive front end: reads `send pair` / `quit` commands from stdin
//! and sends the requested pairs to the consumer.

use pairlink::config::{CliCommand, Config};
use pairlink::{logging, run_pairs};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn, Level};

fn print_help() {
    println!(
        r#"
pairlink-producer - Sends visible/thermal image pairs to a consumer

USAGE:
    pairlink-producer [OPTIONS]

OPTIONS:
    -c, --config <FILE>  TOML configuration file
    -h, --host <HOST>    Consumer host (default: 127.0.0.1)
    -p, --port <PORT>    Consumer port (default: 9000)
    -v, --version        Print version information
        --help           Print this help message

ENVIRONMENT:
    PAIRLINK_SERVER_IP     Overrides the consumer host
    PAIRLINK_SERVER_PORT   Overrides the consumer port
    RUST_LOG               Log filter (e.g. pairlink=debug)

COMMANDS:
    send pair    Prompts for pair names separated by spaces, e.g. "p1 p2 p3".
                 Each pair is read from <visible_folder>/<name>.jpg and
                 <thermal_folder>/<name>.jpg.
    quit         Exit
"#
    );
}

fn prompt(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{}", text)?;
    stdout.flush()
}

async fn next_line(lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<Option<String>> {
    Ok(lines.next_line().await?.map(|line| line.trim().to_string()))
}

async fn send_pairs(config: &Arc<Config>, pairs: Vec<String>) {
    let outcomes = run_pairs(Arc::clone(config), pairs).await;

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) => println!(
                "  {}: ok ({} result{})",
                outcome.pair,
                report.results.len(),
                if report.results.len() == 1 { "" } else { "s" }
            ),
            Err(e) => println!("  {}: failed: {}", outcome.pair, e),
        }
    }
    info!(
        succeeded = succeeded,
        failed = outcomes.len() - succeeded,
        "Batch finished"
    );
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
            println!("pairlink-producer version {}", pairlink::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    logging::init(Level::INFO, config.log_file.as_deref())?;
    info!(
        consumer = %config.server_address(),
        max_workers = config.max_workers,
        "pairlink producer v{}",
        pairlink::VERSION
    );

    let config = Arc::new(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt("Enter 'send pair' or 'quit': > ")?;
        let Some(command) = next_line(&mut lines).await? else {
            break;
        };

        match command.as_str() {
            "send pair" => {
                prompt("Pair names (space separated): ")?;
                let Some(names) = next_line(&mut lines).await? else {
                    break;
                };

                let pairs: Vec<String> = names.split_whitespace().map(String::from).collect();
                if pairs.is_empty() {
                    warn!("No pair names entered");
                    continue;
                }
                send_pairs(&config, pairs).await;
            }
            "quit" => break,
            "" => {}
            other => println!("Unknown command {:?}. Use 'send pair' or 'quit'.", other),
        }
    }

    info!("Producer exiting");
    Ok(())
}
