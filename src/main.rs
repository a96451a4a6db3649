#![forbid(unsafe_code)]

//! lazarus CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_app;

fn main() {
    let args = cli_app::Cli::parse();

    let directive = cli_app::log_directive(&args);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = cli_app::run(&args) {
        eprintln!("lazarus: {e}");
        std::process::exit(e.exit_code());
    }
}
