//! edgeprobe — CDN edge endpoint prober.
//!
//! Usage:
//!   edgeprobe [--input init.csv] [--locations locations.json] [--limit 5]
//!             [--ip-policy any|v4-only|v6-only] [--no-tls] [--output pretty|json]

use clap::Parser;
use edgeprobe::cli::{self, Cli, OutputFmt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // RUST_LOG overrides; default keeps progress lines visible.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edgeprobe=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli::run(&cli).await {
        Ok(summary) => match cli.output {
            OutputFmt::Pretty => print!("{}", cli::format_pretty(&summary)),
            OutputFmt::Json => println!("{}", cli::format_json(&summary)),
        },
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
