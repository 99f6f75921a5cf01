//! Workcraft administrative CLI
//!
//! Schema setup, enqueueing and inspection without writing a worker program.

use workcraft_core::cli;

#[tokio::main]
async fn main() {
    cli::init_tracing();

    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
