#[macro_use]
extern crate log;

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use stratakv_router::run_router;

#[derive(Parser)]
#[command(name = "stratakv-router", about = "Consistency-aware query router node")]
struct Args {
    /// Path to the node configuration file
    #[arg(short, long, default_value = "res/router.yaml")]
    config: PathBuf,
}

/// Helper to print top-level errors through [log::error]
#[quit::main]
fn main() {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    std::env::set_var("RUST_LOG", level.clone());

    pretty_env_logger::formatted_builder()
        .parse_filters(&level)
        .filter_module("polling", LevelFilter::Off)
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    match run_router(&args.config) {
        Ok(_) => {}
        Err(e) => {
            error!("{e}");
            quit::with_code(e.err().code() as i32);
        }
    }
}
