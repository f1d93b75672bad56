use std::{io, path::PathBuf, process};

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "squashdelta",
    about = "Generate a compact binary delta between two SquashFS 4.0 images"
)]
struct Cli {
    /// Image the recipient already holds
    source: PathBuf,
    /// Image the recipient wants
    target: PathBuf,
    /// Where to write the patch
    patch: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = squashdelta::generate_delta(&cli.source, &cli.target, &cli.patch) {
        eprintln!("squashdelta: {err}");
        process::exit(1);
    }
}
