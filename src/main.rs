mod cli;
mod util;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::process;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::util::format_bytes;

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(&args) {
        error!("decode failed: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let output_path = args.output_path();
    let start = Instant::now();

    let input = File::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?;
    let input_size = input.metadata().map(|m| m.len()).unwrap_or(0);
    let reader = BufReader::new(input);

    let output = File::create(&output_path)
        .with_context(|| format!("creating {}", output_path.display()))?;
    let writer = BufWriter::new(output);

    info!(
        input = %args.input.display(),
        output = %output_path.display(),
        size = %format_bytes(input_size),
        "starting decode"
    );

    let stats = dvr::decode(reader, &args.mak, writer)
        .with_context(|| format!("decoding {}", args.input.display()))?;

    info!(
        packets = stats.packets_out,
        written = %format_bytes(stats.bytes_out),
        duration = ?start.elapsed(),
        "decode complete"
    );
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
