//! Simulates cosmic muons crossing two scintillator paddles and writes one
//! row per SiPM channel and event.

use anyhow::Context;
use clap::Parser;
use smallbox::config::Config;
use smallbox::ledger::{CsvSink, EventLedger};
use smallbox::run::Run;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// SiPM response simulation of a two paddle muon telescope
#[derive(Parser, Debug)]
#[command(name = "smallbox")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file. Defaults apply without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of events
    #[arg(short = 'n', long)]
    events: Option<u64>,

    /// Override the number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Override the output file (`-` for stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the random seed
    #[arg(short, long)]
    seed: Option<u64>,
}

fn init_tracing() {
    // Logs go to stderr so that rows can be written to stdout.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {path:?}"))?,
        None => Config::default(),
    };
    if let Some(events) = args.events {
        config.events = events;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(output) = args.output {
        config.output = (output.as_os_str() != "-").then_some(output);
    }
    config.validate().context("invalid configuration")?;

    let out: Box<dyn Write + Send> = match &config.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {path:?}"))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let schema = config.schema()?;
    let sink = CsvSink::new(out, &schema).context("failed to write the header")?;

    let sources = (0..config.workers)
        .map(|worker| config.source(worker))
        .collect::<Result<Vec<_>, _>>()?;

    let output = Run::builder()
        .events(config.events)
        .workers(config.workers)
        .synthesizer(config.synthesizer()?)
        .sensors(config.sensor_map()?)
        .ledger(EventLedger::new(schema, sink))
        .progress_interval(config.progress_interval)
        .build()
        .run(|worker| sources[worker].clone())?;

    for report in &output.workers {
        tracing::info!(
            worker = report.worker,
            events = report.events,
            photons = report.photons,
            filtered_steps = report.filtered_steps,
            muon_hits = report.muon_hits,
            "worker summary"
        );
    }
    match &config.output {
        Some(path) => tracing::info!(recorded = output.recorded, "events written to {path:?}"),
        None => tracing::info!(recorded = output.recorded, "events written to stdout"),
    }

    Ok(())
}
