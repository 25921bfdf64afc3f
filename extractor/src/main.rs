mod app;
mod chain;
mod cursor;
mod engine;
mod fetch;
mod model;
mod sink;
mod streams;

use clap::{Parser, Subcommand};
use extractor_core::{telemetry, Config};
use model::TapState;
use sink::SingerWriter;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "ice-extractor")]
#[clap(about = "Incremental extractor for the ICE subgraphs", version)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[clap(long, global = true, env = "EXTRACTOR_CONFIG")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stream catalog
    Discover,

    /// Extract streams, resuming from a state file
    Run {
        /// State file from a previous run
        #[clap(long)]
        state: Option<PathBuf>,

        /// Stream to extract; repeat for several (default: all)
        #[clap(long = "stream")]
        streams: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        report_fatal(&e, &mut io::stderr());
        process::exit(1);
    }
}

/// Log through tracing once a subscriber is installed. Config failures
/// happen before that, so they go straight to `out`.
fn report_fatal(error: &anyhow::Error, out: &mut dyn Write) {
    if tracing::dispatcher::has_been_set() {
        error!(error = %error, "Fatal error");
    } else {
        let _ = writeln!(out, "Fatal error: {error:#}");
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    telemetry::init(&config.telemetry)?;

    match cli.command {
        Commands::Discover => {
            let catalog = streams::catalog(&streams::all());
            let mut out = io::stdout().lock();
            serde_json::to_writer_pretty(&mut out, &catalog)?;
            writeln!(out)?;
        }

        Commands::Run { state, streams: names } => {
            let selected = streams::select(&names)?;
            let mut tap_state = match &state {
                Some(path) => TapState::load(path)?,
                None => TapState::default(),
            };

            info!(
                streams = selected.len(),
                state = ?state,
                "Starting extraction"
            );

            let app = app::App::new(config)?;
            let mut writer = SingerWriter::new(BufWriter::new(io::stdout().lock()));
            let result = app.run(&selected, &mut tap_state, &mut writer).await;
            writer.into_inner().flush()?;
            result?;
        }
    }

    telemetry::shutdown();
    Ok(())
}
