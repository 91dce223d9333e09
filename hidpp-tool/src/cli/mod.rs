mod info;
mod monitor;
mod probe;

use std::path::Path;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hidpp_dispatch::transport::hidraw::Hidraw;
use info::InfoCommand;
use monitor::MonitorCommand;
use probe::ProbeCommand;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// Log more details to stderr (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    Info(InfoCommand),
    Probe(ProbeCommand),
    Monitor(MonitorCommand),
}

pub fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Info(cmd) => cmd.execute(&cli),
        Commands::Probe(cmd) => cmd.execute(&cli),
        Commands::Monitor(cmd) => cmd.execute(&cli),
    }
}

/// `RUST_LOG` takes precedence over the verbosity flags.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(format!("hidpp_dispatch={level},hidpp_tool={level}"))
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn open(path: &Path) -> Result<Hidraw> {
    Hidraw::open(path).with_context(|| format!("could not open {}", path.display()))
}
