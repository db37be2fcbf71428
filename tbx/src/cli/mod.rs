mod list;
mod listen;
mod probe;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hidapi::HidApi;
use list::ListCommand;
use listen::ListenCommand;
use probe::ProbeCommand;
use testbox::{channel::Channel, feature::FeatureRegistry, settings::Settings};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::hidapi_impl;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Read the device selection, timeouts and queue sizes from a TOML file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// Log more details to stderr (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        match &self.config {
            Some(path) => Settings::load(path)
                .with_context(|| format!("could not load {}", path.display())),
            None => Ok(Settings::default()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    List(ListCommand),
    Probe(ProbeCommand),
    Listen(ListenCommand),
}

/// Opens the channel selected by the settings.
fn open_channel(settings: &Settings) -> Result<Arc<dyn Channel>> {
    let api = HidApi::new().context("could not initialize hidapi")?;
    let registry = Arc::new(FeatureRegistry::with_defaults()?);

    hidapi_impl::open(&api, settings, registry)
}

/// Parses a 16-bit value written in hex, with or without a `0x` prefix.
fn parse_hex_u16(src: &str) -> Result<u16, String> {
    let digits = src.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|err| format!("invalid hex value {src:?}: {err}"))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();
    init_logging(cli.verbose);

    let settings = cli.settings()?;
    match &cli.command {
        Commands::List(cmd) => cmd.execute(&cli, &settings),
        Commands::Probe(cmd) => cmd.execute(&cli, &settings),
        Commands::Listen(cmd) => cmd.execute(&cli, &settings),
    }
}
