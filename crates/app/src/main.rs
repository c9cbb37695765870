use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bites_core::instrument::{self, Instrument, InstrumentKind};
use bites_core::{
    ConfigStore, LogTransport, MonotonicClock, SharedClock, SimulatedHardware, System,
    SystemConfig,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod performance;

use performance::Performance;

const DEFAULT_CONFIG: &str = "bites.json";

/// Time between scripted strikes (120 BPM).
const BEAT: Duration = Duration::from_millis(500);

/// How long a strike is held before release.
const HOLD: Duration = Duration::from_millis(60);

fn main() -> bites_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            instrument,
            seconds,
            calibrate,
        } => run(&config, instrument, seconds, calibrate),
        Commands::Calibrate { config, save } => calibrate(&config, save),
        Commands::InitConfig { output, instrument } => init_config(&output, instrument),
    }
}

fn run(
    config_path: &Path,
    kind: Option<InstrumentKind>,
    seconds: u64,
    calibrate_first: bool,
) -> bites_core::Result<()> {
    let mut config = ConfigStore::new(config_path).load()?;
    if let Some(kind) = kind {
        config.instrument.kind = kind;
    }
    tracing::info!(instrument = %config.instrument.kind, seconds, "starting scripted performance");

    let layout = instrument::create(
        config.instrument.kind,
        config.instrument.track,
        config.instrument.keys,
    )
    .channel_layout();
    let hardware = SimulatedHardware::new();
    let mut performance = Performance::new(hardware.handle(), layout);

    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let mut system = System::new(config, Box::new(hardware), clock)?
        .with_transport(Box::new(LogTransport::new()));
    if calibrate_first {
        if let Err(err) = system.calibrate() {
            tracing::warn!(error = %err, "calibration incomplete, starting anyway");
        }
    }
    system.start()?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        performance.strike();
        thread::sleep(HOLD);
        performance.release();
        thread::sleep(BEAT - HOLD);
    }

    system.shutdown();
    tracing::info!(
        beats = performance.beats(),
        uptime_ms = system.uptime().as_millis() as u64,
        completed_polls = system.table().completed_polls(),
        skipped_polls = system.table().skipped_polls(),
        "performance finished"
    );
    if let Some(report) = system.health() {
        tracing::info!(healthy = report.is_healthy(), ?report, "last health check");
    }
    Ok(())
}

fn calibrate(config_path: &Path, save: bool) -> bites_core::Result<()> {
    let store = ConfigStore::new(config_path);
    let config = store.load()?;
    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let mut system = System::new(config.clone(), Box::new(SimulatedHardware::new()), clock)?;

    if let Err(err) = system.calibrate() {
        tracing::warn!(error = %err, "some channels failed to calibrate");
    }
    for descriptor in system.table().descriptors() {
        tracing::info!(
            channel = descriptor.channel_id,
            technology = %descriptor.technology,
            baseline = descriptor.baseline,
            threshold = descriptor.threshold,
            "calibrated"
        );
    }

    if save {
        let mut config = config;
        ConfigStore::capture_calibration(&mut config, system.table());
        store.save(&config)?;
    }
    Ok(())
}

fn init_config(output: &Path, kind: Option<InstrumentKind>) -> bites_core::Result<()> {
    let config = kind.map_or_else(SystemConfig::default, SystemConfig::for_instrument);
    ConfigStore::new(output).save(&config)?;
    tracing::info!(?output, instrument = %config.instrument.kind, "default configuration written");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "B.I.T.E.S wearable instrument runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the instrument against simulated hardware with a scripted performance.
    Run {
        /// Configuration file; defaults apply if it does not exist.
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Overrides the configured instrument (bass, guitar, keyboard, drums).
        #[arg(short, long)]
        instrument: Option<InstrumentKind>,
        /// How long to play for.
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
        /// Calibrate every channel before starting.
        #[arg(long)]
        calibrate: bool,
    },
    /// Calibrate every channel and report the results.
    Calibrate {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Write the captured calibration back to the configuration file.
        #[arg(long)]
        save: bool,
    },
    /// Write a default configuration file.
    InitConfig {
        /// Where to write the configuration.
        output: PathBuf,
        #[arg(short, long)]
        instrument: Option<InstrumentKind>,
    },
}
