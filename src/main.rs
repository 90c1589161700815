//! CLI entry point for frog_daq.
//!
//! Headless control of the delay-stage/spectrometer rig:
//! - `scan` collects a spectrogram over the configured range and exports CSV
//! - `monitor` streams continuous spectra and prints a peak summary
//! - `home`, `position`, `set-t0` cover stage housekeeping
//! - `config` prints a configuration template
//!
//! `--mock` swaps in the simulated devices, which is enough to exercise the
//! whole acquisition path on a machine with no hardware attached.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use frog_daq::calibration::TimeZeroStore;
use frog_daq::config::{FrogConfig, SpectrometerKind, StageKind};
use frog_daq::coordinator::{CoordinatorOptions, FrogCoordinator};
use frog_daq::hardware::connect::connect_devices;
use frog_daq::messages::FrogEvent;
use frog_daq::scan_range::ScanRange;
use frog_daq::stage::DelayStage;

#[derive(Parser)]
#[command(name = "frog-daq")]
#[command(about = "Delay-stage and spectrometer acquisition coordinator", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/frog_daq.toml")]
    config: PathBuf,

    /// Force simulated hardware regardless of configuration
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect a spectrogram over the configured range and export it as CSV
    Scan {
        /// Output file (defaults to <output_dir>/spectrogram_<timestamp>.csv)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Stream continuous spectra, printing a peak summary per sample
    Monitor {
        /// Number of samples to take before stopping
        #[arg(long, default_value = "10")]
        samples: usize,
    },

    /// Home the stage and wait for completion
    Home,

    /// Print the current stage position
    Position,

    /// Define the current stage position as zero delay
    SetT0,

    /// Print a configuration template
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        println!("{}", FrogConfig::sample()?);
        return Ok(());
    }

    let mut config = FrogConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.mock {
        config.stage.kind = StageKind::Mock;
        config.spectrometer.kind = SpectrometerKind::Mock;
    }
    frog_daq::logging::init_from_config(&config)?;

    let coordinator = build_coordinator(&config).await?;

    let result = match cli.command {
        Commands::Scan { output } => run_scan(&coordinator, &config, output).await,
        Commands::Monitor { samples } => run_monitor(&coordinator, samples).await,
        Commands::Home => run_home(&coordinator).await,
        Commands::Position => run_position(&coordinator).await,
        Commands::SetT0 => run_set_t0(&coordinator).await,
        Commands::Config => unreachable!("handled above"),
    };

    coordinator.shutdown().await?;
    result
}

async fn build_coordinator(config: &FrogConfig) -> Result<FrogCoordinator> {
    let (motor, spectrometer) = connect_devices(config).await?;

    let store = TimeZeroStore::at_default_location(&config.application.name)?;
    let stage = DelayStage::connect(motor, store, config.stage.edge_buffer_um).await?;

    let options = CoordinatorOptions {
        poll_interval: std::time::Duration::from_millis(config.stage.poll_interval_ms.max(1)),
        backlash_um: config.stage.backlash_um,
        max_jog_um: config
            .stage
            .max_jog_fs
            .map(frog_daq::units::delay_fs_to_distance_um),
    };

    Ok(FrogCoordinator::new(Arc::new(stage), spectrometer, options).await?)
}

async fn run_scan(
    coordinator: &FrogCoordinator,
    config: &FrogConfig,
    output: Option<PathBuf>,
) -> Result<()> {
    let range = ScanRange::from_fs(
        config.scan.start_fs,
        config.scan.end_fs,
        config.scan.step_fs,
    );
    let mut events = coordinator.subscribe();
    coordinator.start_scan(range).await?;

    loop {
        match events.recv().await {
            Ok(FrogEvent::ScanSample {
                step_index,
                delay_fs,
                ..
            }) => {
                info!(step = step_index, delay_fs, "collected scan point");
            }
            Ok(FrogEvent::ScanFinished { error: None }) => break,
            Ok(FrogEvent::ScanFinished { error: Some(kind) }) => {
                warn!(%kind, "scan terminated early, keeping partial data");
                break;
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    let Some(spectrogram) = coordinator.spectrogram().await else {
        anyhow::bail!("no spectrogram was collected");
    };
    info!(rows = spectrogram.len(), "scan data assembled");

    #[cfg(feature = "storage_csv")]
    {
        let path = match output {
            Some(path) => path,
            None => {
                std::fs::create_dir_all(&config.storage.output_dir)?;
                config.storage.output_dir.join(format!(
                    "spectrogram_{}.csv",
                    chrono::Local::now().format("%Y%m%d_%H%M%S")
                ))
            }
        };
        spectrogram.save_csv(&path)?;
        println!("spectrogram written to {}", path.display());
    }
    #[cfg(not(feature = "storage_csv"))]
    {
        let _ = output;
        println!(
            "collected {} rows (rebuild with --features storage_csv to export)",
            spectrogram.len()
        );
    }

    Ok(())
}

async fn run_monitor(coordinator: &FrogCoordinator, samples: usize) -> Result<()> {
    let mut events = coordinator.subscribe();
    coordinator.start_continuous_spectrum().await?;

    let mut seen = 0usize;
    while seen < samples {
        match events.recv().await {
            Ok(FrogEvent::SpectrumSample(spectrum)) => {
                seen += 1;
                if let Some((idx, peak)) = spectrum
                    .intensities
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                {
                    println!(
                        "sample {seen}: peak {:.1} counts at {:.1} nm",
                        peak, spectrum.wavelengths[idx]
                    );
                }
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    coordinator.stop_continuous_spectrum().await?;
    Ok(())
}

async fn run_home(coordinator: &FrogCoordinator) -> Result<()> {
    let mut events = coordinator.subscribe();
    coordinator.home().await?;

    loop {
        match events.recv().await {
            Ok(FrogEvent::MotionFinished { position_um, error }) => {
                match error {
                    None => println!("homed, stage at {position_um:.3} um"),
                    Some(kind) => anyhow::bail!("homing failed: {kind}"),
                }
                break;
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

async fn run_position(coordinator: &FrogCoordinator) -> Result<()> {
    let position_um = coordinator.stage().position_um().await?;
    let delay_fs = coordinator.stage().delay_at_um(position_um).await;
    let t0_um = coordinator.stage().t0_um().await;
    println!(
        "{}",
        serde_json::json!({
            "position_um": position_um,
            "delay_fs": delay_fs,
            "t0_um": t0_um,
        })
    );
    Ok(())
}

async fn run_set_t0(coordinator: &FrogCoordinator) -> Result<()> {
    let t0_um = coordinator.set_t0().await?;
    println!("T0 set to {t0_um:.3} um");
    Ok(())
}
