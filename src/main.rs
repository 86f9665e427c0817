//! daqlink command line entry point
//!
//! ```bash
//! daqlink ports
//! daqlink acquire --seconds 10 --config bench.txt
//! daqlink acquire --seconds 2 --simulate
//! daqlink inspect data_3.txt
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daqlink::backend::{SerialChannel, SerialLink, SimulatedBus};
use daqlink::config::{self, AcquisitionConfig};
use daqlink::session;
use daqlink::{AcquisitionController, AcquisitionEvent, AppSettings, EventReceiver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "daqlink")]
#[command(about = "Serial multi-instrument data acquisition", long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports and whether they are free
    Ports,

    /// Connect, stream for a while, then save the session
    Acquire {
        /// Acquisition time in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Device configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use simulated instruments matching the configuration
        #[arg(long)]
        simulate: bool,

        /// Do not save the captured session
        #[arg(long)]
        no_save: bool,
    },

    /// Print a summary of a saved session
    Inspect {
        /// Session file
        file: PathBuf,
    },
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,daqlink=debug"))
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, "daqlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter()))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref())?;

    let settings = AppSettings::load_or_default(cli.settings.as_deref());

    match cli.command {
        Commands::Ports => list_ports(&settings),
        Commands::Acquire {
            seconds,
            config,
            simulate,
            no_save,
        } => acquire(settings, seconds, config, simulate, no_save),
        Commands::Inspect { file } => inspect(&file),
    }
}

fn list_ports(settings: &AppSettings) -> Result<()> {
    let ports = SerialChannel::try_available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    let free = SerialChannel::free_ports(settings.serial.baud_rate);
    for port in ports {
        let state = if free.contains(&port.port) {
            "free"
        } else {
            "busy"
        };
        let marker = if port.matches_signature(&settings.serial.port_signature) {
            "*"
        } else {
            " "
        };
        println!("{} {:<5} {}", marker, state, port);
    }
    println!("(* matches signature {:?})", settings.serial.port_signature);
    Ok(())
}

/// Attach one simulated instrument per configured device
fn simulated_bus(config: &AcquisitionConfig) -> SimulatedBus {
    let bus = SimulatedBus::new();
    for (index, device) in config.devices.iter().enumerate() {
        bus.add_instrument(&format!("/sim/ttyACM{}", index), device.id, device.nodes.len());
    }
    bus
}

fn acquire(
    mut settings: AppSettings,
    seconds: u64,
    config_path: Option<PathBuf>,
    simulate: bool,
    no_save: bool,
) -> Result<()> {
    if let Some(path) = config_path {
        settings.acquisition.config_path = path;
    }
    let config = config::load_config(&settings.acquisition.config_path)?;

    let (mut controller, events) = if simulate {
        let bus = simulated_bus(&config);
        tracing::info!("Using simulated instruments: {:?}", bus);
        AcquisitionController::with_link_factory(
            settings,
            Arc::new(move || Box::new(bus.link()) as Box<dyn SerialLink>),
        )
    } else {
        AcquisitionController::new(settings)
    };

    controller.connect_with_config(config)?;
    controller.start_devices()?;
    tracing::info!(
        "Acquiring for {} s at {} ms",
        seconds,
        controller.sampling_period()
    );

    watch_events(&events, Duration::from_secs(seconds));

    controller.disconnect_from_devices()?;
    let stats = controller.stats();
    tracing::info!(
        "{} packets ingested, {} gaps, {} read errors, {} dropped events",
        stats.packets_ingested,
        stats.packet_gaps,
        stats.read_errors,
        stats.dropped_events
    );

    for device in controller.snapshot() {
        println!(
            "device {} ({}): {} samples",
            device.id,
            device.name,
            device.total_samples()
        );
    }

    if !no_save {
        if let Some(path) = controller.save()? {
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}

fn watch_events(events: &EventReceiver, duration: Duration) {
    let deadline = Instant::now() + duration;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(remaining) {
            Some(AcquisitionEvent::NewData(updates)) => {
                let fresh: usize = updates.iter().map(|d| d.new_samples()).sum();
                tracing::trace!("{} new samples", fresh);
            }
            Some(AcquisitionEvent::PacketGap {
                device_id,
                expected,
                received,
            }) => {
                tracing::warn!(
                    "Device {}: expected packet {}, got {}",
                    device_id,
                    expected,
                    received
                );
            }
            Some(AcquisitionEvent::ReadError { device_id, error }) => {
                tracing::error!("Device {}: {}", device_id, error);
            }
            Some(AcquisitionEvent::ConnectionStatus(status)) => {
                tracing::info!("Status: {}", status);
            }
            Some(AcquisitionEvent::DevicesLoaded(devices)) => {
                tracing::info!("{} device(s) loaded", devices.len());
            }
            None => {}
        }
    }
}

fn inspect(file: &Path) -> Result<()> {
    let session = session::load_session(file)?;
    println!("{}", file.display());
    println!("  sampling period: {} ms", session.sampling_period_ms);
    for device in &session.devices {
        println!("  device {} ({})", device.id, device.name);
        for node in &device.nodes {
            match (node.samples().iter().min(), node.samples().iter().max()) {
                (Some(min), Some(max)) => println!(
                    "    {:<16} {:>8} samples  min {:>10}  max {:>10}",
                    node.name(),
                    node.len(),
                    min,
                    max
                ),
                _ => println!("    {:<16} {:>8} samples", node.name(), 0),
            }
        }
    }
    println!("  total: {} samples", session.total_samples());
    Ok(())
}
