//! `itp-monitor` command-line entry point.
//!
//! ```bash
//! itp-monitor --config monitor.toml run --log-file logs/run.csv
//! itp-monitor emulate
//! RUST_LOG=debug itp-monitor check-config
//! ```
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itp_monitor::config::Settings;
use itp_monitor::controller::AcquisitionController;
use itp_monitor::core::ConnectionState;
use itp_monitor::data::CsvLogWriter;
use itp_monitor::emulator::{Emulator, EmulatorConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "itp-monitor", version, about = "SCUD/IPT telemetry monitor")]
struct Cli {
    /// TOML configuration file (defaults and ITPMON_* variables apply regardless)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect both links and poll until Ctrl-C
    Run {
        /// CSV file for poll rows, overriding `storage.log_file`
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Serve emulated SCUD and IPT links on the configured endpoints
    Emulate,
    /// Print the merged, validated configuration
    CheckConfig,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&settings.application.log_level, cli.json_logs);

    match cli.command {
        Command::Run {
            log_file,
            duration_secs,
        } => run(settings, log_file, duration_secs).await,
        Command::Emulate => emulate(settings).await,
        Command::CheckConfig => {
            let text = toml::to_string_pretty(&settings).context("Failed to render configuration")?;
            println!("{}", text);
            Ok(())
        }
    }
}

async fn run(settings: Settings, log_file: Option<PathBuf>, duration_secs: Option<u64>) -> Result<()> {
    let controller = AcquisitionController::from_settings(&settings);

    controller.events().error_occurred.subscribe(|event| eprintln!("{}", event));
    controller.events().state_changed.subscribe(|state| info!("Monitor is {}", state));

    if let Some(path) = log_file.or_else(|| settings.storage.log_file.clone()) {
        let writer = CsvLogWriter::open(&path, &settings.storage.channel_names)
            .with_context(|| format!("Failed to open log file '{}'", path.display()))?;
        controller.set_logger(Box::new(writer));
    }

    controller
        .connect(&settings.access_endpoint(), &settings.process_endpoint())
        .await
        .context("Failed to connect instrument links")?;
    controller.start().await?;
    info!(
        "Polling at {} Hz; press Ctrl-C to stop",
        settings.poll_frequency_hz()
    );

    let mut states = controller.events().state_changed.stream();
    let limit = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted");
        }
        _ = limit => info!("Run duration reached"),
        _ = links_dropped(&mut states) => warn!("Links dropped"),
    }

    if let Err(e) = controller.disconnect().await {
        error!("Disconnect finished with errors: {}", e);
    }
    // Hands back a flushed logger; dropping it closes the file.
    drop(controller.take_logger());

    let metrics = controller.metrics();
    info!(
        ticks = metrics.ticks,
        published = metrics.published,
        failed = metrics.failed,
        dropped = metrics.dropped,
        "Monitor stopped"
    );
    Ok(())
}

async fn emulate(settings: Settings) -> Result<()> {
    let emulator = Emulator::spawn(EmulatorConfig::from_settings(&settings))
        .await
        .context("Failed to start emulators")?;
    info!(
        "SCUD emulator on {}, IPT emulator on {}; press Ctrl-C to stop",
        emulator.access_endpoint(),
        emulator.process_endpoint()
    );
    tokio::signal::ctrl_c().await?;
    emulator.shutdown();
    Ok(())
}

/// Resolves once the controller reports `Disconnected` or its state channel closes.
async fn links_dropped(states: &mut broadcast::Receiver<ConnectionState>) {
    loop {
        match states.recv().await {
            Ok(ConnectionState::Disconnected) | Err(RecvError::Closed) => return,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!("State watcher lagged by {} events", missed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_lagged_state_stream_keeps_waiting() {
        let (tx, mut rx) = broadcast::channel(2);
        tx.send(ConnectionState::Connected).unwrap();
        tx.send(ConnectionState::Polling).unwrap();
        tx.send(ConnectionState::Connected).unwrap();

        assert!(timeout(Duration::from_millis(50), links_dropped(&mut rx))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disconnect_after_lag_resolves() {
        let (tx, mut rx) = broadcast::channel(2);
        tx.send(ConnectionState::Connected).unwrap();
        tx.send(ConnectionState::Polling).unwrap();
        tx.send(ConnectionState::Connected).unwrap();
        tx.send(ConnectionState::Disconnected).unwrap();

        assert!(timeout(Duration::from_millis(50), links_dropped(&mut rx))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_closed_stream_resolves() {
        let (tx, mut rx) = broadcast::channel::<ConnectionState>(2);
        drop(tx);
        assert!(timeout(Duration::from_millis(50), links_dropped(&mut rx))
            .await
            .is_ok());
    }
}
