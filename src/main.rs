//! ==============================================================================
//! main.rs - pisensor agent entry point
//! ==============================================================================
//!
//! purpose:
//!     reads a Raspberry Pi Sense HAT once per send interval and publishes the
//!     readings to the cloud, while the cloud can change the interval and the
//!     alert threshold, call direct methods and send messages back.
//!
//! responsibilities:
//!     - parse the command line, load agent.toml, initialize logging
//!     - open the device state file (pisensor.conf) and watch it for edits
//!     - connect the selected transport (or the loopback for --dry-run)
//!     - start the dispatcher, the local api and the control loop
//!     - stop everything on ctrl-c or on a fatal transport error, and say why
//!
//! relationships:
//!     - uses: config.rs (agent.toml), store.rs (pisensor.conf)
//!     - uses: hal.rs (sensors + display), transport/ (cloud)
//!     - runs: agent.rs (ControlLoop), dispatch.rs (Dispatcher), api.rs
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                        agent (this file)                     │
//!     │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//!     │  │ control loop │   │  dispatcher  │   │ local api (3000) │  │
//!     │  │ (interval)   │   │ (events)     │   │ (axum)           │  │
//!     │  └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘  │
//!     │         │ publish          │ desired / methods  │            │
//!     │         │                  ├────────────────────┘            │
//!     │         │           ┌──────┴───────┐   ┌──────────────────┐  │
//!     │         │           │ ConfigStore  │<──│ file watcher     │  │
//!     │         │           └──────────────┘   └──────────────────┘  │
//!     └─────────┼──────────────────┬─────────────────────────────────┘
//!               ▼                  │ TransportEvent
//!        ┌─────────────────────────┴──┐
//!        │ transport (mqtt/http/loop) │
//!        └────────────────────────────┘
//!
//! ==============================================================================

mod agent;
mod api;
mod config;
mod dispatch;
mod domain;
mod error;
mod hal;
mod ledger;
mod platform;
mod smoother;
mod store;
mod transport;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{error::ErrorKind, CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::agent::{ControlLoop, Shutdown, StopReason};
use crate::config::{AgentSettings, SensorDriver};
use crate::dispatch::Dispatcher;
use crate::hal::{CpuThermalZone, LedDisplay, LogDisplay, SensorSource, SimulatedSensors};
use crate::ledger::Ledger;
use crate::platform::{PlatformInfo, Updater};
use crate::store::{ConfigStore, FileStorage};
use crate::transport::{ConnectionString, Protocol, TransportPtr};

#[derive(Parser, Debug)]
#[command(name = "pisensor-agent", version, about = "Sense HAT telemetry agent")]
struct Cli {
    /// Transport protocol
    #[arg(short, long, value_enum, default_value_t = Protocol::Mqtt)]
    protocol: Protocol,

    /// Device connection string, overrides [Default] connectionstring
    #[arg(short = 'c', long)]
    connection_string: Option<String>,

    /// Device state file
    #[arg(long, default_value = "pisensor.conf")]
    config: PathBuf,

    /// Agent settings (agent.toml)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Publish to a local loopback instead of the cloud
    #[arg(long)]
    dry_run: bool,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // step 1: settings first, they carry the log level
    let (settings, notes) = AgentSettings::load_or_default(cli.settings.as_deref());
    init_logging(&settings.logging.level);
    for note in &notes {
        tracing::info!("{}", note);
    }
    settings.log_summary();

    match run(cli, settings).await {
        Ok(StopReason::Interrupted) => {
            tracing::info!("agent stopped: interrupted");
            ExitCode::SUCCESS
        }
        Ok(reason) => {
            tracing::error!("agent stopped: {}", reason);
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("agent failed to start: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Print usage with `message` and exit non-zero.
fn usage_error(message: &str) -> ! {
    Cli::command().error(ErrorKind::ValueValidation, message).exit()
}

async fn run(cli: Cli, settings: AgentSettings) -> Result<StopReason> {
    // step 2: device state
    let store = ConfigStore::open(FileStorage::new(&cli.config))
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    let store = Arc::new(store);
    let _watcher = match crate::store::watch_file(Arc::clone(&store), &cli.config) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!("external edits of {} will not be picked up: {}", cli.config.display(), e);
            None
        }
    };

    // step 3: cloud connection
    let (transport, events) = if cli.dry_run {
        tracing::info!("dry run, telemetry stays local");
        let (loopback, events) = transport::loopback();
        (loopback as TransportPtr, events)
    } else {
        let Some(raw) = cli.connection_string.clone().or_else(|| store.connection_string()) else {
            usage_error("no connection string: pass --connection-string or set [Default] connectionstring");
        };
        let conn = match ConnectionString::parse(&raw) {
            Ok(conn) => conn,
            Err(e) => usage_error(&e.to_string()),
        };
        tracing::info!(
            protocol = %cli.protocol,
            host = %conn.host_name,
            device = %conn.device_id,
            "connecting"
        );
        transport::connect(cli.protocol, &conn, &settings.transport).await?
    };

    // step 4: hardware
    let (sensors, display) = build_hardware(&settings)?;

    // step 5: dispatcher, control loop, api
    let ledger = Arc::new(Ledger::new());
    let shutdown = Shutdown::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        display,
        Updater::new(settings.update.commands.clone()),
        Arc::clone(&ledger),
        PlatformInfo::detect(),
        shutdown.clone(),
        settings.display.feedback,
    ));
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run(events));

    let control = ControlLoop::new(
        Arc::clone(&store),
        sensors,
        Arc::clone(&transport),
        ledger,
        Duration::from_millis(settings.transport.message_timeout_ms),
    )
    .show_sensor_data(settings.logging.show_sensor_data);

    if settings.api.enabled {
        let state = api::ApiState {
            dispatcher: Arc::clone(&dispatcher),
            latest: control.latest(),
        };
        let bind = settings.api.bind.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(&bind, state, stop).await {
                tracing::error!("api stopped: {:#}", e);
            }
        });
    }

    if let Err(e) = dispatcher.report_state().await {
        tracing::warn!("startup state report failed: {}", e);
    }

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, stopping");
                interrupt.trigger(StopReason::Interrupted);
            }
            Err(e) => tracing::error!("cannot listen for ctrl-c: {}", e),
        }
    });

    // step 6: run until something stops us
    let reason = control.run(shutdown.clone()).await;
    shutdown.trigger(reason.clone());

    if let Err(e) = transport.close().await {
        tracing::warn!("transport close: {}", e);
    }
    if let Err(e) = dispatch_task.await {
        tracing::warn!("dispatcher task: {}", e);
    }
    Ok(reason)
}

/// Sensors and display for the configured driver.
fn build_hardware(settings: &AgentSettings) -> Result<(Arc<dyn SensorSource>, Arc<dyn LedDisplay>)> {
    let cpu = CpuThermalZone::new(settings.sensors.cpu_temp_path.clone());
    match settings.sensors.driver {
        SensorDriver::Simulated => {
            let mut sensors = SimulatedSensors::new(settings.simulation.clone());
            // on a pi without a hat the real cpu temperature is still there
            if settings.sensors.cpu_temp_path.exists() {
                sensors = sensors.with_cpu_zone(cpu);
            }
            let sensors: Arc<dyn SensorSource> = Arc::new(sensors);
            let display: Arc<dyn LedDisplay> = Arc::new(LogDisplay);
            Ok((sensors, display))
        }
        SensorDriver::SenseHat => sense_hat(settings, cpu),
    }
}

#[cfg(feature = "hardware")]
fn sense_hat(
    settings: &AgentSettings,
    cpu: CpuThermalZone,
) -> Result<(Arc<dyn SensorSource>, Arc<dyn LedDisplay>)> {
    let sensors: Arc<dyn SensorSource> = Arc::new(hal::SenseHatSensors::new(settings.sensors.i2c_bus, cpu)?);
    let display: Arc<dyn LedDisplay> = Arc::new(hal::SenseHatDisplay);
    Ok((sensors, display))
}

#[cfg(not(feature = "hardware"))]
fn sense_hat(
    _settings: &AgentSettings,
    _cpu: CpuThermalZone,
) -> Result<(Arc<dyn SensorSource>, Arc<dyn LedDisplay>)> {
    anyhow::bail!("sensor driver \"sense-hat\" needs a build with --features hardware")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["pisensor-agent"]).unwrap();
        assert_eq!(cli.protocol, Protocol::Mqtt);
        assert_eq!(cli.config, PathBuf::from("pisensor.conf"));
        assert!(cli.connection_string.is_none());
        assert!(!cli.dry_run);
    }

    #[test]
    fn cli_accepts_every_protocol_name() {
        for (name, protocol) in [
            ("amqp", Protocol::Amqp),
            ("amqp_ws", Protocol::AmqpWs),
            ("http", Protocol::Http),
            ("mqtt", Protocol::Mqtt),
            ("mqtt_ws", Protocol::MqttWs),
        ] {
            let cli = Cli::try_parse_from(["pisensor-agent", "-p", name, "-c", "x"]).unwrap();
            assert_eq!(cli.protocol, protocol);
        }
    }

    #[test]
    fn cli_rejects_unknown_protocol() {
        let err = Cli::try_parse_from(["pisensor-agent", "--protocol", "smtp"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn simulated_driver_builds_without_hardware() {
        let settings = AgentSettings::default();
        let (sensors, _display) = build_hardware(&settings).unwrap();
        assert!(sensors.humidity().is_ok());
    }

    #[tokio::test]
    async fn unsupported_protocol_fails_at_connect() {
        let conn = ConnectionString::parse("HostName=h;DeviceId=d;SharedAccessKey=a2V5").unwrap();
        let err = transport::connect(Protocol::Amqp, &conn, &Default::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not supported"));
    }
}
