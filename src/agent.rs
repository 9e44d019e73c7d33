//! ==============================================================================
//! agent.rs - the sampling / publish control loop
//! ==============================================================================
//!
//! purpose:
//!     once per send interval: sample the sensors, estimate the ambient
//!     temperature, smooth it, publish one telemetry message and sleep.
//!     the loop never waits for delivery, confirmations are settled by the
//!     dispatcher through the shared ledger.
//!
//! concurrency:
//!     - the interval and threshold are read as one Config snapshot per cycle,
//!       never field by field.
//!     - sensor io runs on the blocking pool, the loop task only awaits it.
//!     - the sleep between cycles races the shutdown signal so an interrupt
//!       ends the loop without waiting out the interval.
//!
//! relationships:
//!     - reads: store.rs (Config), hal.rs (SensorSource)
//!     - writes: transport (publish), ledger.rs (track / expire)
//!     - stopped by: Shutdown (ctrl-c in main.rs, fatal events in dispatch.rs)
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::{Config, DeliveryOutcome, MessageId, OutboundMessage, Reading};
use crate::error::TransportError;
use crate::hal::SensorSource;
use crate::ledger::Ledger;
use crate::smoother::Smoother;
use crate::store::ConfigStore;
use crate::transport::TransportPtr;

/// Empirical divisor for the cpu self-heating correction.
const CPU_HEAT_FACTOR: f64 = 1.5;

const CORRECTED_SIGNAL: &str = "corrected_temp";

/// Stand-in deadline for intervals the clock cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ==============================================================================
// shutdown
// ==============================================================================

/// Why the agent stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    TransportFatal(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Interrupted => f.write_str("interrupted"),
            StopReason::TransportFatal(reason) => write!(f, "transport failure: {}", reason),
        }
    }
}

/// Cooperative, clonable stop signal. The first reason wins.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. Returns false if a stop was already requested.
    pub fn trigger(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.tx.borrow().clone()
    }

    /// Resolves once a stop has been requested.
    pub async fn wait(&self) -> StopReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            // we hold the sender, so this only fails if the runtime is going away
            if rx.changed().await.is_err() {
                return StopReason::Interrupted;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ==============================================================================
// temperature estimate
// ==============================================================================

/// Ambient estimate with the cpu's heat subtracted.
pub fn corrected_temperature(ambient: f64, cpu: f64) -> f64 {
    ambient - ((cpu - ambient) / CPU_HEAT_FACTOR)
}

/// One decimal, the precision everything is published with.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// One cycle's raw sensor values; `None` where the read failed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawSample {
    pub humidity_temp: Option<f64>,
    pub pressure_temp: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub pressure: Option<f64>,
    pub humidity: Option<f64>,
}

impl RawSample {
    /// Blocking; each field fails on its own.
    pub fn read(sensors: &dyn SensorSource) -> Self {
        fn field(name: &str, value: anyhow::Result<f64>) -> Option<f64> {
            match value {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(sensor = name, "read failed: {:#}", e);
                    None
                }
            }
        }
        Self {
            humidity_temp: field("humidity_temp", sensors.humidity_temp()),
            pressure_temp: field("pressure_temp", sensors.pressure_temp()),
            cpu_temp: sensors.cpu_temp(),
            pressure: field("pressure", sensors.pressure()),
            humidity: field("humidity", sensors.humidity()),
        }
    }

    /// Mean of the two ambient sensors, or whichever one answered.
    pub fn ambient(&self) -> Option<f64> {
        match (self.humidity_temp, self.pressure_temp) {
            (Some(h), Some(p)) => Some((h + p) / 2.0),
            (Some(t), None) | (None, Some(t)) => Some(t),
            (None, None) => None,
        }
    }

    /// Cpu-corrected ambient temperature; uncorrected without a cpu reading.
    pub fn corrected(&self) -> Option<f64> {
        let ambient = self.ambient()?;
        Some(match self.cpu_temp {
            Some(cpu) => corrected_temperature(ambient, cpu),
            None => ambient,
        })
    }
}

/// `started + interval`, clamped when the sum overflows the clock.
fn deadline(started: Instant, interval: Duration) -> Instant {
    started
        .checked_add(interval)
        .unwrap_or_else(|| started + FAR_FUTURE)
}

// ==============================================================================
// control loop
// ==============================================================================

pub struct ControlLoop {
    store: Arc<ConfigStore>,
    sensors: Arc<dyn SensorSource>,
    transport: TransportPtr,
    ledger: Arc<Ledger>,
    smoother: Smoother,
    next_id: u64,
    message_timeout: Duration,
    show_sensor_data: bool,
    latest: watch::Sender<Option<Reading>>,
}

impl ControlLoop {
    pub fn new(
        store: Arc<ConfigStore>,
        sensors: Arc<dyn SensorSource>,
        transport: TransportPtr,
        ledger: Arc<Ledger>,
        message_timeout: Duration,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            store,
            sensors,
            transport,
            ledger,
            smoother: Smoother::new(),
            next_id: 0,
            message_timeout,
            show_sensor_data: true,
            latest,
        }
    }

    pub fn show_sensor_data(mut self, show: bool) -> Self {
        self.show_sensor_data = show;
        self
    }

    /// Last published reading, for the status api.
    pub fn latest(&self) -> watch::Receiver<Option<Reading>> {
        self.latest.subscribe()
    }

    /// Run until `shutdown` fires. Per-cycle errors are logged and the loop
    /// carries on with the next cycle.
    pub async fn run(mut self, shutdown: Shutdown) -> StopReason {
        tracing::info!("control loop started");
        let mut changes = self.store.subscribe();
        loop {
            if let Some(reason) = shutdown.reason() {
                return reason;
            }

            let started = Instant::now();
            let config = *changes.borrow_and_update();
            if let Err(e) = self.cycle(config).await {
                tracing::error!("cycle failed: {:#}", e);
                if let Some(fatal) = e.downcast_ref::<TransportError>().filter(|t| t.is_fatal()) {
                    shutdown.trigger(StopReason::TransportFatal(fatal.to_string()));
                }
            }

            if let Some(reason) = self.pause(started, config, &mut changes, &shutdown).await {
                return reason;
            }
        }
    }

    /// Sleep out the send interval measured from `started`. A new interval
    /// committed meanwhile moves the deadline; a stop request ends the wait.
    async fn pause(
        &self,
        started: Instant,
        config: Config,
        changes: &mut watch::Receiver<Config>,
        shutdown: &Shutdown,
    ) -> Option<StopReason> {
        let mut interval = Duration::from_secs(config.send_interval_seconds);
        loop {
            tokio::select! {
                reason = shutdown.wait() => return Some(reason),
                _ = tokio::time::sleep_until(deadline(started, interval)) => return None,
                Ok(()) = changes.changed() => {
                    let next = changes.borrow_and_update().send_interval_seconds;
                    if Duration::from_secs(next) != interval {
                        tracing::debug!(send_interval = next, "next cycle rescheduled");
                        interval = Duration::from_secs(next);
                    }
                }
            }
        }
    }

    /// Sample, publish, and hand back the id used. The counter moves on even
    /// when the publish fails, ids are never reused.
    pub async fn cycle(&mut self, config: Config) -> anyhow::Result<MessageId> {
        for id in self.ledger.expire(self.message_timeout) {
            tracing::warn!(id = %id, "no confirmation within {:?}, message expired", self.message_timeout);
        }

        let sensors = Arc::clone(&self.sensors);
        let raw = tokio::task::spawn_blocking(move || RawSample::read(sensors.as_ref()))
            .await
            .context("sensor task failed")?;

        let (reading, alert) = self.build_reading(&raw, config.temp_alert_threshold);
        self.log_reading(&reading, alert, &config);

        let id = MessageId(self.next_id);
        self.next_id += 1;

        let message = OutboundMessage::new(id, &reading, alert).context("telemetry encoding")?;
        // tracked before the send, a fast transport may confirm immediately
        self.ledger.track(id, message.correlation_id.clone());
        if let Err(e) = self.transport.publish(message).await {
            self.ledger.confirm(id, &DeliveryOutcome::Failed(e.to_string()));
            return Err(e).with_context(|| format!("publish of message {} failed", id));
        }
        self.latest.send_replace(Some(reading));
        Ok(id)
    }

    fn build_reading(&mut self, raw: &RawSample, threshold: f64) -> (Reading, bool) {
        let corrected = raw
            .corrected()
            .map(|t| round1(self.smoother.smooth(CORRECTED_SIGNAL, t)));
        if corrected.is_none() {
            tracing::warn!("no ambient temperature this cycle, corrected value set to 0");
        }

        let humidity_temp = round1(raw.humidity_temp.unwrap_or_default());
        let reading = Reading {
            humidity_temp,
            // rounded from the humidity temperature, dashboards built on the
            // existing payloads expect both fields to match
            pressure_temp: round1(humidity_temp),
            cpu_temp: raw.cpu_temp.unwrap_or_default(),
            corrected_temp: corrected.unwrap_or_default(),
            pressure: round1(raw.pressure.unwrap_or_default()),
            humidity: round1(raw.humidity.unwrap_or_default()),
        };
        let alert = corrected.map_or(false, |t| t > threshold);
        (reading, alert)
    }

    fn log_reading(&self, r: &Reading, alert: bool, config: &Config) {
        if self.show_sensor_data {
            tracing::info!(
                temp_h = r.humidity_temp,
                temp_p = r.pressure_temp,
                temp_cpu = r.cpu_temp,
                temp_corr = r.corrected_temp,
                pressure = r.pressure,
                humidity = r.humidity,
                alert,
                threshold = config.temp_alert_threshold,
                "sampled"
            );
        } else {
            tracing::debug!(temp_corr = r.corrected_temp, alert, "sampled");
        }
    }
}
