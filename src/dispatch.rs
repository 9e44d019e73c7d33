//! ==============================================================================
//! dispatch.rs - handling of everything the cloud sends back
//! ==============================================================================
//!
//! purpose:
//!     consumes the transport's event stream: delivery confirmations,
//!     reported-state acks, connection changes, desired-state updates, direct
//!     methods and cloud-to-device messages. also owns ReportState.
//!
//! rules:
//!     - desired state: only fields present in the payload are applied, each
//!       through the ConfigStore (write-then-commit). state is reported once
//!       per notification, and only if something actually changed.
//!     - direct methods are answered right away; the work they start (LED,
//!       OS update) runs on its own task.
//!     - a Fatal event stops the agent through the shared Shutdown.
//!
//! relationships:
//!     - fed by: transport (mpsc of TransportEvent), api.rs (desired, methods)
//!     - writes: store.rs, ledger.rs
//!     - uses: hal.rs (LedDisplay), platform.rs (PlatformInfo, Updater)
//!
//! ==============================================================================

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::{Shutdown, StopReason};
use crate::domain::{Config, DeviceCommand, MethodResponse, ReportedState};
use crate::error::TransportError;
use crate::hal::LedDisplay;
use crate::ledger::Ledger;
use crate::platform::{PlatformInfo, Updater};
use crate::store::ConfigStore;
use crate::transport::{ConnectionStatus, TransportEvent, TransportPtr};

const FEEDBACK_COLOR: (u8, u8, u8) = (0, 255, 0);
const FEEDBACK_BLINKS: u8 = 3;

/// What a desired-state notification did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DesiredOutcome {
    /// twin property names that were written
    pub changed: Vec<&'static str>,
    /// property name and reason for each value that was refused
    pub rejected: Vec<(String, String)>,
    pub reported: bool,
}

pub struct Dispatcher {
    store: Arc<ConfigStore>,
    transport: TransportPtr,
    display: Arc<dyn LedDisplay>,
    updater: Updater,
    ledger: Arc<Ledger>,
    platform: PlatformInfo,
    shutdown: Shutdown,
    feedback: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConfigStore>,
        transport: TransportPtr,
        display: Arc<dyn LedDisplay>,
        updater: Updater,
        ledger: Arc<Ledger>,
        platform: PlatformInfo,
        shutdown: Shutdown,
        feedback: bool,
    ) -> Self {
        Self {
            store,
            transport,
            display,
            updater,
            ledger,
            platform,
            shutdown,
            feedback,
        }
    }

    /// Drain transport events until shutdown or until the transport goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        tracing::warn!("transport event stream closed");
                        break;
                    }
                },
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    pub async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Delivered { id, outcome } => match self.ledger.confirm(id, &outcome) {
                Some(c) => tracing::info!(
                    id = %id,
                    correlation_id = %c.correlation_id,
                    latency_ms = c.latency.as_millis() as u64,
                    outcome = ?outcome,
                    "confirmation received"
                ),
                None => tracing::debug!(id = %id, "confirmation for a message no longer tracked"),
            },
            TransportEvent::ReportAck { request_id, status } => {
                let total = self.ledger.record_report_ack();
                tracing::info!(request_id = %request_id, status, total, "reported state acknowledged");
            }
            TransportEvent::Connection { status, reason } => {
                let total = self.ledger.record_connection_change();
                match status {
                    ConnectionStatus::Connected => {
                        tracing::info!(reason = %reason, total, "connection status: connected")
                    }
                    ConnectionStatus::Disconnected => {
                        tracing::warn!(reason = %reason, total, "connection status: disconnected")
                    }
                }
            }
            TransportEvent::DesiredState { payload, complete } => {
                self.apply_desired(&payload, complete).await;
            }
            TransportEvent::DirectMethod(call) => {
                let response = self.invoke_method(&call.name, &call.payload);
                if call.respond.send(response).is_err() {
                    tracing::warn!(request_id = %call.request_id, "method caller went away before the response");
                }
            }
            TransportEvent::CloudMessage { body, properties } => {
                let total = self.ledger.record_cloud_message();
                tracing::info!(total, properties = ?properties, "cloud message: {}", body);
            }
            TransportEvent::Fatal(reason) => {
                tracing::error!("transport reported an unrecoverable error: {}", reason);
                self.shutdown.trigger(StopReason::TransportFatal(reason));
            }
        }
    }

    // ==========================================================================
    // desired state
    // ==========================================================================

    pub async fn apply_desired(&self, payload: &Value, complete: bool) -> DesiredOutcome {
        let total = self.ledger.record_desired_update();
        tracing::info!(complete, total, "desired state received: {}", payload);

        let mut outcome = DesiredOutcome::default();
        let current = self.store.get();

        if let Some(raw) = payload.get("sendInterval") {
            match parse_interval(raw) {
                Some(seconds) if seconds == current.send_interval_seconds => {}
                Some(seconds) => match self.store.set_send_interval(seconds) {
                    Ok(_) => {
                        tracing::info!(
                            "send interval changed from {} to {} seconds",
                            current.send_interval_seconds,
                            seconds
                        );
                        outcome.changed.push("sendInterval");
                        self.feedback(format!("Send interval {} seconds", seconds));
                    }
                    Err(e) => {
                        tracing::error!("send interval not changed: {}", e);
                        outcome.rejected.push(("sendInterval".into(), e.to_string()));
                    }
                },
                None => {
                    tracing::warn!("ignoring sendInterval {}", raw);
                    outcome
                        .rejected
                        .push(("sendInterval".into(), format!("{} is not a positive integer", raw)));
                }
            }
        }

        if let Some(raw) = payload.get("tempAlert") {
            match parse_number(raw) {
                Some(threshold) if threshold == current.temp_alert_threshold => {}
                Some(threshold) => match self.store.set_temp_alert(threshold) {
                    Ok(_) => {
                        tracing::info!(
                            "alert temperature changed from {} to {}",
                            current.temp_alert_threshold,
                            threshold
                        );
                        outcome.changed.push("tempAlert");
                        self.feedback(format!("Temp alert {} degrees", threshold));
                    }
                    Err(e) => {
                        tracing::error!("alert temperature not changed: {}", e);
                        outcome.rejected.push(("tempAlert".into(), e.to_string()));
                    }
                },
                None => {
                    tracing::warn!("ignoring tempAlert {}", raw);
                    outcome
                        .rejected
                        .push(("tempAlert".into(), format!("{} is not a number", raw)));
                }
            }
        }

        if !outcome.changed.is_empty() {
            match self.report_state().await {
                Ok(_) => outcome.reported = true,
                Err(e) => tracing::error!("state report failed: {}", e),
            }
        }
        outcome
    }

    // ==========================================================================
    // direct methods
    // ==========================================================================

    pub fn invoke_method(&self, name: &str, payload: &str) -> MethodResponse {
        let total = self.ledger.record_method_call();
        tracing::info!(method = name, total, "direct method called, payload {}", payload);

        match DeviceCommand::parse(name, payload) {
            DeviceCommand::DisplayMessage(text) => {
                let display = Arc::clone(&self.display);
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = display.show_message(&text) {
                        tracing::warn!("display failed: {:#}", e);
                    }
                });
                MethodResponse::for_method(name, 200)
            }
            DeviceCommand::UpdateDevice => {
                if !self.updater.trigger() {
                    tracing::info!("update requested while one is running");
                }
                MethodResponse::for_method(name, 200)
            }
            DeviceCommand::Unknown(other) => {
                tracing::warn!(method = %other, "unknown direct method");
                MethodResponse::for_method(name, 404)
            }
        }
    }

    // ==========================================================================
    // reported state
    // ==========================================================================

    pub fn reported_state(&self) -> ReportedState {
        let config = self.store.get();
        ReportedState {
            runtime_version: self.platform.runtime_version.clone(),
            platform_version: self.platform.platform_version.clone(),
            send_interval: config.send_interval_seconds,
            temp_alert: config.temp_alert_threshold,
        }
    }

    /// Publish the current state. The ack arrives later as a ReportAck event.
    pub async fn report_state(&self) -> Result<Option<String>, TransportError> {
        let state = self.reported_state();
        tracing::info!(
            runtime = %state.runtime_version,
            platform = %state.platform_version,
            send_interval = state.send_interval,
            temp_alert = state.temp_alert,
            "reporting device state"
        );
        let request_id = self.transport.report_state(&state).await?;
        if let Some(rid) = &request_id {
            tracing::debug!(request_id = %rid, "state report queued");
        }
        Ok(request_id)
    }

    pub fn config(&self) -> Config {
        self.store.get()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn update_running(&self) -> bool {
        self.updater.is_running()
    }

    fn feedback(&self, text: String) {
        if !self.feedback {
            return;
        }
        let display = Arc::clone(&self.display);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = display.blink(FEEDBACK_COLOR, FEEDBACK_BLINKS) {
                tracing::warn!("display failed: {:#}", e);
                return;
            }
            if let Err(e) = display.show_message(&text) {
                tracing::warn!("display failed: {:#}", e);
            }
        });
    }
}

/// Integers, integral floats and numeric strings; zero and negatives are refused.
fn parse_interval(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return (n > 0).then_some(n);
    }
    let f = parse_number(value)?;
    (f >= 1.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then_some(f as u64)
}

fn parse_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|f| f.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{sample_store, MemoryStorage};
    use crate::transport::{self, LoopbackTransport};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// Display that records what it was asked to show.
    #[derive(Default)]
    struct RecordingDisplay(Mutex<Vec<String>>);

    impl LedDisplay for RecordingDisplay {
        fn show_message(&self, text: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
        fn blink(&self, _rgb: (u8, u8, u8), _times: u8) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        storage: Arc<MemoryStorage>,
        loopback: Arc<LoopbackTransport>,
        display: Arc<RecordingDisplay>,
        shutdown: Shutdown,
        _events: mpsc::Receiver<TransportEvent>,
    }

    fn fixture() -> Fixture {
        let (store, storage) = sample_store();
        let (loopback, events) = transport::loopback();
        let display = Arc::new(RecordingDisplay::default());
        let shutdown = Shutdown::new();
        let dispatcher = Dispatcher::new(
            store,
            loopback.clone(),
            display.clone(),
            Updater::new(vec![]),
            Arc::new(Ledger::new()),
            PlatformInfo {
                runtime_version: "pisensor-agent 0.1.0".into(),
                platform_version: "Linux-6.1-aarch64".into(),
            },
            shutdown.clone(),
            true,
        );
        Fixture {
            dispatcher,
            storage,
            loopback,
            display,
            shutdown,
            _events: events,
        }
    }

    #[tokio::test]
    async fn changed_interval_writes_once_and_reports_once() {
        let f = fixture();
        let outcome = f.dispatcher.apply_desired(&json!({"sendInterval": 30}), false).await;

        assert_eq!(outcome.changed, vec!["sendInterval"]);
        assert!(outcome.reported);
        assert_eq!(f.storage.writes.load(Ordering::SeqCst), 1);
        assert_eq!(f.dispatcher.store.get().send_interval_seconds, 30);

        let reports = f.loopback.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].send_interval, 30);
        assert_eq!(reports[0].temp_alert, 30.0);
    }

    #[tokio::test]
    async fn unchanged_values_neither_write_nor_report() {
        let f = fixture();
        let outcome = f
            .dispatcher
            .apply_desired(&json!({"sendInterval": 60, "tempAlert": 30, "$version": 4}), true)
            .await;

        assert!(outcome.changed.is_empty());
        assert!(!outcome.reported);
        assert_eq!(f.storage.writes.load(Ordering::SeqCst), 0);
        assert!(f.loopback.reports().is_empty());
    }

    #[tokio::test]
    async fn both_fields_report_once() {
        let f = fixture();
        let outcome = f
            .dispatcher
            .apply_desired(&json!({"sendInterval": "15", "tempAlert": 27.5}), false)
            .await;

        assert_eq!(outcome.changed, vec!["sendInterval", "tempAlert"]);
        assert_eq!(f.storage.writes.load(Ordering::SeqCst), 2);
        assert_eq!(f.loopback.reports().len(), 1);
        assert_eq!(f.dispatcher.store.get().temp_alert_threshold, 27.5);
    }

    #[tokio::test]
    async fn only_the_changed_field_is_written() {
        let f = fixture();
        let outcome = f
            .dispatcher
            .apply_desired(&json!({"sendInterval": 60, "tempAlert": 25}), false)
            .await;

        assert_eq!(outcome.changed, vec!["tempAlert"]);
        assert!(outcome.reported);
        assert_eq!(f.storage.writes.load(Ordering::SeqCst), 1);
        let reports = f.loopback.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].send_interval, 60);
        assert_eq!(reports[0].temp_alert, 25.0);
    }

    #[tokio::test]
    async fn invalid_values_are_rejected_without_side_effects() {
        let f = fixture();
        let outcome = f
            .dispatcher
            .apply_desired(&json!({"sendInterval": 0, "tempAlert": "warm"}), false)
            .await;

        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(f.storage.writes.load(Ordering::SeqCst), 0);
        assert!(f.loopback.reports().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_keeps_old_threshold() {
        let f = fixture();
        f.storage.fail.store(true, Ordering::SeqCst);

        let outcome = f.dispatcher.apply_desired(&json!({"tempAlert": 35}), false).await;

        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.rejected[0].0, "tempAlert");
        assert_eq!(f.dispatcher.store.get().temp_alert_threshold, 30.0);
        assert!(f.loopback.reports().is_empty());
    }

    #[tokio::test]
    async fn direct_methods_answer_by_name() {
        let f = fixture();

        let ok = f.dispatcher.invoke_method("displayMessage", "\"hello\"");
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body, r#"{"methodName":"displayMessage"}"#);

        let missing = f.dispatcher.invoke_method("unknown_cmd", "{}");
        assert_eq!(missing.status, 404);
        assert_eq!(missing.body, r#"{"methodName":"unknown_cmd"}"#);

        assert_eq!(f.dispatcher.invoke_method("update_device", "").status, 200);
        assert_eq!(f.dispatcher.ledger().snapshot().method_calls, 3);

        // the display runs on the blocking pool
        for _ in 0..50 {
            if !f.display.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*f.display.0.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn method_event_is_answered_through_its_channel() {
        let f = fixture();
        let (respond, answer) = tokio::sync::oneshot::channel();
        f.dispatcher
            .handle(TransportEvent::DirectMethod(transport::MethodCall {
                request_id: "9".into(),
                name: "updateDevice".into(),
                payload: "null".into(),
                respond,
            }))
            .await;
        assert_eq!(answer.await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn fatal_event_triggers_shutdown() {
        let f = fixture();
        f.dispatcher
            .handle(TransportEvent::Fatal("refused".into()))
            .await;
        assert_eq!(
            f.shutdown.reason(),
            Some(StopReason::TransportFatal("refused".into()))
        );
    }

    #[tokio::test]
    async fn confirmations_settle_the_ledger() {
        let f = fixture();
        let id = crate::domain::MessageId(5);
        f.dispatcher.ledger().track(id, id.correlation_id());
        f.dispatcher
            .handle(TransportEvent::Delivered {
                id,
                outcome: crate::domain::DeliveryOutcome::Ok,
            })
            .await;
        f.dispatcher
            .handle(TransportEvent::CloudMessage {
                body: "hi".into(),
                properties: vec![],
            })
            .await;
        let snap = f.dispatcher.ledger().snapshot();
        assert_eq!((snap.delivered, snap.pending, snap.cloud_messages), (1, 0, 1));
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(parse_interval(&json!(30)), Some(30));
        assert_eq!(parse_interval(&json!(30.0)), Some(30));
        assert_eq!(parse_interval(&json!("45")), Some(45));
        assert_eq!(parse_interval(&json!(0)), None);
        assert_eq!(parse_interval(&json!(-5)), None);
        assert_eq!(parse_interval(&json!(2.5)), None);
        assert_eq!(parse_interval(&json!(null)), None);
    }
}
