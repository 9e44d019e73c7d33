//! ==============================================================================
//! domain.rs - shared data model
//! ==============================================================================
//!
//! purpose:
//!     the types that flow between the sampling loop, the dispatcher and the
//!     transports. nothing in here does io.
//!
//! relationships:
//!     - produced by: agent.rs (Reading, OutboundMessage)
//!     - produced by: store.rs (Config)
//!     - produced by: dispatch.rs (ReportedState, MethodResponse)
//!     - consumed by: transport/* (serialized onto the wire)
//!
//! ==============================================================================

use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;

/// Device id used in the telemetry body, matches what the dashboards expect.
pub const TELEMETRY_DEVICE_ID: &str = "jhnr-device";

// ==============================================================================
// configuration
// ==============================================================================

/// Interval and alert threshold, the only state shared between tasks.
///
/// `Copy` on purpose: readers always work on their own snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Config {
    pub send_interval_seconds: u64,
    pub temp_alert_threshold: f64,
}

// ==============================================================================
// readings
// ==============================================================================

/// One cycle's worth of published values, already rounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub humidity_temp: f64,
    pub pressure_temp: f64,
    pub cpu_temp: f64,
    pub corrected_temp: f64,
    pub pressure: f64,
    pub humidity: f64,
}

/// Telemetry body in the wire shape: fixed names, 2-decimal numbers.
#[derive(Serialize)]
struct TelemetryBody<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    #[serde(serialize_with = "two_decimals")]
    temp_from_humidity: f64,
    #[serde(serialize_with = "two_decimals")]
    temp_from_pressure: f64,
    #[serde(serialize_with = "two_decimals")]
    temp_cpu: f64,
    #[serde(serialize_with = "two_decimals")]
    temp_corr: f64,
    #[serde(serialize_with = "two_decimals")]
    pressure: f64,
    #[serde(serialize_with = "two_decimals")]
    humidity: f64,
}

fn two_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    // non-finite values have no json representation
    let value = if value.is_finite() { *value } else { 0.0 };
    let raw = RawValue::from_string(format!("{:.2}", value)).map_err(serde::ser::Error::custom)?;
    raw.serialize(serializer)
}

impl Reading {
    /// Serialize to the telemetry json shape.
    pub fn to_telemetry_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&TelemetryBody {
            device_id: TELEMETRY_DEVICE_ID,
            temp_from_humidity: self.humidity_temp,
            temp_from_pressure: self.pressure_temp,
            temp_cpu: self.cpu_temp,
            temp_corr: self.corrected_temp,
            pressure: self.pressure,
            humidity: self.humidity,
        })
    }
}

// ==============================================================================
// outbound messages
// ==============================================================================

/// Monotonic per-process telemetry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Wire message id, `message_<n>`.
    pub fn message_tag(&self) -> String {
        format!("message_{}", self.0)
    }

    /// Correlation id derived from the counter, `correlation_<n>`.
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId(format!("correlation_{}", self.0))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token linking a confirmation back to its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application properties attached to a telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageProperties {
    #[serde(rename = "temperatureAlert")]
    pub temperature_alert: bool,
}

/// Immutable telemetry message handed to a transport once per cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub body: String,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(id: MessageId, reading: &Reading, temperature_alert: bool) -> serde_json::Result<Self> {
        Ok(Self {
            id,
            correlation_id: id.correlation_id(),
            body: reading.to_telemetry_json()?,
            properties: MessageProperties { temperature_alert },
        })
    }
}

/// Result of a send as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ok,
    Failed(String),
}

// ==============================================================================
// reported state
// ==============================================================================

/// Device-observed configuration, published at startup and after changes.
///
/// The field names are shared with the cloud-side twin and cannot change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedState {
    #[serde(rename = "pythonVersion")]
    pub runtime_version: String,
    #[serde(rename = "platformVersion")]
    pub platform_version: String,
    #[serde(rename = "sendInterval")]
    pub send_interval: u64,
    #[serde(rename = "tempAlert", serialize_with = "whole_as_integer")]
    pub temp_alert: f64,
}

/// Whole thresholds go out as integers (`30`, not `30.0`).
fn whole_as_integer<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

// ==============================================================================
// direct methods
// ==============================================================================

/// Parsed direct method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    DisplayMessage(String),
    UpdateDevice,
    Unknown(String),
}

impl DeviceCommand {
    /// Accepts both the camelCase and the snake_case method names.
    pub fn parse(name: &str, payload: &str) -> Self {
        match name {
            "displayMessage" | "display_message" => {
                DeviceCommand::DisplayMessage(payload_text(payload))
            }
            "updateDevice" | "update_device" => DeviceCommand::UpdateDevice,
            other => DeviceCommand::Unknown(other.to_string()),
        }
    }
}

/// A json string payload is unwrapped, anything else is shown verbatim.
fn payload_text(payload: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::String(s)) => s,
        _ => payload.trim().to_string(),
    }
}

/// Synchronous answer to a direct method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodResponse {
    pub status: u16,
    pub body: String,
}

impl MethodResponse {
    pub fn for_method(name: &str, status: u16) -> Self {
        Self {
            status,
            body: serde_json::json!({ "methodName": name }).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> Reading {
        Reading {
            humidity_temp: 21.3,
            pressure_temp: 21.3,
            cpu_temp: 45.126,
            corrected_temp: 8.3,
            pressure: 1013.2,
            humidity: 40.0,
        }
    }

    #[test]
    fn telemetry_uses_fixed_names_and_two_decimals() {
        let json = reading().to_telemetry_json().unwrap();
        assert_eq!(
            json,
            "{\"deviceId\":\"jhnr-device\",\"temp_from_humidity\":21.30,\"temp_from_pressure\":21.30,\
             \"temp_cpu\":45.13,\"temp_corr\":8.30,\"pressure\":1013.20,\"humidity\":40.00}"
        );
        // still valid json
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["humidity"], serde_json::json!(40.0));
    }

    #[test]
    fn non_finite_values_do_not_break_the_body() {
        let mut r = reading();
        r.cpu_temp = f64::NAN;
        let json = r.to_telemetry_json().unwrap();
        assert!(json.contains("\"temp_cpu\":0.00"));
    }

    #[test]
    fn message_ids_derive_tags() {
        let msg = OutboundMessage::new(MessageId(7), &reading(), true).unwrap();
        assert_eq!(msg.id.message_tag(), "message_7");
        assert_eq!(msg.correlation_id.as_str(), "correlation_7");
        assert!(msg.properties.temperature_alert);
    }

    #[test]
    fn reported_state_shape() {
        let state = ReportedState {
            runtime_version: "0.1.0".into(),
            platform_version: "Linux".into(),
            send_interval: 60,
            temp_alert: 30.0,
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["pythonVersion"], "0.1.0");
        assert_eq!(v["platformVersion"], "Linux");
        assert_eq!(v["sendInterval"], 60);
        assert_eq!(v["tempAlert"], 30.0);
    }

    #[test]
    fn whole_thresholds_report_as_integers() {
        let mut state = ReportedState {
            runtime_version: "0.1.0".into(),
            platform_version: "Linux".into(),
            send_interval: 60,
            temp_alert: 30.0,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.ends_with("\"sendInterval\":60,\"tempAlert\":30}"), "{}", json);

        state.temp_alert = 27.5;
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.ends_with("\"tempAlert\":27.5}"), "{}", json);
    }

    #[test]
    fn command_parsing() {
        assert_eq!(
            DeviceCommand::parse("displayMessage", "\"hello\""),
            DeviceCommand::DisplayMessage("hello".into())
        );
        assert_eq!(
            DeviceCommand::parse("display_message", "hi there"),
            DeviceCommand::DisplayMessage("hi there".into())
        );
        assert_eq!(DeviceCommand::parse("update_device", ""), DeviceCommand::UpdateDevice);
        assert_eq!(
            DeviceCommand::parse("reboot", "{}"),
            DeviceCommand::Unknown("reboot".into())
        );
    }

    #[test]
    fn method_response_echoes_name() {
        let r = MethodResponse::for_method("unknown_cmd", 404);
        assert_eq!(r.status, 404);
        assert_eq!(r.body, "{\"methodName\":\"unknown_cmd\"}");
    }
}
