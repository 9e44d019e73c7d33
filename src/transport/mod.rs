//! ==============================================================================
//! transport/mod.rs - cloud transport abstractions
//! ==============================================================================
//!
//! purpose:
//!     the control loop and the dispatcher only see the Transport trait and the
//!     TransportEvent stream. everything protocol specific (topics, headers,
//!     tokens, reconnects) lives in the concrete transports.
//!
//! delivery:
//!     sends are fire-and-forget: publish returns once the message is queued,
//!     the outcome arrives later as TransportEvent::Delivered carrying the
//!     same MessageId.
//!
//! relationships:
//!     - mqtt.rs: mqtt and mqtt_ws (rumqttc)
//!     - http.rs: https telemetry and c2d polling (reqwest)
//!     - loopback.rs: in-process, for --dry-run and tests
//!
//! ==============================================================================

mod http;
mod loopback;
mod mqtt;

pub use loopback::LoopbackTransport;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::{mpsc, oneshot};

use crate::config::TransportConfig;
use crate::domain::{DeliveryOutcome, MessageId, MethodResponse, OutboundMessage, ReportedState};
use crate::error::TransportError;

/// Capacity of the event channel between a transport and the dispatcher.
const EVENT_CAPACITY: usize = 64;

/// Service api version used in topics and urls.
const API_VERSION: &str = "2021-04-12";

/// Transport protocols selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Protocol {
    #[value(name = "amqp")]
    Amqp,
    #[value(name = "amqp_ws")]
    AmqpWs,
    #[value(name = "http")]
    Http,
    #[value(name = "mqtt")]
    Mqtt,
    #[value(name = "mqtt_ws")]
    MqttWs,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Amqp => "amqp",
            Protocol::AmqpWs => "amqp_ws",
            Protocol::Http => "http",
            Protocol::Mqtt => "mqtt",
            Protocol::MqttWs => "mqtt_ws",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// An inbound direct method waiting for its answer.
#[derive(Debug)]
pub struct MethodCall {
    pub request_id: String,
    pub name: String,
    pub payload: String,
    pub respond: oneshot::Sender<MethodResponse>,
}

/// Everything a transport reports back asynchronously.
#[derive(Debug)]
pub enum TransportEvent {
    /// Outcome of a telemetry send
    Delivered {
        id: MessageId,
        outcome: DeliveryOutcome,
    },
    /// Service answer to a reported-state patch
    ReportAck { request_id: String, status: u16 },
    Connection {
        status: ConnectionStatus,
        reason: String,
    },
    /// `complete` is true for a full twin document, false for a patch
    DesiredState {
        payload: serde_json::Value,
        complete: bool,
    },
    DirectMethod(MethodCall),
    /// Cloud-to-device message
    CloudMessage {
        body: String,
        properties: Vec<(String, String)>,
    },
    /// Unrecoverable; the agent stops
    Fatal(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Queue a telemetry message. Returns once accepted for transmission.
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Queue a reported-state patch. Returns the request id the ack will
    /// carry, or `None` when this transport has no device twin.
    async fn report_state(&self, state: &ReportedState) -> Result<Option<String>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub type TransportPtr = Arc<dyn Transport>;

/// Open a cloud connection for `protocol`.
pub async fn connect(
    protocol: Protocol,
    conn: &ConnectionString,
    settings: &TransportConfig,
) -> Result<(TransportPtr, mpsc::Receiver<TransportEvent>), TransportError> {
    let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
    let transport: TransportPtr = match protocol {
        Protocol::Mqtt => Arc::new(mqtt::MqttTransport::start(conn.clone(), false, settings, tx)?),
        Protocol::MqttWs => Arc::new(mqtt::MqttTransport::start(conn.clone(), true, settings, tx)?),
        Protocol::Http => Arc::new(http::HttpTransport::start(conn.clone(), settings, tx)?),
        Protocol::Amqp => return Err(TransportError::Unsupported("amqp")),
        Protocol::AmqpWs => return Err(TransportError::Unsupported("amqp_ws")),
    };
    Ok((transport, rx))
}

/// Local loopback used by `--dry-run`: nothing leaves the process.
pub fn loopback() -> (Arc<LoopbackTransport>, mpsc::Receiver<TransportEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
    (Arc::new(LoopbackTransport::new(tx)), rx)
}

// ==============================================================================
// connection string + credentials
// ==============================================================================

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// base64 device key, tokens are minted locally
    Key(String),
    /// ready-made `SharedAccessSignature sr=...` token
    Signature(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log secrets
        match self {
            Credential::Key(_) => f.write_str("Key(..)"),
            Credential::Signature(_) => f.write_str("Signature(..)"),
        }
    }
}

/// `HostName=<host>;DeviceId=<id>;SharedAccessKey=<key>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub credential: Credential,
}

impl ConnectionString {
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let mut host_name = None;
        let mut device_id = None;
        let mut key = None;
        let mut signature = None;

        for part in s.trim().split(';').filter(|p| !p.trim().is_empty()) {
            let (k, v) = part.split_once('=').ok_or_else(|| {
                TransportError::ConnectionString(format!("expected key=value, got {:?}", part))
            })?;
            let v = v.trim().to_string();
            match k.trim() {
                "HostName" => host_name = Some(v),
                "DeviceId" => device_id = Some(v),
                "SharedAccessKey" => key = Some(v),
                "SharedAccessSignature" => signature = Some(v),
                _ => {}
            }
        }

        let missing = |field: &str| TransportError::ConnectionString(format!("{} is missing", field));
        let host_name = host_name.filter(|h| !h.is_empty()).ok_or_else(|| missing("HostName"))?;
        let device_id = device_id.filter(|d| !d.is_empty()).ok_or_else(|| missing("DeviceId"))?;
        let credential = match (signature, key) {
            (Some(sig), _) => Credential::Signature(sig),
            (None, Some(key)) => Credential::Key(key),
            (None, None) => return Err(missing("SharedAccessKey")),
        };

        Ok(Self {
            host_name,
            device_id,
            credential,
        })
    }

    /// Resource uri the device tokens are scoped to.
    pub fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.host_name, self.device_id)
    }

    /// A token valid for `ttl` from now.
    pub fn token(&self, ttl: Duration) -> Result<String, TransportError> {
        match &self.credential {
            Credential::Signature(sig) => Ok(sig.clone()),
            Credential::Key(key) => {
                let expiry = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|e| TransportError::Credential(e.to_string()))?
                    + ttl;
                sas_token(&self.resource_uri(), key, expiry.as_secs())
            }
        }
    }
}

/// `SharedAccessSignature sr=<uri>&sig=<hmac>&se=<expiry>`
pub fn sas_token(resource_uri: &str, key: &str, expiry: u64) -> Result<String, TransportError> {
    let key = STANDARD
        .decode(key)
        .map_err(|e| TransportError::Credential(format!("SharedAccessKey is not base64: {}", e)))?;
    let sr = url_encode(resource_uri);
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| TransportError::Credential(e.to_string()))?;
    mac.update(format!("{}\n{}", sr, expiry).as_bytes());
    let sig = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        sr,
        url_encode(&sig),
        expiry
    ))
}

/// Percent-encode everything outside the unreserved set.
pub(crate) fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Inverse of [`url_encode`]; malformed escapes are kept verbatim.
pub(crate) fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = |c: u8| (c as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(if bytes[i] == b'+' { b' ' } else { bytes[i] });
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `a=1&b=2` into pairs, both sides url-decoded.
pub(crate) fn parse_property_bag(bag: &str) -> Vec<(String, String)> {
    bag.split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(kv), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: &str = "HostName=hub.example.net;DeviceId=pi-01;SharedAccessKey=c2VjcmV0a2V5MTIzNA==";

    #[test]
    fn parses_key_connection_string() {
        let c = ConnectionString::parse(CONN).unwrap();
        assert_eq!(c.host_name, "hub.example.net");
        assert_eq!(c.device_id, "pi-01");
        assert_eq!(c.credential, Credential::Key("c2VjcmV0a2V5MTIzNA==".into()));
        assert_eq!(c.resource_uri(), "hub.example.net/devices/pi-01");
    }

    #[test]
    fn signature_wins_over_key() {
        let c = ConnectionString::parse(
            "HostName=h;DeviceId=d;SharedAccessKey=a2V5;SharedAccessSignature=SharedAccessSignature sr=h&sig=x&se=1",
        )
        .unwrap();
        assert_eq!(
            c.token(Duration::from_secs(60)).unwrap(),
            "SharedAccessSignature sr=h&sig=x&se=1"
        );
    }

    #[test]
    fn rejects_incomplete_connection_strings() {
        for bad in [
            "",
            "DeviceId=d;SharedAccessKey=a2V5",
            "HostName=h;SharedAccessKey=a2V5",
            "HostName=h;DeviceId=d",
            "HostName=h;DeviceId",
        ] {
            assert!(
                matches!(ConnectionString::parse(bad), Err(TransportError::ConnectionString(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn debug_output_hides_credentials() {
        let c = ConnectionString::parse(CONN).unwrap();
        assert!(!format!("{:?}", c).contains("c2VjcmV0"));
    }

    #[test]
    fn sas_token_shape_is_stable() {
        let a = sas_token("hub.example.net/devices/pi-01", "c2VjcmV0a2V5MTIzNA==", 1_700_000_000).unwrap();
        let b = sas_token("hub.example.net/devices/pi-01", "c2VjcmV0a2V5MTIzNA==", 1_700_000_000).unwrap();
        let c = sas_token("hub.example.net/devices/pi-01", "c2VjcmV0a2V5MTIzNA==", 1_700_000_001).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fpi-01&sig="));
        assert!(a.ends_with("&se=1700000000"));

        let sig = a.split("&sig=").nth(1).unwrap().split("&se=").next().unwrap();
        let raw = STANDARD.decode(url_decode(sig)).unwrap();
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn bad_key_is_a_credential_error() {
        assert!(matches!(
            sas_token("h/devices/d", "not base64!", 1),
            Err(TransportError::Credential(_))
        ));
    }

    #[test]
    fn url_coding() {
        assert_eq!(url_encode("a/b c=d"), "a%2Fb%20c%3Dd");
        assert_eq!(url_decode("a%2Fb%20c%3Dd"), "a/b c=d");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(
            parse_property_bag("$.mid=m1&color=dark%20red&flag"),
            vec![
                ("$.mid".to_string(), "m1".to_string()),
                ("color".to_string(), "dark red".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }
}
