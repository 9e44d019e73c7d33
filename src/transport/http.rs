//! ==============================================================================
//! transport/http.rs - https transport (reqwest)
//! ==============================================================================
//!
//! purpose:
//!     each telemetry message is one POST made from its own task, so publish
//!     returns as soon as the request is spawned and the status code comes
//!     back later as TransportEvent::Delivered. cloud-to-device messages are
//!     polled and completed.
//!
//! limits:
//!     no device twin and no direct methods over this protocol.
//!
//! ==============================================================================

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectionString, Transport, TransportEvent};
use crate::config::TransportConfig;
use crate::domain::{DeliveryOutcome, OutboundMessage, ReportedState};
use crate::error::TransportError;

/// The REST device api is versioned separately from the MQTT one.
const HTTP_API_VERSION: &str = "2020-09-30";

/// Prefix of application properties on cloud-to-device responses.
const APP_PROPERTY_PREFIX: &str = "iothub-app-";

#[derive(Clone)]
struct Endpoint {
    client: reqwest::Client,
    base_url: String,
    conn: ConnectionString,
    ttl: Duration,
}

impl Endpoint {
    fn url(&self, path: &str) -> String {
        format!(
            "{}/devices/{}/{}?api-version={}",
            self.base_url, self.conn.device_id, path, HTTP_API_VERSION
        )
    }

    fn authorization(&self) -> Result<String, TransportError> {
        self.conn.token(self.ttl)
    }
}

pub struct HttpTransport {
    endpoint: Endpoint,
    events: mpsc::Sender<TransportEvent>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn start(
        conn: ConnectionString,
        settings: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let base_url = format!("https://{}", conn.host_name);
        Self::with_base_url(conn, base_url, settings, events)
    }

    fn with_base_url(
        conn: ConnectionString,
        base_url: String,
        settings: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        // validate the credential up front, a bad key is a startup error
        let ttl = Duration::from_secs(settings.sas_ttl_seconds.max(60));
        conn.token(ttl)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.message_timeout_ms.max(1)))
            .build()?;
        let endpoint = Endpoint {
            client,
            base_url,
            conn,
            ttl,
        };

        let interval = Duration::from_secs(settings.poll_interval_seconds.max(1));
        let poller = tokio::spawn(poll_cloud_messages(endpoint.clone(), interval, events.clone()));
        tracing::info!(host = %endpoint.conn.host_name, "http transport ready");

        Ok(Self {
            endpoint,
            events,
            poller: Mutex::new(Some(poller)),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let authorization = self.endpoint.authorization()?;
        let request = self
            .endpoint
            .client
            .post(self.endpoint.url("messages/events"))
            .header("authorization", authorization)
            .header("content-type", "application/json")
            .header("iothub-messageid", message.id.message_tag())
            .header("iothub-correlationid", message.correlation_id.as_str())
            .header(
                "iothub-app-temperatureAlert",
                message.properties.temperature_alert.to_string(),
            )
            .body(message.body);

        let id = message.id;
        let events = self.events.clone();
        tokio::spawn(async move {
            let (outcome, fatal) = match request.send().await {
                Ok(resp) if resp.status().is_success() => (DeliveryOutcome::Ok, None),
                Ok(resp) => {
                    let status = resp.status();
                    let fatal = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
                        .then(|| format!("telemetry rejected with {}", status));
                    (DeliveryOutcome::Failed(status.to_string()), fatal)
                }
                Err(e) => (DeliveryOutcome::Failed(e.to_string()), None),
            };
            if events.send(TransportEvent::Delivered { id, outcome }).await.is_err() {
                return;
            }
            if let Some(reason) = fatal {
                let _ = events.send(TransportEvent::Fatal(reason)).await;
            }
        });
        Ok(())
    }

    async fn report_state(&self, state: &ReportedState) -> Result<Option<String>, TransportError> {
        tracing::info!(
            send_interval = state.send_interval,
            temp_alert = state.temp_alert,
            "device twin is not available over http, reported state not sent"
        );
        Ok(None)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let handle = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }
}

// ==============================================================================
// cloud-to-device polling
// ==============================================================================

async fn poll_cloud_messages(
    endpoint: Endpoint,
    interval: Duration,
    events: mpsc::Sender<TransportEvent>,
) {
    while !events.is_closed() {
        match receive_one(&endpoint).await {
            Ok(Some((event, etag))) => {
                if events.send(event).await.is_err() {
                    break;
                }
                if let Err(e) = complete(&endpoint, &etag).await {
                    tracing::warn!(etag = %etag, "could not complete cloud message: {}", e);
                }
                // drain the queue before sleeping again
                continue;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("cloud message poll failed: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
    tracing::debug!("cloud message polling stopped");
}

/// One pending cloud message and the etag used to complete it, or `None`
/// when the queue is empty.
async fn receive_one(endpoint: &Endpoint) -> Result<Option<(TransportEvent, String)>, TransportError> {
    let resp = endpoint
        .client
        .get(endpoint.url("messages/deviceBound"))
        .header("authorization", endpoint.authorization()?)
        .send()
        .await?
        .error_for_status()?;

    if resp.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let Some(etag) = header_str(resp.headers(), "etag").map(|e| e.trim_matches('"').to_string()) else {
        tracing::warn!("cloud message without etag ignored");
        return Ok(None);
    };
    let properties = app_properties(resp.headers());
    let body = resp.text().await?;
    Ok(Some((TransportEvent::CloudMessage { body, properties }, etag)))
}

async fn complete(endpoint: &Endpoint, etag: &str) -> Result<(), TransportError> {
    endpoint
        .client
        .delete(endpoint.url(&format!("messages/deviceBound/{}", etag)))
        .header("authorization", endpoint.authorization()?)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `iothub-app-<name>` headers as `(name, value)`, sorted by name.
fn app_properties(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut props: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(APP_PROPERTY_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();
    props.sort();
    props
}
