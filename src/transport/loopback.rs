//! ==============================================================================
//! transport/loopback.rs - in-process transport
//! ==============================================================================
//!
//! purpose:
//!     publishes and state reports are recorded and confirmed immediately.
//!     used by --dry-run and as the reference behaviour in tests.
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent};
use crate::domain::{DeliveryOutcome, OutboundMessage, ReportedState};
use crate::error::TransportError;

pub struct LoopbackTransport {
    events: mpsc::Sender<TransportEvent>,
    published: Mutex<Vec<OutboundMessage>>,
    reports: Mutex<Vec<ReportedState>>,
    next_request: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            published: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn reports(&self) -> Vec<ReportedState> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Confirmations are best effort: a full or closed channel drops them,
    /// the same way a lost ack would.
    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!("loopback confirmation dropped: {}", e);
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        tracing::info!(
            id = %message.id,
            alert = message.properties.temperature_alert,
            "[LOOPBACK] {}",
            message.body
        );
        let id = message.id;
        if let Ok(mut published) = self.published.lock() {
            published.push(message);
        }
        self.emit(TransportEvent::Delivered {
            id,
            outcome: DeliveryOutcome::Ok,
        });
        Ok(())
    }

    async fn report_state(&self, state: &ReportedState) -> Result<Option<String>, TransportError> {
        let body = serde_json::to_string(state)?;
        tracing::info!("[LOOPBACK] reported state {}", body);
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(state.clone());
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
        self.emit(TransportEvent::ReportAck {
            request_id: request_id.clone(),
            status: 204,
        });
        Ok(Some(request_id))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, Reading};

    #[tokio::test]
    async fn publish_is_recorded_and_confirmed() {
        let (transport, mut rx) = crate::transport::loopback();
        let reading = Reading {
            humidity_temp: 1.0,
            pressure_temp: 1.0,
            cpu_temp: 1.0,
            corrected_temp: 1.0,
            pressure: 1.0,
            humidity: 1.0,
        };
        let msg = OutboundMessage::new(MessageId(4), &reading, false).unwrap();
        transport.publish(msg.clone()).await.unwrap();

        assert_eq!(transport.published(), vec![msg]);
        match rx.recv().await {
            Some(TransportEvent::Delivered { id, outcome }) => {
                assert_eq!(id, MessageId(4));
                assert_eq!(outcome, DeliveryOutcome::Ok);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn report_state_acks_with_request_id() {
        let (transport, mut rx) = crate::transport::loopback();
        let state = ReportedState {
            runtime_version: "v".into(),
            platform_version: "p".into(),
            send_interval: 10,
            temp_alert: 20.0,
        };
        let rid = transport.report_state(&state).await.unwrap().unwrap();
        assert_eq!(transport.reports(), vec![state]);
        match rx.recv().await {
            Some(TransportEvent::ReportAck { request_id, status }) => {
                assert_eq!(request_id, rid);
                assert_eq!(status, 204);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
