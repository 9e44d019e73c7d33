//! ==============================================================================
//! transport/mqtt.rs - mqtt and mqtt-over-websocket transport (rumqttc)
//! ==============================================================================
//!
//! purpose:
//!     speaks the IoT hub device topics: telemetry at qos 1, the device twin
//!     (desired patches, full twin on connect, reported patches), direct
//!     methods and cloud-to-device messages.
//!
//! concurrency:
//!     - one actor task owns the rumqttc EventLoop. MqttTransport talks to it
//!       through a command channel and the actor reports back through the
//!       shared TransportEvent channel.
//!     - the actor never waits on anything it is itself responsible for
//!       draining: commands only queue work with rumqttc (try_*), events are
//!       handed over with try_send, and the reconnect backoff is a select
//!       branch so commands are still served while the broker is away.
//!
//! delivery correlation:
//!     rumqttc assigns packet ids itself, in the order requests are queued,
//!     and announces them as Outgoing::Publish(pkid). queued message ids wait
//!     in a fifo and are bound to the next fresh packet id; the matching
//!     PUBACK settles the message. qos 0 publishes carry pkid 0 and are
//!     skipped, packet ids already bound are retransmissions.
//!
//! topics:
//!     telemetry              devices/{id}/messages/events/{property bag}
//!     c2d                    devices/{id}/messages/devicebound/#
//!     desired patch          $iothub/twin/PATCH/properties/desired/?$version=n
//!     twin get / report ack  $iothub/twin/res/{status}/?$rid=r
//!     reported patch         $iothub/twin/PATCH/properties/reported/?$rid=r
//!     method call            $iothub/methods/POST/{name}/?$rid=r
//!     method reply           $iothub/methods/res/{status}/?$rid=r
//!
//! ==============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    Publish, QoS,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{
    parse_property_bag, url_encode, ConnectionStatus, ConnectionString, MethodCall, Transport,
    TransportEvent, API_VERSION,
};
use crate::config::TransportConfig;
use crate::domain::{DeliveryOutcome, MessageId, MethodResponse, OutboundMessage, ReportedState};
use crate::error::TransportError;

const DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const METHOD_PREFIX: &str = "$iothub/methods/POST/";

enum Cmd {
    Publish {
        message: OutboundMessage,
        resp: oneshot::Sender<Result<(), TransportError>>,
    },
    Report {
        request_id: String,
        body: Vec<u8>,
        resp: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

pub struct MqttTransport {
    cmd_tx: mpsc::Sender<Cmd>,
    next_request: Arc<AtomicU64>,
}

impl MqttTransport {
    /// Build the client and start the actor. The broker connection itself
    /// happens on the actor's first poll.
    pub fn start(
        conn: ConnectionString,
        websocket: bool,
        settings: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let ttl = Duration::from_secs(settings.sas_ttl_seconds.max(60));
        let username = format!("{}/{}/?api-version={}", conn.host_name, conn.device_id, API_VERSION);
        let password = conn.token(ttl)?;

        let mut options = if websocket {
            let url = format!("wss://{}:443/$iothub/websocket", conn.host_name);
            let mut o = MqttOptions::new(conn.device_id.clone(), url, 443);
            o.set_transport(rumqttc::Transport::wss_with_default_config());
            o
        } else {
            let mut o = MqttOptions::new(conn.device_id.clone(), conn.host_name.clone(), 8883);
            o.set_transport(rumqttc::Transport::tls_with_default_config());
            o
        };
        options
            .set_keep_alive(Duration::from_secs(settings.keep_alive_seconds.max(5)))
            .set_credentials(username.clone(), password)
            .set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 32);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let next_request = Arc::new(AtomicU64::new(1));

        let actor = MqttActor {
            conn,
            username,
            ttl,
            retry: Duration::from_secs(settings.retry_interval_seconds.max(1)),
            client,
            eventloop,
            cmd_rx,
            events,
            correlator: Correlator::default(),
            next_request: Arc::clone(&next_request),
            connected: false,
            backoff: None,
        };
        tokio::spawn(actor.run());

        Ok(Self { cmd_tx, next_request })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, TransportError>>) -> Cmd,
    ) -> Result<T, TransportError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(resp))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.request(|resp| Cmd::Publish { message, resp }).await
    }

    async fn report_state(&self, state: &ReportedState) -> Result<Option<String>, TransportError> {
        let body = serde_json::to_vec(state)?;
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
        let rid = request_id.clone();
        self.request(|resp| Cmd::Report {
            request_id: rid,
            body,
            resp,
        })
        .await?;
        Ok(Some(request_id))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (resp, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

// ==============================================================================
// correlation
// ==============================================================================

/// Packet-id and request-id bookkeeping, kept apart from the io so it can be
/// driven directly.
#[derive(Debug, Default)]
struct Correlator {
    /// telemetry queued with rumqttc but not yet given a packet id
    awaiting_pkid: VecDeque<MessageId>,
    /// packet id -> telemetry waiting for PUBACK
    inflight: HashMap<u16, MessageId>,
    /// request ids of full-twin GETs, their answers are desired state
    twin_gets: HashSet<String>,
}

impl Correlator {
    fn queued(&mut self, id: MessageId) {
        self.awaiting_pkid.push_back(id);
    }

    /// Bind an outgoing qos 1 packet id to the oldest queued message.
    /// Returns the message bound, `None` for retransmissions and qos 0.
    fn outgoing(&mut self, pkid: u16) -> Option<MessageId> {
        if pkid == 0 || self.inflight.contains_key(&pkid) {
            return None;
        }
        let id = self.awaiting_pkid.pop_front()?;
        self.inflight.insert(pkid, id);
        Some(id)
    }

    fn acked(&mut self, pkid: u16) -> Option<MessageId> {
        self.inflight.remove(&pkid)
    }

    fn twin_requested(&mut self, rid: String) {
        self.twin_gets.insert(rid);
    }

    /// True (once) when `rid` answers a full-twin GET.
    fn take_twin_get(&mut self, rid: &str) -> bool {
        self.twin_gets.remove(rid)
    }
}

/// What an inbound publish is, by topic.
#[derive(Debug, PartialEq)]
enum Route<'a> {
    DesiredPatch,
    TwinResponse { status: u16, rid: &'a str },
    Method { name: &'a str, rid: &'a str },
    CloudMessage { properties: Vec<(String, String)> },
    Unknown,
}

fn classify<'a>(device_id: &str, topic: &'a str) -> Route<'a> {
    if topic.starts_with(DESIRED_PREFIX) {
        Route::DesiredPatch
    } else if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let status = rest
            .split('/')
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        match query_param(topic, "$rid") {
            Some(rid) => Route::TwinResponse { status, rid },
            None => Route::Unknown,
        }
    } else if let Some(rest) = topic.strip_prefix(METHOD_PREFIX) {
        Route::Method {
            name: rest.split('/').next().unwrap_or_default(),
            rid: query_param(topic, "$rid").unwrap_or_default(),
        }
    } else if let Some(rest) = topic
        .strip_prefix("devices/")
        .and_then(|t| t.strip_prefix(device_id))
        .and_then(|t| t.strip_prefix("/messages/devicebound/"))
    {
        Route::CloudMessage {
            properties: parse_property_bag(rest),
        }
    } else {
        Route::Unknown
    }
}

/// The `desired` section of a full twin GET answer.
fn desired_from_twin(status: u16, payload: &str) -> Option<serde_json::Value> {
    if status != 200 {
        tracing::warn!(status, "twin request rejected");
        return None;
    }
    let desired = serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|mut twin| twin.get_mut("desired").map(serde_json::Value::take));
    if desired.is_none() {
        tracing::warn!("twin document without desired section");
    }
    desired
}

fn method_response_topic(status: u16, rid: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, rid)
}

// ==============================================================================
// actor
// ==============================================================================

struct MqttActor {
    conn: ConnectionString,
    username: String,
    ttl: Duration,
    retry: Duration,
    client: AsyncClient,
    eventloop: EventLoop,
    cmd_rx: mpsc::Receiver<Cmd>,
    events: mpsc::Sender<TransportEvent>,
    correlator: Correlator,
    next_request: Arc<AtomicU64>,
    connected: bool,
    /// set after a connection error, the broker is not polled before it
    backoff: Option<Instant>,
}

#[derive(Debug, PartialEq)]
enum Step {
    Continue,
    Stop,
}

impl MqttActor {
    async fn run(mut self) {
        loop {
            let backoff = self.backoff;
            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => Step::Stop,
                },
                event = self.eventloop.poll(), if backoff.is_none() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(err) => self.handle_error(err),
                },
                _ = tokio::time::sleep_until(backoff.unwrap_or_else(Instant::now)), if backoff.is_some() => {
                    self.backoff = None;
                    Step::Continue
                }
            };
            if step == Step::Stop || self.events.is_closed() {
                break;
            }
        }
        tracing::debug!("mqtt actor stopped");
    }

    fn handle_cmd(&mut self, cmd: Cmd) -> Step {
        match cmd {
            Cmd::Publish { message, resp } => {
                let topic = telemetry_topic(&self.conn.device_id, &message);
                let result = self
                    .client
                    .try_publish(topic, QoS::AtLeastOnce, false, message.body.into_bytes())
                    .map_err(TransportError::from);
                if result.is_ok() {
                    self.correlator.queued(message.id);
                }
                let _ = resp.send(result);
                Step::Continue
            }
            Cmd::Report {
                request_id,
                body,
                resp,
            } => {
                let topic = format!("$iothub/twin/PATCH/properties/reported/?$rid={}", request_id);
                let result = self
                    .client
                    .try_publish(topic, QoS::AtMostOnce, false, body)
                    .map_err(TransportError::from);
                let _ = resp.send(result);
                Step::Continue
            }
            Cmd::Close { resp } => {
                if let Err(e) = self.client.try_disconnect() {
                    tracing::debug!("mqtt disconnect: {}", e);
                }
                let _ = resp.send(());
                Step::Stop
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Step {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.connected = true;
                tracing::info!(host = %self.conn.host_name, "mqtt connected");
                self.subscribe_all();
                self.emit(TransportEvent::Connection {
                    status: ConnectionStatus::Connected,
                    reason: "connection accepted".into(),
                })
            }
            Event::Incoming(Packet::Publish(publish)) => self.route(publish),
            Event::Incoming(Packet::PubAck(ack)) => match self.correlator.acked(ack.pkid) {
                Some(id) => self.emit(TransportEvent::Delivered {
                    id,
                    outcome: DeliveryOutcome::Ok,
                }),
                None => {
                    tracing::debug!(pkid = ack.pkid, "PUBACK for unknown packet");
                    Step::Continue
                }
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if let Some(id) = self.correlator.outgoing(pkid) {
                    tracing::trace!(pkid, id = %id, "telemetry on the wire");
                }
                Step::Continue
            }
            _ => Step::Continue,
        }
    }

    fn handle_error(&mut self, err: ConnectionError) -> Step {
        if let ConnectionError::ConnectionRefused(code) = &err {
            if matches!(
                code,
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
            ) {
                self.emit_fatal(format!("connection refused: {:?}", code));
                return Step::Stop;
            }
        }

        tracing::warn!("mqtt connection error: {}", err);
        if self.connected {
            self.connected = false;
            let step = self.emit(TransportEvent::Connection {
                status: ConnectionStatus::Disconnected,
                reason: err.to_string(),
            });
            if step == Step::Stop {
                return step;
            }
        }

        // a device key lets us mint a fresh token for the reconnect
        match self.conn.token(self.ttl) {
            Ok(token) => {
                self.eventloop
                    .mqtt_options
                    .set_credentials(self.username.clone(), token);
            }
            Err(e) => tracing::warn!("token refresh failed: {}", e),
        }

        self.backoff = Some(Instant::now() + self.retry);
        Step::Continue
    }

    fn subscribe_all(&mut self) {
        let topics = [
            (format!("devices/{}/messages/devicebound/#", self.conn.device_id), QoS::AtLeastOnce),
            (format!("{}#", DESIRED_PREFIX), QoS::AtMostOnce),
            (format!("{}#", TWIN_RESPONSE_PREFIX), QoS::AtMostOnce),
            (format!("{}#", METHOD_PREFIX), QoS::AtMostOnce),
        ];
        for (topic, qos) in topics {
            if let Err(e) = self.client.try_subscribe(topic.clone(), qos) {
                tracing::error!("subscribe to {} failed: {}", topic, e);
            }
        }

        // the full twin carries desired values set while we were offline
        let rid = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
        let topic = format!("$iothub/twin/GET/?$rid={}", rid);
        match self.client.try_publish(topic, QoS::AtMostOnce, false, Vec::new()) {
            Ok(()) => self.correlator.twin_requested(rid),
            Err(e) => tracing::warn!("twin request failed: {}", e),
        }
    }

    fn route(&mut self, publish: Publish) -> Step {
        let payload = String::from_utf8_lossy(&publish.payload).into_owned();

        match classify(&self.conn.device_id, &publish.topic) {
            Route::DesiredPatch => match serde_json::from_str(&payload) {
                Ok(payload) => self.emit(TransportEvent::DesiredState {
                    payload,
                    complete: false,
                }),
                Err(e) => {
                    tracing::warn!("unparseable desired patch: {}", e);
                    Step::Continue
                }
            },
            Route::TwinResponse { status, rid } => {
                if self.correlator.take_twin_get(rid) {
                    match desired_from_twin(status, &payload) {
                        Some(payload) => self.emit(TransportEvent::DesiredState {
                            payload,
                            complete: true,
                        }),
                        None => Step::Continue,
                    }
                } else {
                    self.emit(TransportEvent::ReportAck {
                        request_id: rid.to_string(),
                        status,
                    })
                }
            }
            Route::Method { name, rid } => {
                let (respond, answer) = oneshot::channel::<MethodResponse>();

                // answer from a separate task so a slow handler never stalls the actor
                let client = self.client.clone();
                let request_id = rid.to_string();
                tokio::spawn(async move {
                    let Ok(response) = answer.await else {
                        tracing::warn!(rid = %request_id, "method dropped without response");
                        return;
                    };
                    let topic = method_response_topic(response.status, &request_id);
                    if let Err(e) = client
                        .publish(topic, QoS::AtMostOnce, false, response.body.into_bytes())
                        .await
                    {
                        tracing::error!("method response not sent: {}", e);
                    }
                });

                self.emit(TransportEvent::DirectMethod(MethodCall {
                    request_id: rid.to_string(),
                    name: name.to_string(),
                    payload,
                    respond,
                }))
            }
            Route::CloudMessage { properties } => self.emit(TransportEvent::CloudMessage {
                body: payload,
                properties,
            }),
            Route::Unknown => {
                tracing::debug!(topic = %publish.topic, "ignoring publish on unexpected topic");
                Step::Continue
            }
        }
    }

    /// Hand an event to the dispatcher without waiting. A full queue drops
    /// the event; unconfirmed telemetry then expires through the ledger.
    fn emit(&self, event: TransportEvent) -> Step {
        match self.events.try_send(event) {
            Ok(()) => Step::Continue,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "event queue full, event dropped");
                Step::Continue
            }
            Err(TrySendError::Closed(_)) => Step::Stop,
        }
    }

    /// Fatal events must not be lost to a full queue, the actor stops right
    /// after so the send is finished by a detached task.
    fn emit_fatal(&self, reason: String) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(TransportEvent::Fatal(reason)).await;
        });
    }
}

/// `devices/{id}/messages/events/` plus the url-encoded property bag.
fn telemetry_topic(device_id: &str, message: &OutboundMessage) -> String {
    format!(
        "devices/{}/messages/events/$.mid={}&$.cid={}&$.ct=application%2Fjson&$.ce=utf-8&temperatureAlert={}",
        device_id,
        url_encode(&message.id.message_tag()),
        url_encode(message.correlation_id.as_str()),
        message.properties.temperature_alert
    )
}

/// Value of `key` in the `?a=1&b=2` tail of a topic.
fn query_param<'a>(topic: &'a str, key: &str) -> Option<&'a str> {
    let (_, query) = topic.split_once('?')?;
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Reading;
    use rumqttc::PubAck;

    fn actor_with_events(capacity: usize) -> (MqttActor, mpsc::Sender<Cmd>, mpsc::Receiver<TransportEvent>) {
        let conn = ConnectionString::parse("HostName=hub.example;DeviceId=pi-01;SharedAccessKey=a2V5").unwrap();
        // never polled, so nothing connects
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("pi-01", "localhost", 1883), 16);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (events, rx) = mpsc::channel(capacity);
        let actor = MqttActor {
            conn,
            username: "hub.example/pi-01/?api-version=x".into(),
            ttl: Duration::from_secs(3600),
            retry: Duration::from_secs(5),
            client,
            eventloop,
            cmd_rx,
            events,
            correlator: Correlator::default(),
            next_request: Arc::new(AtomicU64::new(1)),
            connected: true,
            backoff: None,
        };
        (actor, cmd_tx, rx)
    }

    fn message(id: u64) -> OutboundMessage {
        let reading = Reading {
            humidity_temp: 20.0,
            pressure_temp: 20.0,
            cpu_temp: 40.0,
            corrected_temp: 8.3,
            pressure: 1000.0,
            humidity: 50.0,
        };
        OutboundMessage::new(MessageId(id), &reading, id % 2 == 0).unwrap()
    }

    #[test]
    fn telemetry_topic_carries_ids_and_alert() {
        assert_eq!(
            telemetry_topic("pi-01", &message(12)),
            "devices/pi-01/messages/events/$.mid=message_12&$.cid=correlation_12\
             &$.ct=application%2Fjson&$.ce=utf-8&temperatureAlert=true"
        );
    }

    #[test]
    fn query_params_from_topics() {
        let topic = "$iothub/twin/res/204/?$rid=7&$version=3";
        assert_eq!(query_param(topic, "$rid"), Some("7"));
        assert_eq!(query_param(topic, "$version"), Some("3"));
        assert_eq!(query_param(topic, "missing"), None);
        assert_eq!(query_param("$iothub/methods/POST/x/", "$rid"), None);
    }

    // ==============================================================================
    // correlation
    // ==============================================================================

    #[test]
    fn packet_ids_bind_in_queue_order() {
        let mut c = Correlator::default();
        c.queued(MessageId(0));
        c.queued(MessageId(1));
        assert_eq!(c.outgoing(1), Some(MessageId(0)));
        assert_eq!(c.outgoing(2), Some(MessageId(1)));

        // acks may arrive in any order
        assert_eq!(c.acked(2), Some(MessageId(1)));
        assert_eq!(c.acked(1), Some(MessageId(0)));
        assert_eq!(c.acked(1), None);
    }

    #[test]
    fn retransmission_and_qos0_do_not_consume_the_queue() {
        let mut c = Correlator::default();
        c.queued(MessageId(5));
        c.queued(MessageId(6));
        assert_eq!(c.outgoing(0), None);
        assert_eq!(c.outgoing(9), Some(MessageId(5)));
        // same pkid again after a reconnect
        assert_eq!(c.outgoing(9), None);
        assert_eq!(c.outgoing(10), Some(MessageId(6)));
        assert_eq!(c.outgoing(11), None);
    }

    #[test]
    fn twin_get_request_ids_are_taken_once() {
        let mut c = Correlator::default();
        c.twin_requested("3".into());
        assert!(!c.take_twin_get("4"));
        assert!(c.take_twin_get("3"));
        assert!(!c.take_twin_get("3"));
    }

    #[test]
    fn topics_classify_by_prefix() {
        assert_eq!(
            classify("pi-01", "$iothub/twin/PATCH/properties/desired/?$version=4"),
            Route::DesiredPatch
        );
        assert_eq!(
            classify("pi-01", "$iothub/twin/res/200/?$rid=1"),
            Route::TwinResponse { status: 200, rid: "1" }
        );
        assert_eq!(classify("pi-01", "$iothub/twin/res/204/"), Route::Unknown);
        assert_eq!(
            classify("pi-01", "$iothub/methods/POST/blink/?$rid=9"),
            Route::Method { name: "blink", rid: "9" }
        );
        assert_eq!(
            classify("pi-01", "devices/pi-01/messages/devicebound/%24.mid=m1&color=red"),
            Route::CloudMessage {
                properties: parse_property_bag("%24.mid=m1&color=red"),
            }
        );
        assert_eq!(classify("pi-01", "devices/pi-02/messages/devicebound/"), Route::Unknown);
        assert_eq!(classify("pi-01", "something/else"), Route::Unknown);
    }

    #[test]
    fn full_twin_yields_desired_section() {
        let twin = r#"{"desired":{"sendInterval":5,"$version":2},"reported":{}}"#;
        let desired = desired_from_twin(200, twin).unwrap();
        assert_eq!(desired["sendInterval"], 5);
        assert!(desired_from_twin(200, r#"{"reported":{}}"#).is_none());
        assert!(desired_from_twin(404, twin).is_none());
        assert!(desired_from_twin(200, "not json").is_none());
    }

    #[test]
    fn method_reply_topic() {
        assert_eq!(method_response_topic(404, "12"), "$iothub/methods/res/404/?$rid=12");
    }

    // ==============================================================================
    // actor
    // ==============================================================================

    #[tokio::test]
    async fn puback_settles_the_bound_message() {
        let (mut actor, _cmd, mut rx) = actor_with_events(8);
        let (resp, answer) = oneshot::channel();
        actor.handle_cmd(Cmd::Publish { message: message(3), resp });
        answer.await.unwrap().unwrap();

        actor.handle_event(Event::Outgoing(Outgoing::Publish(7)));
        actor.handle_event(Event::Incoming(Packet::PubAck(PubAck::new(99))));
        actor.handle_event(Event::Incoming(Packet::PubAck(PubAck::new(7))));

        match rx.try_recv() {
            Ok(TransportEvent::Delivered { id, outcome }) => {
                assert_eq!(id, MessageId(3));
                assert_eq!(outcome, DeliveryOutcome::Ok);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn twin_answers_split_by_request_id() {
        let (mut actor, _cmd, mut rx) = actor_with_events(8);
        actor.correlator.twin_requested("1".into());

        let twin = Publish::new("$iothub/twin/res/200/?$rid=1", QoS::AtMostOnce, r#"{"desired":{"tempAlert":25}}"#);
        let ack = Publish::new("$iothub/twin/res/204/?$rid=2", QoS::AtMostOnce, "");
        actor.handle_event(Event::Incoming(Packet::Publish(twin)));
        actor.handle_event(Event::Incoming(Packet::Publish(ack)));

        match rx.try_recv() {
            Ok(TransportEvent::DesiredState { payload, complete }) => {
                assert!(complete);
                assert_eq!(payload["tempAlert"], 25);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx.try_recv() {
            Ok(TransportEvent::ReportAck { request_id, status }) => {
                assert_eq!(request_id, "2");
                assert_eq!(status, 204);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn method_call_is_forwarded_with_reply_channel() {
        let (mut actor, _cmd, mut rx) = actor_with_events(8);
        let call = Publish::new("$iothub/methods/POST/blink/?$rid=4", QoS::AtMostOnce, "{}");
        assert_eq!(actor.route(call), Step::Continue);
        match rx.try_recv() {
            Ok(TransportEvent::DirectMethod(call)) => {
                assert_eq!(call.name, "blink");
                assert_eq!(call.request_id, "4");
                assert_eq!(call.payload, "{}");
                assert!(call.respond.send(MethodResponse::for_method("blink", 200)).is_ok());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_event_queue_drops_instead_of_waiting() {
        let (mut actor, _cmd, mut rx) = actor_with_events(1);
        let c2d = |n: u8| {
            Publish::new(
                "devices/pi-01/messages/devicebound/",
                QoS::AtLeastOnce,
                vec![b'0' + n],
            )
        };
        assert_eq!(actor.route(c2d(1)), Step::Continue);
        assert_eq!(actor.route(c2d(2)), Step::Continue);

        match rx.try_recv() {
            Ok(TransportEvent::CloudMessage { body, .. }) => assert_eq!(body, "1"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert_eq!(actor.route(c2d(3)), Step::Stop);
    }

    #[tokio::test]
    async fn connection_error_backs_off_without_blocking() {
        let (mut actor, _cmd, mut rx) = actor_with_events(8);
        let err = ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"));
        assert_eq!(actor.handle_error(err), Step::Continue);
        assert!(actor.backoff.is_some());
        assert!(!actor.connected);
        match rx.try_recv() {
            Ok(TransportEvent::Connection { status, .. }) => {
                assert_eq!(status, ConnectionStatus::Disconnected)
            }
            other => panic!("unexpected event {:?}", other),
        }

        // only the transition is reported
        let err = ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"));
        actor.handle_error(err);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let (mut actor, _cmd, mut rx) = actor_with_events(8);
        let err = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(actor.handle_error(err), Step::Stop);
        match rx.recv().await {
            Some(TransportEvent::Fatal(reason)) => assert!(reason.contains("NotAuthorized")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn commands_are_served_during_backoff() {
        let (mut actor, cmd_tx, _rx) = actor_with_events(8);
        actor.backoff = Some(Instant::now() + Duration::from_secs(3600));
        let task = tokio::spawn(actor.run());
        let transport = MqttTransport {
            cmd_tx,
            next_request: Arc::new(AtomicU64::new(1)),
        };

        let published = tokio::time::timeout(Duration::from_secs(5), transport.publish(message(1))).await;
        assert!(matches!(published, Ok(Ok(()))));
        let state = ReportedState {
            runtime_version: "v".into(),
            platform_version: "p".into(),
            send_interval: 10,
            temp_alert: 20.0,
        };
        let rid = transport.report_state(&state).await.unwrap();
        assert_eq!(rid.as_deref(), Some("1"));

        transport.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
