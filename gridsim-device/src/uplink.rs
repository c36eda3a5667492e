//! Telemetry uplink session: the per-worker MQTT state machine.
//!
//! Connection establishment blocks on the broker's ConnAck with a bounded
//! timeout; unexpected drops hand over to a background reconnection loop
//! with exponential backoff; a heartbeat loop keeps idle sessions visibly
//! alive; registration with the remote platform happens at most once per
//! device identity unless forced.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use gridsim_core::link::{LinkError, TelemetryLink};
use gridsim_core::models::MeasurementSample;
use gridsim_core::settings::UplinkSettings;
use gridsim_core::smartrest;
use gridsim_core::status::StatusStore;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_BASE_SECS: u64 = 5;
pub const RECONNECT_CEILING_SECS: u64 = 300;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 50;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const RESTART_SIMULATION_DELAY: Duration = Duration::from_secs(2);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Why a connection attempt did not end in a usable session. Broker
/// refusals are kept distinct so operators can tell a typoed tenant from a
/// broker outage.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("broker refused connection: protocol version mismatch")]
    ProtocolMismatch,
    #[error("broker refused connection: bad client identifier")]
    BadClientId,
    #[error("broker refused connection: service unavailable")]
    ServiceUnavailable,
    #[error("broker refused connection: bad credentials")]
    BadCredentials,
    #[error("broker refused connection: not authorized")]
    NotAuthorized,
    #[error("no broker acknowledgment within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("TLS material unreadable: {0}")]
    Tls(String),
}

fn refusal_reason(code: ConnectReturnCode) -> Option<ConnectError> {
    match code {
        ConnectReturnCode::Success => None,
        ConnectReturnCode::RefusedProtocolVersion => Some(ConnectError::ProtocolMismatch),
        ConnectReturnCode::BadClientId => Some(ConnectError::BadClientId),
        ConnectReturnCode::ServiceUnavailable => Some(ConnectError::ServiceUnavailable),
        ConnectReturnCode::BadUserNamePassword => Some(ConnectError::BadCredentials),
        ConnectReturnCode::NotAuthorized => Some(ConnectError::NotAuthorized),
    }
}

/// Delay before reconnect attempt `attempt` (1-based): base 5s doubling up
/// to the 300s ceiling.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let secs = RECONNECT_BASE_SECS
        .saturating_mul(1u64 << exp)
        .min(RECONNECT_CEILING_SECS);
    Duration::from_secs(secs)
}

/// The session's shared mutable state. Every background loop and the
/// sampling thread synchronize through these flags alone.
#[derive(Default)]
struct SessionFlags {
    connected: AtomicBool,
    registered: AtomicBool,
    auto_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
    last_heartbeat_at: Mutex<Option<DateTime<Utc>>>,
}

/// Thin `TelemetryLink` over the real MQTT client.
struct MqttLink {
    client: AsyncClient,
}

#[async_trait]
impl TelemetryLink for MqttLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), LinkError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
            .map_err(|e| LinkError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| LinkError::Subscribe(e.to_string()))
    }
}

pub struct UplinkSession {
    device_id: String,
    settings: UplinkSettings,
    store: StatusStore,
    flags: SessionFlags,
    link: Mutex<Option<Arc<dyn TelemetryLink>>>,
    client: Mutex<Option<AsyncClient>>,
    // Handle on ourselves for the background tasks connect() spawns.
    me: Weak<UplinkSession>,
}

impl UplinkSession {
    /// Build a disconnected session and start its heartbeat loop.
    pub fn new(device_id: String, settings: UplinkSettings, store: StatusStore) -> Arc<Self> {
        let session = Arc::new_cyclic(|me| Self {
            device_id,
            settings,
            store,
            flags: SessionFlags {
                auto_reconnect: AtomicBool::new(true),
                ..SessionFlags::default()
            },
            link: Mutex::new(None),
            client: Mutex::new(None),
            me: me.clone(),
        });
        Self::spawn_heartbeat_loop(Arc::clone(&session));
        session
    }

    /// Session attached to an existing transport, already connected. Used by
    /// the devkit tests; no background loops are started.
    pub fn with_link(
        device_id: String,
        settings: UplinkSettings,
        store: StatusStore,
        link: Arc<dyn TelemetryLink>,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|me| Self {
            device_id,
            settings,
            store,
            flags: SessionFlags::default(),
            link: Mutex::new(Some(link)),
            client: Mutex::new(None),
            me: me.clone(),
        });
        session.flags.connected.store(true, Ordering::SeqCst);
        session
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.flags.registered.load(Ordering::SeqCst)
    }

    /// Open the broker connection and wait for its acknowledgment, bounded
    /// by `CONNECT_TIMEOUT`. Refusal reasons land in the log; the caller
    /// only sees success or failure.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "uplink connect failed");
                false
            }
        }
    }

    async fn try_connect(&self) -> Result<(), ConnectError> {
        let Some(session) = self.me.upgrade() else {
            return Err(ConnectError::Transport("session dropped".to_string()));
        };
        let options = self.mqtt_options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (ack_tx, ack_rx) = oneshot::channel::<Result<(), ConnectError>>();
        tokio::spawn(async move {
            // Drives the network event loop for this connection. Resolves
            // the pending connect() on the first ConnAck, then stays around
            // for inbound operations until the connection drops.
            let mut ack_tx = Some(ack_tx);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => match refusal_reason(ack.code) {
                        None => {
                            session.flags.connected.store(true, Ordering::SeqCst);
                            session.flags.reconnect_attempts.store(0, Ordering::SeqCst);
                            info!(device_id = %session.device_id, "connected to telemetry broker");
                            if let Some(tx) = ack_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        Some(reason) => {
                            session.flags.connected.store(false, Ordering::SeqCst);
                            if let Some(tx) = ack_tx.take() {
                                let _ = tx.send(Err(reason));
                            }
                            break;
                        }
                    },
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic == smartrest::TOPIC_COMMANDS {
                            let payload = String::from_utf8_lossy(&publish.payload).to_string();
                            Arc::clone(&session).handle_command(payload);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let was_connected =
                            session.flags.connected.swap(false, Ordering::SeqCst);
                        if let Some(tx) = ack_tx.take() {
                            let _ = tx.send(Err(ConnectError::Transport(e.to_string())));
                        } else if was_connected {
                            warn!(
                                device_id = %session.device_id,
                                error = %e,
                                "unexpected disconnect from telemetry broker"
                            );
                            if session.flags.auto_reconnect.load(Ordering::SeqCst) {
                                Arc::clone(&session).spawn_reconnect_loop();
                            }
                        }
                        // A fresh client is built per attempt; the library's
                        // own retry-on-poll stays out of the picture.
                        break;
                    }
                }
            }
        });

        match tokio::time::timeout(CONNECT_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                *self.link.lock() = Some(Arc::new(MqttLink {
                    client: client.clone(),
                }));
                *self.client.lock() = Some(client);
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                let _ = client.disconnect().await;
                Err(reason)
            }
            Ok(Err(_)) => {
                let _ = client.disconnect().await;
                Err(ConnectError::Transport("connection task ended".to_string()))
            }
            Err(_) => {
                let _ = client.disconnect().await;
                Err(ConnectError::Timeout(CONNECT_TIMEOUT))
            }
        }
    }

    fn mqtt_options(&self) -> Result<MqttOptions, ConnectError> {
        // Timestamp suffix keeps the client id unique across quick restarts.
        let client_id = format!("{}_{}", self.device_id, Utc::now().timestamp());
        let mut options = MqttOptions::new(
            client_id,
            &self.settings.broker_host,
            self.settings.effective_port(),
        );
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if !self.settings.username.is_empty() {
            options.set_credentials(
                self.settings.qualified_username(),
                self.settings.password.clone(),
            );
        }
        if self.settings.use_ssl {
            let ca_path = self
                .settings
                .ca_path
                .as_deref()
                .ok_or_else(|| ConnectError::Tls("ca_path not configured".to_string()))?;
            let ca = std::fs::read(ca_path)
                .map_err(|e| ConnectError::Tls(format!("{ca_path}: {e}")))?;
            let client_auth = match (
                self.settings.client_cert_path.as_deref(),
                self.settings.client_key_path.as_deref(),
            ) {
                (Some(cert), Some(key)) => {
                    let cert = std::fs::read(cert)
                        .map_err(|e| ConnectError::Tls(format!("{cert}: {e}")))?;
                    let key = std::fs::read(key)
                        .map_err(|e| ConnectError::Tls(format!("{key}: {e}")))?;
                    Some((cert, key))
                }
                _ => None,
            };
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }
        Ok(options)
    }

    /// Register this device with the remote platform. Skipped (but still
    /// re-subscribing to the command channel) when a registration record
    /// already exists and `force` is off.
    pub async fn register(&self, device_type: &str, device_name: &str, force: bool) -> bool {
        if !force {
            match self.store.registration(&self.device_id) {
                Ok(Some(reg)) if reg.registered => {
                    info!(
                        device_id = %self.device_id,
                        remote_name = reg.device_name.as_deref().unwrap_or(device_name),
                        "device already registered, skipping registration publish"
                    );
                    if let Err(e) = self.subscribe_commands().await {
                        warn!(device_id = %self.device_id, error = %e, "command re-subscribe failed");
                    }
                    self.flags.registered.store(true, Ordering::SeqCst);
                    return true;
                }
                Err(e) => {
                    warn!(device_id = %self.device_id, error = %e, "registration record unreadable, registering anyway");
                }
                _ => {}
            }
        }

        let Some(link) = self.current_link() else {
            warn!(device_id = %self.device_id, "cannot register while disconnected");
            return false;
        };
        let row = smartrest::registration(device_name, device_type);
        match link
            .publish(&smartrest::inventory_topic(&self.device_id), &row)
            .await
        {
            Ok(()) => {
                self.touch_last_message();
                if let Err(e) =
                    self.store
                        .mark_registered(&self.device_id, device_name, &Utc::now().to_rfc3339())
                {
                    warn!(device_id = %self.device_id, error = %e, "failed to persist registration record");
                }
                if let Err(e) = self.subscribe_commands().await {
                    warn!(device_id = %self.device_id, error = %e, "command subscribe failed");
                }
                self.flags.registered.store(true, Ordering::SeqCst);
                info!(device_id = %self.device_id, remote_name = device_name, "device registered");
                true
            }
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "registration publish failed");
                false
            }
        }
    }

    /// Forward one sample. Disconnected sessions get a single inline
    /// reconnect attempt (unless the background loop is already at it)
    /// before reporting failure; forwarding loss is acceptable.
    pub async fn send_measurement(&self, sample: &MeasurementSample) -> bool {
        if !self.is_connected() {
            let can_retry_inline = self.flags.auto_reconnect.load(Ordering::SeqCst)
                && !self.flags.reconnecting.load(Ordering::SeqCst);
            if !can_retry_inline {
                debug!(device_id = %self.device_id, "not connected, dropping measurement");
                return false;
            }
            debug!(device_id = %self.device_id, "not connected, trying a single inline reconnect");
            if let Err(e) = self.try_connect().await {
                warn!(device_id = %self.device_id, error = %e, "inline reconnect failed");
                return false;
            }
            if self.is_registered() {
                if let Err(e) = self.subscribe_commands().await {
                    warn!(device_id = %self.device_id, error = %e, "command re-subscribe failed");
                }
            }
        }

        let Some(link) = self.current_link() else {
            return false;
        };
        let mut published = 0;
        for row in smartrest::measurement_rows(sample) {
            match link.publish(smartrest::TOPIC_MEASUREMENTS, &row).await {
                Ok(()) => published += 1,
                Err(e) => error!(device_id = %self.device_id, error = %e, "measurement publish failed"),
            }
        }
        if published > 0 {
            self.touch_last_message();
            true
        } else {
            false
        }
    }

    /// Raise an alarm on the remote platform.
    pub async fn send_alarm(&self, alarm_type: &str, text: &str, severity: &str) -> bool {
        let Some(link) = self.current_link() else {
            warn!(device_id = %self.device_id, "cannot send alarm while disconnected");
            return false;
        };
        match link
            .publish(
                smartrest::TOPIC_MEASUREMENTS,
                &smartrest::alarm(alarm_type, text, severity),
            )
            .await
        {
            Ok(()) => {
                self.touch_last_message();
                info!(device_id = %self.device_id, alarm_type, "alarm sent");
                true
            }
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "alarm publish failed");
                false
            }
        }
    }

    /// Graceful teardown: turns auto-reconnect off for good and resets the
    /// connection state.
    pub async fn disconnect(&self) {
        self.flags.auto_reconnect.store(false, Ordering::SeqCst);
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!(device_id = %self.device_id, error = %e, "disconnect request failed");
            }
        }
        *self.link.lock() = None;
        self.flags.connected.store(false, Ordering::SeqCst);
        self.flags.registered.store(false, Ordering::SeqCst);
        info!(device_id = %self.device_id, "uplink disconnected");
    }

    fn spawn_reconnect_loop(self: Arc<Self>) {
        // Single loop instance at a time.
        if self.flags.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            loop {
                if !self.flags.auto_reconnect.load(Ordering::SeqCst) {
                    break;
                }
                let attempt = self.flags.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    self.flags.auto_reconnect.store(false, Ordering::SeqCst);
                    error!(
                        device_id = %self.device_id,
                        attempts = MAX_RECONNECT_ATTEMPTS,
                        "giving up on uplink reconnection"
                    );
                    break;
                }
                let delay = backoff_delay(attempt);
                info!(
                    device_id = %self.device_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "scheduling uplink reconnect"
                );
                tokio::time::sleep(delay).await;
                match self.try_connect().await {
                    Ok(()) => {
                        self.flags.reconnect_attempts.store(0, Ordering::SeqCst);
                        if self.is_registered() {
                            if let Err(e) = self.subscribe_commands().await {
                                warn!(device_id = %self.device_id, error = %e, "command re-subscribe failed");
                            }
                        }
                        info!(device_id = %self.device_id, "uplink re-established");
                        break;
                    }
                    Err(e) => {
                        warn!(device_id = %self.device_id, attempt, error = %e, "reconnect attempt failed");
                    }
                }
            }
            self.flags.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    fn spawn_heartbeat_loop(session: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                if !session.is_connected() || !session.heartbeat_due(Utc::now()) {
                    continue;
                }
                let Some(link) = session.current_link() else {
                    continue;
                };
                match link
                    .publish(smartrest::TOPIC_MEASUREMENTS, &smartrest::heartbeat_event())
                    .await
                {
                    Ok(()) => {
                        *session.flags.last_heartbeat_at.lock() = Some(Utc::now());
                        debug!(device_id = %session.device_id, "heartbeat sent");
                    }
                    Err(e) => {
                        // The broker-level disconnect callback stays the
                        // authority on connection state.
                        warn!(device_id = %session.device_id, error = %e, "heartbeat publish failed");
                    }
                }
            }
        });
    }

    /// A heartbeat is due when nothing has gone out, heartbeats included,
    /// within the last interval.
    fn heartbeat_due(&self, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(HEARTBEAT_INTERVAL)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let fresh = |at: Option<DateTime<Utc>>| at.map_or(false, |at| now - at < window);
        !(fresh(*self.flags.last_message_at.lock())
            || fresh(*self.flags.last_heartbeat_at.lock()))
    }

    fn handle_command(self: Arc<Self>, payload: String) {
        if !smartrest::is_restart_command(&payload) {
            debug!(device_id = %self.device_id, payload = %payload, "ignoring unsupported operation");
            return;
        }
        info!(device_id = %self.device_id, "restart operation received");
        tokio::spawn(async move {
            self.run_restart_simulation().await;
        });
    }

    /// Scripted restart: acknowledge, pretend to restart, report done. The
    /// process itself never restarts.
    pub(crate) async fn run_restart_simulation(&self) {
        let Some(link) = self.current_link() else {
            return;
        };
        if let Err(e) = link
            .publish(smartrest::TOPIC_MEASUREMENTS, smartrest::RESTART_ACK)
            .await
        {
            error!(device_id = %self.device_id, error = %e, "restart acknowledge failed");
            return;
        }
        tokio::time::sleep(RESTART_SIMULATION_DELAY).await;
        if let Err(e) = link
            .publish(smartrest::TOPIC_MEASUREMENTS, smartrest::RESTART_COMPLETE)
            .await
        {
            error!(device_id = %self.device_id, error = %e, "restart completion failed");
            return;
        }
        info!(device_id = %self.device_id, "restart simulation complete");
    }

    async fn subscribe_commands(&self) -> Result<(), LinkError> {
        let Some(link) = self.current_link() else {
            return Err(LinkError::NotConnected);
        };
        link.subscribe(smartrest::TOPIC_COMMANDS).await
    }

    fn current_link(&self) -> Option<Arc<dyn TelemetryLink>> {
        self.link.lock().clone()
    }

    fn touch_last_message(&self) {
        *self.flags.last_message_at.lock() = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsim_core::status::STATUS_FILE;
    use gridsim_devkit::mqtt_stub::MqttStub;
    use gridsim_devkit::test_utils::{enabled_uplink_settings, sample, TestDataDir};

    fn stub_session(data: &TestDataDir, device_id: &str) -> (Arc<UplinkSession>, MqttStub) {
        let stub = MqttStub::new();
        let session = UplinkSession::with_link(
            device_id.to_string(),
            enabled_uplink_settings(),
            data.status_store(),
            Arc::new(stub.clone()),
        );
        (session, stub)
    }

    #[test]
    fn backoff_doubles_from_base_to_ceiling() {
        let delays: Vec<u64> = (1..=5).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
        assert_eq!(backoff_delay(7).as_secs(), 300); // 320 capped
        assert_eq!(backoff_delay(50).as_secs(), 300);
    }

    #[tokio::test]
    async fn register_publishes_once_then_short_circuits() {
        let data = TestDataDir::new();
        let (session, stub) = stub_session(&data, "pv001");

        assert!(session.register("PV", "iot_sim_pv001", false).await);
        assert!(session.register("PV", "iot_sim_pv001", false).await);

        let registrations = stub.messages_on("s/ud/pv001");
        assert_eq!(registrations, vec!["100,iot_sim_pv001,PV".to_string()]);
        // Both calls re-subscribe to the command channel.
        assert_eq!(stub.subscriptions(), vec!["s/ds".to_string(), "s/ds".to_string()]);
        assert!(session.is_registered());
    }

    #[tokio::test]
    async fn registration_survives_a_new_session() {
        let data = TestDataDir::new();
        let (first, stub) = stub_session(&data, "heatpump001");
        assert!(first.register("Heat Pump", "iot_sim_heatpump001", false).await);
        assert_eq!(stub.messages_on("s/ud/heatpump001").len(), 1);

        // A later worker process for the same device identity.
        let (second, stub2) = stub_session(&data, "heatpump001");
        assert!(second.register("Heat Pump", "iot_sim_heatpump001", false).await);
        assert!(stub2.messages_on("s/ud/heatpump001").is_empty());
    }

    #[tokio::test]
    async fn forced_registration_republishes() {
        let data = TestDataDir::new();
        let (session, stub) = stub_session(&data, "pv001");

        assert!(session.register("PV", "iot_sim_pv001", false).await);
        assert!(session.register("PV", "iot_sim_pv001", true).await);
        assert_eq!(stub.messages_on("s/ud/pv001").len(), 2);
    }

    #[tokio::test]
    async fn failed_registration_reports_false_and_persists_nothing() {
        let data = TestDataDir::new();
        let (session, stub) = stub_session(&data, "pv001");
        stub.set_fail_publishes(true);

        assert!(!session.register("PV", "iot_sim_pv001", false).await);
        assert!(!session.is_registered());
        assert_eq!(data.status_store().registration("pv001").unwrap(), None);
        assert!(!data.path().join(STATUS_FILE).exists());
    }

    #[tokio::test]
    async fn send_measurement_publishes_all_four_rows() {
        let data = TestDataDir::new();
        let (session, stub) = stub_session(&data, "pv001");

        let s = sample("pv001", Utc::now(), 0.125);
        assert!(session.send_measurement(&s).await);

        let rows = stub.messages_on(smartrest::TOPIC_MEASUREMENTS);
        assert_eq!(rows.len(), 4);
        assert!(rows[0].starts_with("200,c8y_Voltage,"));
        assert!(rows[1].starts_with("200,c8y_Current,"));
        assert!(rows[2].starts_with("200,c8y_Power,"));
        assert!(rows[3].starts_with("200,c8y_EnergyConsumption,0.125,kWh,"));
    }

    #[tokio::test]
    async fn send_measurement_fails_soft_when_disconnected() {
        let data = TestDataDir::new();
        let (session, stub) = stub_session(&data, "pv001");
        session.flags.connected.store(false, Ordering::SeqCst);

        let s = sample("pv001", Utc::now(), 0.0);
        // auto_reconnect is off for stub sessions, so no inline attempt.
        assert!(!session.send_measurement(&s).await);
        assert!(stub.messages_on(smartrest::TOPIC_MEASUREMENTS).is_empty());
    }

    #[tokio::test]
    async fn disconnect_resets_session_state() {
        let data = TestDataDir::new();
        let (session, _stub) = stub_session(&data, "pv001");
        assert!(session.register("PV", "iot_sim_pv001", false).await);

        session.disconnect().await;
        assert!(!session.is_connected());
        assert!(!session.is_registered());
        assert!(!session.flags.auto_reconnect.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_command_runs_ack_then_complete() {
        let data = TestDataDir::new();
        let (session, stub) = stub_session(&data, "pv001");

        assert!(smartrest::is_restart_command("510,pv001"));
        session.run_restart_simulation().await;

        let rows = stub.messages_on(smartrest::TOPIC_MEASUREMENTS);
        assert_eq!(
            rows,
            vec!["501,c8y_Restart".to_string(), "503,c8y_Restart".to_string()]
        );
    }

    #[tokio::test]
    async fn heartbeat_due_only_when_traffic_is_stale() {
        let data = TestDataDir::new();
        let (session, _stub) = stub_session(&data, "pv001");
        let now = Utc::now();

        // Nothing sent yet: due.
        assert!(session.heartbeat_due(now));

        *session.flags.last_message_at.lock() = Some(now - chrono::Duration::seconds(10));
        assert!(!session.heartbeat_due(now));

        *session.flags.last_message_at.lock() = Some(now - chrono::Duration::seconds(120));
        assert!(session.heartbeat_due(now));

        // A recent heartbeat also counts as traffic.
        *session.flags.last_heartbeat_at.lock() = Some(now - chrono::Duration::seconds(30));
        assert!(!session.heartbeat_due(now));
    }

    #[tokio::test]
    async fn alarm_row_reaches_the_broker() {
        let data = TestDataDir::new();
        let (session, stub) = stub_session(&data, "maingrid001");
        assert!(
            session
                .send_alarm("c8y_OverVoltage", "Voltage out of range", "MINOR")
                .await
        );
        assert_eq!(
            stub.last_on(smartrest::TOPIC_MEASUREMENTS).unwrap(),
            "301,c8y_OverVoltage,Voltage out of range,MINOR"
        );
    }
}
