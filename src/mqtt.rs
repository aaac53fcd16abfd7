//! MQTT session manager
//!
//! Owns the TLS connection to the cloud broker: scheduled reconnection
//! (cron spec + minimum delay + jitter), a bounded connect loop that
//! escalates to reprovisioning, master wildcard subscriptions with local
//! fan-out, the publish throttle signal, and the request/response
//! correlator that pairs `ioto/service/<id>/<op>/<seq>` publishes with
//! `ioto/device/<id>/<op>/+` replies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::error::AgentError;
use crate::provision::Provisioner;
use crate::schedule::cron_until;
use crate::MESSAGE_SIZE;

const CONNECT_MAX_RETRIES: usize = 5;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ALPN: &str = "x-amzn-mqtt-ca";
/// Pacing delay applied to publishes while the cloud throttle is asserted
const THROTTLE_DELAY: Duration = Duration::from_millis(200);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scheduled,
    Connecting,
    Connected,
    Draining,
    Disconnected,
}

/// An inbound message delivered to a local subscriber
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

#[derive(Clone)]
struct Route {
    filter: String,
    tx: mpsc::UnboundedSender<Message>,
}

struct Inner {
    config: SharedConfig,
    provisioner: Arc<Provisioner>,
    state: StdMutex<SessionState>,
    client: StdMutex<Option<AsyncClient>>,
    routes: StdMutex<Vec<Route>>,
    masters: StdMutex<Vec<String>>,
    throttle_topic: StdMutex<String>,
    pending: StdMutex<HashMap<i32, oneshot::Sender<String>>>,
    rr_prefixes: StdMutex<HashSet<String>>,
    next_seq: StdMutex<i32>,
    throttled: AtomicBool,
    connected_tx: watch::Sender<bool>,
    schedule_timer: StdMutex<Option<JoinHandle<()>>>,
    last_disconnect: StdMutex<Option<Instant>>,
    connect_guard: Mutex<()>,
    reprovisions: AtomicI64,
    /// Connection generation; stale pump tasks detect supersession
    epoch: AtomicU64,
    /// Set on shutdown; no further reconnects are scheduled
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct MqttSession {
    inner: Arc<Inner>,
}

/// Standard MQTT filter match.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(fs), Some(ts)) if fs == ts => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// True when every topic matched by `filter` is also matched by `master`,
/// so a local subscriber can share the master's network subscription.
fn filter_covered(master: &str, filter: &str) -> bool {
    let mut m = master.split('/');
    let mut f = filter.split('/');
    loop {
        match (m.next(), f.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(fs)) => {
                if fs == "#" {
                    return false;
                }
            }
            (Some(ms), Some(fs)) => {
                if ms != fs {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn covered_by_masters(masters: &[String], filter: &str) -> bool {
    masters.iter().any(|m| filter_covered(m, filter))
}

/// Split a reply topic into its prefix and trailing sequence number.
fn split_reply(topic: &str) -> Option<(String, i32)> {
    let (prefix, tail) = topic.rsplit_once('/')?;
    let seq = tail.parse::<i32>().ok()?;
    Some((prefix.to_string(), seq))
}

/// Load TLS material: a path, or inline PEM marked with a '@' prefix.
fn load_material(value: &str) -> Result<Vec<u8>, AgentError> {
    if let Some(inline) = value.strip_prefix('@') {
        return Ok(inline.as_bytes().to_vec());
    }
    std::fs::read(value).map_err(|e| AgentError::CantRead(format!("{}: {}", value, e)))
}

/// Reachability probe used to distinguish broker trouble from a dead link.
async fn check_internet() -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(3),
            tokio::net::TcpStream::connect(("1.1.1.1", 443)),
        )
        .await,
        Ok(Ok(_))
    )
}

impl MqttSession {
    pub fn new(config: SharedConfig, provisioner: Arc<Provisioner>) -> MqttSession {
        let (connected_tx, _) = watch::channel(false);
        MqttSession {
            inner: Arc::new(Inner {
                config,
                provisioner,
                state: StdMutex::new(SessionState::Idle),
                client: StdMutex::new(None),
                routes: StdMutex::new(Vec::new()),
                masters: StdMutex::new(Vec::new()),
                throttle_topic: StdMutex::new(String::new()),
                pending: StdMutex::new(HashMap::new()),
                rr_prefixes: StdMutex::new(HashSet::new()),
                next_seq: StdMutex::new(0),
                throttled: AtomicBool::new(false),
                connected_tx,
                schedule_timer: StdMutex::new(None),
                last_disconnect: StdMutex::new(None),
                connect_guard: Mutex::new(()),
                reprovisions: AtomicI64::new(0),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    pub fn is_throttled(&self) -> bool {
        self.inner.throttled.load(Ordering::SeqCst)
    }

    /// Watch connection transitions.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    fn client(&self) -> Option<AsyncClient> {
        self.inner.client.lock().unwrap().clone()
    }

    fn next_seq(&self) -> i32 {
        let mut seq = self.inner.next_seq.lock().unwrap();
        *seq = if *seq >= i32::MAX { 1 } else { *seq + 1 };
        *seq
    }

    /// Register a local subscriber. When a master subscription already
    /// covers the filter no MQTT SUBSCRIBE frame is sent.
    pub fn subscribe_local(&self, filter: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.lock().unwrap().push(Route {
            filter: filter.to_string(),
            tx,
        });
        let covered = covered_by_masters(&self.inner.masters.lock().unwrap(), filter);
        if !covered {
            if let Some(client) = self.client() {
                let filter = filter.to_string();
                tokio::spawn(async move {
                    if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                        warn!("Cannot subscribe {}: {}", filter, e);
                    }
                });
            }
        }
        rx
    }

    /// Schedule the next connection attempt: cron spec plus the minimum
    /// delay after the last disconnect, plus uniform jitter. Only one timer
    /// is outstanding; rescheduling cancels the prior one.
    pub fn schedule_connect(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut timer = self.inner.schedule_timer.lock().unwrap();
            if let Some(handle) = timer.take() {
                handle.abort();
            }
            *self.inner.state.lock().unwrap() = SessionState::Scheduled;
            let session = self.clone();
            let handle = tokio::spawn(async move {
                let wait = session.compute_connect_wait().await;
                if !wait.is_zero() {
                    info!("Schedule MQTT connect in {} secs", wait.as_secs());
                    tokio::time::sleep(wait).await;
                }
                // Release the timer slot before connecting so a reschedule
                // from within connect() cannot abort us mid-flight
                *session.inner.schedule_timer.lock().unwrap() = None;
                if let Err(e) = session.connect().await {
                    warn!("mqtt: {}", e);
                }
            });
            *timer = Some(handle);
        }
    }

    async fn compute_connect_wait(&self) -> Duration {
        let (schedule, delay_secs, jitter_secs) = {
            let cfg = self.inner.config.read().await;
            (
                cfg.get_opt("mqtt.schedule"),
                cfg.get_duration_secs("mqtt.delay", 0),
                cfg.get_duration_secs("mqtt.jitter", 0),
            )
        };
        let min_delay = {
            let last = self.inner.last_disconnect.lock().unwrap();
            match *last {
                Some(at) => (at + Duration::from_secs(delay_secs))
                    .saturating_duration_since(Instant::now()),
                None => Duration::ZERO,
            }
        };
        let mut wait = min_delay;
        if let Some(spec) = schedule {
            let when = Utc::now()
                + chrono::Duration::from_std(min_delay).unwrap_or_else(|_| chrono::Duration::zero());
            match cron_until(&spec, when) {
                Ok(until) => wait += until,
                Err(e) => warn!("mqtt: {}", e),
            }
        }
        if !wait.is_zero() && jitter_secs > 0 {
            let jitter_ms = rand::thread_rng().gen_range(0..jitter_secs * 1000);
            wait += Duration::from_millis(jitter_ms);
        }
        wait
    }

    /// Connect to the cloud, provisioning on demand. May block a long time
    /// while the device awaits claiming. Concurrent callers serialize on
    /// the connect guard.
    pub async fn connect(&self) -> Result<(), AgentError> {
        if self.is_connected() || self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.provisioner.wake();
        let _guard = self.inner.connect_guard.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        *self.inner.state.lock().unwrap() = SessionState::Connecting;

        let mut attempt = 0;
        while attempt < CONNECT_MAX_RETRIES && !self.is_connected() {
            if self.inner.config.read().await.endpoint().is_none() {
                // Blocks until the device is claimed
                match self.inner.provisioner.provision().await {
                    Ok(()) => {}
                    Err(e) => {
                        *self.inner.state.lock().unwrap() = SessionState::Idle;
                        return Err(e);
                    }
                }
            }
            if self.inner.config.read().await.endpoint().is_some() {
                match self.attach().await {
                    Ok(()) => break,
                    Err(e) => {
                        if attempt == 0 {
                            error!("mqtt: {}", e);
                        } else {
                            debug!("mqtt: {}", e);
                        }
                    }
                }
            }
            // A failed connect with working internet suggests the device
            // was released; escalate to reprovisioning, within limits.
            if check_internet().await {
                let max_reprovision = self.inner.config.read().await.get_int("limits.reprovision", 5);
                let count = self.inner.reprovisions.fetch_add(1, Ordering::SeqCst) + 1;
                if count > max_reprovision {
                    error!("Too many reprovision requests");
                    break;
                }
                if attempt >= 2 {
                    info!("Device cloud connection failed despite good internet connection");
                    self.inner.provisioner.deprovision().await;
                }
            }
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            attempt += 1;
        }
        if !self.is_connected() {
            *self.inner.last_disconnect.lock().unwrap() = Some(Instant::now());
            self.schedule_connect();
            return Err(AgentError::CantConnect(
                "giving up for this scheduled attempt".into(),
            ));
        }
        Ok(())
    }

    /// Open the TLS socket, perform the MQTT CONNECT handshake, register
    /// the master subscriptions and start the event pump.
    async fn attach(&self) -> Result<(), AgentError> {
        let (id, account, endpoint, port, alpn, authority, certificate, key, keepalive) = {
            let cfg = self.inner.config.read().await;
            let endpoint = cfg
                .endpoint()
                .or_else(|| cfg.get_opt("mqtt.endpoint"))
                .ok_or_else(|| AgentError::BadState("mqtt endpoint not yet provisioned".into()))?;
            let id = cfg
                .device_id()
                .ok_or_else(|| AgentError::BadState("device id not set".into()))?;
            let port = match cfg.get_int("provision.port", 0) {
                0 => cfg.get_int("mqtt.port", 443) as u16,
                p => p as u16,
            };
            let authority = cfg
                .get_opt("mqtt.authority")
                .map(|p| cfg.expand(&p))
                .ok_or_else(|| {
                    AgentError::CantInitialize("mqtt.authority root certificate required".into())
                })?;
            let certificate = cfg
                .get_opt("provision.certificate")
                .or_else(|| cfg.get_opt("mqtt.certificate"))
                .ok_or_else(|| AgentError::BadState("device certificate not provisioned".into()))?;
            let key = cfg
                .get_opt("provision.key")
                .or_else(|| cfg.get_opt("mqtt.key"))
                .ok_or_else(|| AgentError::BadState("device key not provisioned".into()))?;
            (
                id,
                cfg.account(),
                endpoint,
                port,
                cfg.get_str("mqtt.alpn", DEFAULT_ALPN),
                authority,
                certificate,
                key,
                cfg.get_duration_secs("mqtt.timeout", 60),
            )
        };
        let ca = std::fs::read(&authority)
            .map_err(|e| AgentError::CantRead(format!("{}: {}", authority.display(), e)))?;
        let cert_pem = load_material(&certificate)?;
        let key_pem = load_material(&key)?;

        let mut options = MqttOptions::new(&id, &endpoint, port);
        options.set_keep_alive(Duration::from_secs(keepalive));
        options.set_clean_session(true);
        options.set_max_packet_size(MESSAGE_SIZE, MESSAGE_SIZE);
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: Some(vec![alpn.into_bytes()]),
            client_auth: Some((cert_pem, key_pem)),
        }));

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        // Wait for the CONNECT acknowledgement before declaring victory
        let deadline = tokio::time::Instant::now() + CONNACK_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, eventloop.poll())
                .await
                .map_err(|_| AgentError::Timeout("MQTT connect ack".into()))?
                .map_err(|e| AgentError::CantConnect(format!("{}", e)))?;
            match event {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(AgentError::CantConnect(format!(
                        "connect refused: {:?}",
                        ack.code
                    )));
                }
                _ => continue,
            }
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.client.lock().unwrap() = Some(client.clone());
        *self.inner.state.lock().unwrap() = SessionState::Connected;
        self.inner.throttled.store(false, Ordering::SeqCst);

        // Master subscriptions; narrower in-process subscribers attach to
        // these without further SUBSCRIBE frames
        let mut masters = vec![
            format!("ioto/device/{}/#", id),
            "ioto/account/all/#".to_string(),
        ];
        if let Some(account) = &account {
            masters.push(format!("ioto/account/{}/#", account));
        }
        for filter in &masters {
            if let Err(e) = client.subscribe(filter, QoS::AtLeastOnce).await {
                warn!("Cannot subscribe {}: {}", filter, e);
            }
        }
        *self.inner.masters.lock().unwrap() = masters.clone();

        // The throttle indicator keeps the client well behaved
        *self.inner.throttle_topic.lock().unwrap() =
            format!("ioto/device/{}/mqtt/throttle", id);

        // Re-establish any routes outside the master umbrella
        let routes: Vec<String> = self
            .inner
            .routes
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.filter.clone())
            .collect();
        for filter in routes {
            if !covered_by_masters(&masters, &filter) {
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    warn!("Cannot subscribe {}: {}", filter, e);
                }
            }
        }

        let session = self.clone();
        tokio::spawn(async move { session.pump(eventloop, epoch).await });

        let _ = self.inner.connected_tx.send(true);
        info!("Connected to mqtt://{}:{}", endpoint, port);
        Ok(())
    }

    /// Poll the event loop, dispatching publishes until the connection dies.
    async fn pump(self, mut eventloop: EventLoop, epoch: u64) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    self.dispatch(&publish.topic, payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    if self.inner.epoch.load(Ordering::SeqCst) == epoch {
                        error!("MQTT error: {:?}", e);
                    }
                    break;
                }
            }
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                // Superseded by a newer connection
                return;
            }
        }
        self.handle_disconnect(epoch);
    }

    fn handle_disconnect(&self, epoch: u64) {
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        *self.inner.client.lock().unwrap() = None;
        *self.inner.state.lock().unwrap() = SessionState::Disconnected;
        *self.inner.last_disconnect.lock().unwrap() = Some(Instant::now());
        let _ = self.inner.connected_tx.send(false);
        info!("Cloud connection closed");
        self.schedule_connect();
    }

    /// Route one inbound publish: throttle signal, request/response reply,
    /// or local subscriber fan-out.
    fn dispatch(&self, topic: &str, payload: String) {
        let throttle_topic = self.inner.throttle_topic.lock().unwrap().clone();
        if !throttle_topic.is_empty() && topic == throttle_topic {
            warn!("Cloud requested publish throttling");
            self.inner.throttled.store(true, Ordering::SeqCst);
            return;
        }
        if let Some((prefix, seq)) = split_reply(topic) {
            if self.inner.rr_prefixes.lock().unwrap().contains(&prefix) {
                let sender = self.inner.pending.lock().unwrap().remove(&seq);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(payload);
                    }
                    None => debug!("Got unmatched request response: {}", seq),
                }
                return;
            }
        }
        let routes = self.inner.routes.lock().unwrap().clone();
        let mut delivered = false;
        for route in routes {
            if topic_matches(&route.filter, topic) {
                let _ = route.tx.send(Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
                delivered = true;
            }
        }
        if !delivered {
            debug!("No subscriber for {}", topic);
        }
    }

    /// Publish a message. Payloads above the message ceiling are refused.
    pub async fn publish(
        &self,
        topic: &str,
        payload: String,
        qos: QoS,
        retain: bool,
    ) -> Result<(), AgentError> {
        if payload.len() > MESSAGE_SIZE {
            return Err(AgentError::WontFit(format!(
                "payload of {} bytes exceeds message limit",
                payload.len()
            )));
        }
        let client = self
            .client()
            .ok_or_else(|| AgentError::BadState("not connected".into()))?;
        if self.is_throttled() {
            tokio::time::sleep(THROTTLE_DELAY).await;
        }
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| AgentError::CantConnect(format!("publish {}: {}", topic, e)))
    }

    /// Fire-and-forget publish through the cloud rules engine (basic
    /// ingest).
    pub async fn publish_ingest(&self, op: &str, payload: String) -> Result<(), AgentError> {
        let id = self
            .inner
            .config
            .read()
            .await
            .device_id()
            .ok_or_else(|| AgentError::BadState("device id not set".into()))?;
        let topic = format!("$aws/rules/IotoDevice/ioto/service/{}/{}", id, op);
        self.publish(&topic, payload, QoS::AtLeastOnce, false).await
    }

    /// Issue a request and wait for the correlated reply. Returns None on
    /// timeout or when disconnected.
    pub async fn request(&self, op: &str, body: String, timeout: Duration) -> Option<String> {
        let id = self.inner.config.read().await.device_id()?;
        let client = self.client()?;
        let seq = self.next_seq();

        let prefix = format!("ioto/device/{}/{}", id, op);
        let newly_registered = self.inner.rr_prefixes.lock().unwrap().insert(prefix.clone());
        if newly_registered {
            // One shared subscription per topic prefix; usually covered by
            // the device master subscription
            let filter = format!("{}/+", prefix);
            if !covered_by_masters(&self.inner.masters.lock().unwrap(), &filter) {
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    warn!("Cannot subscribe {}: {}", filter, e);
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(seq, tx);
        let topic = format!("ioto/service/{}/{}/{}", id, op, seq);
        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, body).await {
            warn!("Cannot publish request {}: {}", topic, e);
            self.inner.pending.lock().unwrap().remove(&seq);
            return None;
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Some(payload),
            _ => {
                // Timed out or the connection fell over: the waiter is
                // resumed with a null result
                self.inner.pending.lock().unwrap().remove(&seq);
                info!("MQTT request timed out: {}", op);
                None
            }
        }
    }

    /// Record a metric value in the device metric namespace.
    pub async fn set_metric(&self, metric: &str, value: f64, dimensions: Option<&str>, elapsed: u64) {
        let dimensions = dimensions.unwrap_or("[{\"Device\":\"deviceId\"}]");
        let msg = format!(
            "{{\"metric\":\"{}\",\"value\":{},\"dimensions\":{},\"buffer\":{{\"elapsed\":{}}}}}",
            metric, value, dimensions, elapsed
        );
        if let Err(e) = self.publish_ingest("metric/set", msg).await {
            debug!("metric/set: {}", e);
        }
    }

    /// Fetch an accumulated metric statistic.
    pub async fn get_metric(
        &self,
        metric: &str,
        dimensions: Option<&str>,
        statistic: &str,
        period: u64,
    ) -> Option<f64> {
        let dimensions = dimensions.unwrap_or("{\"Device\":\"deviceId\"}");
        let msg = format!(
            "{{\"metric\":\"{}\",\"dimensions\":{},\"period\":{},\"statistic\":\"{}\"}}",
            metric, dimensions, period, statistic
        );
        let reply = self.request("metric/get", msg, REQUEST_TIMEOUT).await?;
        reply.trim().parse().ok()
    }

    /// Set a key in the cloud device store.
    pub async fn store_set(&self, key: &str, value: &serde_json::Value) {
        let kind = if value.is_number() { "number" } else { "string" };
        let msg = json!({ "key": key, "value": value, "type": kind }).to_string();
        if let Err(e) = self.publish_ingest("store/set", msg).await {
            debug!("store/set: {}", e);
        }
    }

    /// Get a key from the cloud device store. Must not use basic ingest:
    /// the reply comes back over the request/response pair.
    pub async fn store_get(&self, key: &str) -> Option<String> {
        let msg = json!({ "key": key }).to_string();
        self.request("store/get", msg, REQUEST_TIMEOUT).await
    }

    /// Drain and close the connection.
    pub async fn disconnect(&self) {
        *self.inner.state.lock().unwrap() = SessionState::Draining;
        if let Some(client) = self.client() {
            let _ = client.disconnect().await;
        }
    }

    /// Final teardown: disconnect and stop scheduling reconnects.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(timer) = self.inner.schedule_timer.lock().unwrap().take() {
            timer.abort();
        }
        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Overrides};

    fn test_session() -> MqttSession {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ioto.json5"), "{}").unwrap();
        let overrides = Overrides {
            config_dir: Some(dir.path().to_path_buf()),
            state_dir: Some(dir.path().to_path_buf()),
            id: Some("D123456789".to_string()),
            ..Default::default()
        };
        let config = Arc::new(tokio::sync::RwLock::new(Config::load(&overrides).unwrap()));
        let provisioner = Provisioner::new(config.clone(), reqwest::Client::new());
        MqttSession::new(config, provisioner)
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("ioto/device/D1/#", "ioto/device/D1/sync/INSERT"));
        assert!(topic_matches("ioto/device/D1/sync/+", "ioto/device/D1/sync/SYNC"));
        assert!(!topic_matches("ioto/device/D1/sync/+", "ioto/device/D1/sync/a/b"));
        assert!(!topic_matches("ioto/device/D1/#", "ioto/device/D2/sync"));
        assert!(topic_matches("ioto/account/all/#", "ioto/account/all/sync/UPSERT"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a"));
    }

    #[test]
    fn test_master_coverage() {
        assert!(filter_covered("ioto/device/D1/#", "ioto/device/D1/sync/+"));
        assert!(filter_covered("ioto/device/D1/#", "ioto/device/D1/mqtt/throttle"));
        assert!(!filter_covered("ioto/device/D1/#", "ioto/device/D2/sync/+"));
        assert!(!filter_covered("ioto/account/+/x", "ioto/account/#"));
        assert!(filter_covered("ioto/account/+/x", "ioto/account/abc/x"));
    }

    #[test]
    fn test_split_reply() {
        assert_eq!(
            split_reply("ioto/device/D1/store/get/42"),
            Some(("ioto/device/D1/store/get".to_string(), 42))
        );
        assert!(split_reply("ioto/device/D1/store/get/notanumber").is_none());
        assert!(split_reply("plain").is_none());
    }

    #[tokio::test]
    async fn test_seq_wraps_past_int_max() {
        let session = test_session();
        *session.inner.next_seq.lock().unwrap() = i32::MAX - 1;
        assert_eq!(session.next_seq(), i32::MAX);
        assert_eq!(session.next_seq(), 1);
        assert_eq!(session.next_seq(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_matching_subscribers() {
        let session = test_session();
        let mut rx = session.subscribe_local("ioto/device/D123456789/sync/+");
        let mut other = session.subscribe_local("ioto/device/D123456789/provision/+");

        session.dispatch(
            "ioto/device/D123456789/sync/INSERT",
            "{\"sk\":\"Sensor#s1\"}".to_string(),
        );
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, "ioto/device/D123456789/sync/INSERT");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_resolves_pending_request() {
        let session = test_session();
        session
            .inner
            .rr_prefixes
            .lock()
            .unwrap()
            .insert("ioto/device/D123456789/store/get".to_string());
        let (tx, rx) = oneshot::channel();
        session.inner.pending.lock().unwrap().insert(7, tx);

        session.dispatch("ioto/device/D123456789/store/get/7", "42".to_string());
        assert_eq!(rx.await.unwrap(), "42");
        assert!(session.inner.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_throttle_signal_sets_flag() {
        let session = test_session();
        *session.inner.throttle_topic.lock().unwrap() =
            "ioto/device/D123456789/mqtt/throttle".to_string();
        assert!(!session.is_throttled());
        session.dispatch("ioto/device/D123456789/mqtt/throttle", "1".to_string());
        assert!(session.is_throttled());
    }

    #[tokio::test]
    async fn test_connect_wait_follows_minute_schedule() {
        let session = test_session();
        {
            let mut cfg = session.inner.config.write().await;
            cfg.set("mqtt.schedule", json!("* * * * *"));
        }
        let wait = session.compute_connect_wait().await;
        assert!(wait <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_publish_without_connection_is_bad_state() {
        let session = test_session();
        let err = session
            .publish("ioto/service/D1/test", "{}".to_string(), QoS::AtLeastOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::BadState(_)));
    }

    #[tokio::test]
    async fn test_oversized_publish_wont_fit() {
        let session = test_session();
        let payload = "x".repeat(MESSAGE_SIZE + 1);
        let err = session
            .publish("t", payload, QoS::AtLeastOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::WontFit(_)));
    }
}
