//! Device registration and provisioning
//!
//! Registration is a one-time HTTPS call to the builder service that yields
//! the API endpoint and bearer token. Provisioning fetches the MQTT device
//! certificate, key and broker endpoint, persisting them under the
//! `provision` block. Both loop with exponential backoff (1 s, doubling,
//! capped at 24 h) until the device is claimed; a single attempt may be
//! outstanding at a time and sleepers can be woken early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{self, SharedConfig, PRODUCT_PLACEHOLDER};
use crate::error::AgentError;
use crate::signer::Credentials;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(24 * 3600);

/// Refresh credentials this long before they expire
const CREDS_LEAD_SECS: i64 = 20 * 60;
/// Never refresh more often than this
const CREDS_MIN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Stale release commands older than this are ignored
const RELEASE_WINDOW_MS: i64 = 10_000;

pub struct Provisioner {
    config: SharedConfig,
    http: reqwest::Client,
    /// Single-entry guard: concurrent provisioning callers serialize here
    guard: Mutex<()>,
    /// Wakes a sleeping backoff early
    wake: Notify,
    creds: RwLock<Option<Credentials>>,
    /// Set after successful provisioning; consumed to run a one-shot
    /// upward sync on the next connect
    pending_sync_up: AtomicBool,
}

/// Double the backoff delay, capped at 24 hours.
fn next_backoff(delay: Duration) -> Duration {
    std::cmp::min(delay.saturating_mul(2), BACKOFF_CAP)
}

impl Provisioner {
    pub fn new(config: SharedConfig, http: reqwest::Client) -> Arc<Provisioner> {
        Arc::new(Provisioner {
            config,
            http,
            guard: Mutex::new(()),
            wake: Notify::new(),
            creds: RwLock::new(None),
            pending_sync_up: AtomicBool::new(false),
        })
    }

    /// Wake a provisioning attempt sleeping in backoff.
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Sleep for the backoff delay, unless woken early. Returns the next
    /// delay to use.
    async fn backoff_sleep(&self, delay: Duration) -> Duration {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.wake.notified() => {
                debug!("Provisioning sleeper woken early");
            }
        }
        next_backoff(delay)
    }

    /// One-time device registration with the builder.
    ///
    /// Idempotent: a device that already has an API endpoint and token is
    /// left alone. Missing product or claim ID is a configuration error.
    pub async fn register(&self) -> Result<(), AgentError> {
        let (descriptor, builder, product, id, account, cloud) = {
            let cfg = self.config.read().await;
            if cfg.api().is_some() && cfg.api_token().is_some() {
                info!(
                    "Device registered and claimed by {} cloud \"{}\" in {}",
                    cfg.get_str("provision.cloudType", "?"),
                    cfg.get_str("provision.cloudName", "?"),
                    cfg.get_str("provision.cloudRegion", "?"),
                );
                return Ok(());
            }
            let product = cfg.product().ok_or_else(|| {
                AgentError::BadArgs("missing \"product\" in config/device.json5".into())
            })?;
            if product == PRODUCT_PLACEHOLDER {
                return Err(AgentError::BadArgs(
                    "missing \"product\" in config/device.json5".into(),
                ));
            }
            let id = cfg.device_id().ok_or_else(|| {
                AgentError::BadArgs("missing device \"id\" in config/device.json5".into())
            })?;
            (
                cfg.get("device").cloned().unwrap_or_else(|| json!({})),
                cfg.builder(),
                product,
                id,
                cfg.get_opt("device.account"),
                cfg.get_opt("device.cloud"),
            )
        };

        let mut params = descriptor;
        if let Some(account) = account {
            params["account"] = json!(account);
        }
        if let Some(cloud) = cloud {
            params["cloud"] = json!(cloud);
        }
        params["created"] = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

        let url = format!("{}/device/register", builder);
        info!("Device {} registering with {}", id, builder);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&product)
            .json(&params)
            .send()
            .await
            .map_err(|e| AgentError::CantConnect(format!("register: {}", e)))?;
        if !response.status().is_success() {
            return Err(AgentError::CantConnect(format!(
                "register: status {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::CantConnect(format!("register: {}", e)))?;
        let fields = body.as_object().map(|o| o.len()).unwrap_or(0);
        if fields == 0 {
            return Err(AgentError::CantConnect("empty registration response".into()));
        }
        if fields <= 2 {
            info!("Device not yet claimed for management via the cloud");
        }

        let mut cfg = self.config.write().await;
        cfg.remove("provision");
        let mut block = json!({});
        config::merge(&mut block, &body);
        cfg.set("provision", block);
        if let Err(e) = cfg.save_provision() {
            error!("Cannot save device provisioning: {}", e);
            return Err(AgentError::CantWrite(e.to_string()));
        }
        Ok(())
    }

    /// Provision the device: block until claimed, with certificates and a
    /// broker endpoint in hand. Concurrent callers serialize on the entry
    /// guard; the winner does the work.
    pub async fn provision(&self) -> Result<(), AgentError> {
        // Wake any long sleeper so it can re-check and release the guard
        self.wake();
        let _guard = self.guard.lock().await;

        if self.config.read().await.endpoint().is_some() {
            return Ok(());
        }

        // Wait for registration to yield an API endpoint
        let mut delay = BACKOFF_START;
        loop {
            if self.config.read().await.api().is_some() {
                break;
            }
            match self.register().await {
                Err(e @ AgentError::BadArgs(_)) => return Err(e),
                Err(e) => warn!("register: {}", e),
                Ok(()) => {}
            }
            if self.config.read().await.api().is_some() {
                break;
            }
            delay = self.backoff_sleep(delay).await;
        }

        // Wait for the device to be claimed; this can take a long time
        let mut delay = BACKOFF_START;
        loop {
            if self.config.read().await.endpoint().is_some() {
                break;
            }
            match self.fetch_certs().await {
                Ok(true) => break,
                Ok(false) => {
                    info!("Device not yet claimed, waiting {} secs ...", delay.as_secs())
                }
                Err(e) => warn!("provision: {}", e),
            }
            delay = self.backoff_sleep(delay).await;
        }
        Ok(())
    }

    /// Fetch the MQTT certificate, key and broker endpoint. Returns false
    /// while the device is unclaimed.
    async fn fetch_certs(&self) -> Result<bool, AgentError> {
        let (api, token, id) = {
            let cfg = self.config.read().await;
            match (cfg.api(), cfg.api_token(), cfg.device_id()) {
                (Some(api), Some(token), Some(id)) => (api, token, id),
                _ => return Ok(false),
            }
        };
        let url = format!("{}/tok/provision/getCerts", api);
        let response = match self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "id": id }))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!("Cannot provision device: {}", e);
                return Ok(false);
            }
        };
        if !response.status().is_success() {
            debug!("Cannot provision device: status {}", response.status());
            return Ok(false);
        }
        let mut body: Value = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                debug!("Cannot parse provisioning response: {}", e);
                return Ok(false);
            }
        };
        let certificate = body.get("certificate").and_then(|v| v.as_str()).map(String::from);
        let key = body.get("key").and_then(|v| v.as_str()).map(String::from);
        let (certificate, key) = match (certificate, key) {
            (Some(c), Some(k)) => (c, k),
            _ => {
                error!("Provisioning response is missing certificate");
                return Ok(false);
            }
        };
        info!("Device claimed");

        let mut cfg = self.config.write().await;
        if cfg.nosave {
            // Keep the PEM material in memory, marked with a '@' prefix
            body["certificate"] = json!(format!("@{}", certificate));
            body["key"] = json!(format!("@{}", key));
        } else {
            let cert_path = cfg.certificate_path();
            let key_path = cfg.key_path();
            if let Some(parent) = cert_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Cannot create {}: {}", parent.display(), e);
                }
            }
            if let Err(e) = config::write_private(&cert_path, certificate.as_bytes()) {
                error!("Cannot save certificate to {}: {}", cert_path.display(), e);
            } else {
                body["certificate"] = json!(cert_path.to_string_lossy());
            }
            if let Err(e) = config::write_private(&key_path, key.as_bytes()) {
                error!("Cannot save key to {}: {}", key_path.display(), e);
            } else {
                body["key"] = json!(key_path.to_string_lossy());
            }
        }
        if let Some(obj) = body.as_object_mut() {
            obj.remove("cert");
        }

        let mut block = cfg.get("provision").cloned().unwrap_or_else(|| json!({}));
        config::merge(&mut block, &body);
        cfg.set("provision", block);
        if let Err(e) = cfg.save_provision() {
            error!("Cannot save provisioning state: {}", e);
        }
        info!(
            "Device provisioned for {} cloud \"{}\" in {}",
            cfg.get_str("provision.cloudType", "?"),
            cfg.get_str("provision.cloudName", "?"),
            cfg.get_str("provision.cloudRegion", "?"),
        );
        drop(cfg);

        // One-time full upward sync once the next MQTT connect lands
        self.pending_sync_up.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// Consume the post-provision sync-up request.
    pub fn take_pending_sync_up(&self) -> bool {
        self.pending_sync_up.swap(false, Ordering::SeqCst)
    }

    /// Release the device: clear credentials in memory and remove the
    /// certificate, key and persisted provision block.
    pub async fn deprovision(&self) {
        {
            let mut cfg = self.config.write().await;
            for path in [cfg.certificate_path(), cfg.key_path()] {
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("Cannot remove {}: {}", path.display(), e);
                    }
                }
            }
            cfg.remove("provision");
            cfg.remove_provision_file();
        }
        *self.creds.write().await = None;
        info!("Device deprovisioned");
    }

    /// Startup check: a persisted provision block that does not match the
    /// configured claim ID is stale and must be discarded.
    pub async fn check_claim(&self) {
        let mismatch = {
            let cfg = self.config.read().await;
            match (cfg.get_opt("provision.id"), cfg.device_id()) {
                (Some(provisioned), Some(id)) => provisioned != id,
                _ => false,
            }
        };
        if mismatch {
            error!("Provisioning does not match configured device claim ID, resetting provisioning");
            self.deprovision().await;
        }
    }

    /// Handle a cloud provisioning command (`.../provision/<cmd>`).
    /// Returns true when the device was released and should disconnect.
    pub async fn handle_release(&self, topic: &str, payload: &str, test_mode: bool) -> bool {
        let cmd = topic.rsplit('/').next().unwrap_or_default();
        if cmd != "release" {
            error!("Unknown provision command {}", cmd);
            return false;
        }
        let now_ms = Utc::now().timestamp_millis();
        let timestamp = payload.trim().parse::<i64>().unwrap_or(now_ms);
        if now_ms >= timestamp + RELEASE_WINDOW_MS {
            // Stale release; the device may have reprovisioned since
            debug!("Ignoring stale release command");
            return false;
        }
        if test_mode {
            debug!("Ignoring release command in test mode");
            return false;
        }
        info!("Received provisioning command {}", topic);
        self.deprovision().await;
        true
    }

    /// Current short-lived cloud credentials, when held.
    pub async fn credentials(&self) -> Option<Credentials> {
        self.creds.read().await.clone()
    }

    /// Renew the short-lived cloud credentials and return the next refresh
    /// delay.
    async fn fetch_creds(&self) -> Option<Duration> {
        let (api, token) = {
            let cfg = self.config.read().await;
            match (cfg.api(), cfg.api_token()) {
                (Some(api), Some(token)) => (api, token),
                _ => return None,
            }
        };
        let url = format!("{}/tok/provision/getCreds", api);
        let response = match self.http.post(&url).bearer_auth(&token).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                error!("Cannot get credentials: status {}", r.status());
                return None;
            }
            Err(e) => {
                error!("Cannot get credentials: {}", e);
                return None;
            }
        };
        let body: Value = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                error!("Cannot parse credentials: {}", e);
                return None;
            }
        };
        let expires = body
            .get("expires")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        let creds = Credentials {
            access_key: body.get("accessKeyId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            secret: body
                .get("secretAccessKey")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            session_token: body.get("sessionToken").and_then(|v| v.as_str()).map(String::from),
            region: body.get("region").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            expires,
        };
        if creds.access_key.is_empty() || creds.secret.is_empty() {
            error!("Credentials response is missing keys");
            return None;
        }
        // Persist links to the key values in the in-memory config only
        {
            let mut cfg = self.config.write().await;
            cfg.set("provision.keys", body.clone());
        }
        *self.creds.write().await = Some(creds);
        info!("Cloud credentials refreshed");

        // Without an advertised expiry, refresh on a conservative cadence
        Some(
            expires
                .map(|at| refresh_delay(at, Utc::now()))
                .unwrap_or(Duration::from_secs(1800)),
        )
    }

    /// Refresh credentials forever, at least 20 minutes before expiry and
    /// never more often than every five minutes.
    pub async fn refresh_creds_loop(self: Arc<Self>) {
        loop {
            let delay = self
                .fetch_creds()
                .await
                .unwrap_or(Duration::from_secs(60));
            tokio::time::sleep(delay).await;
        }
    }
}

/// Delay until the next credentials refresh: lead time before expiry,
/// floored at the minimum refresh interval.
fn refresh_delay(expires: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let lead = expires - now - chrono::Duration::seconds(CREDS_LEAD_SECS);
    let lead = lead.to_std().unwrap_or(Duration::ZERO);
    std::cmp::max(lead, CREDS_MIN_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Overrides, PROVISION_FILE};

    fn test_config(dir: &std::path::Path, master: &str) -> SharedConfig {
        std::fs::write(dir.join("ioto.json5"), master).unwrap();
        let overrides = Overrides {
            config_dir: Some(dir.to_path_buf()),
            state_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        Arc::new(tokio::sync::RwLock::new(Config::load(&overrides).unwrap()))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = BACKOFF_START;
        assert_eq!(next_backoff(delay), Duration::from_secs(2));
        for _ in 0..30 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, BACKOFF_CAP);
        assert_eq!(next_backoff(BACKOFF_CAP), BACKOFF_CAP);
    }

    #[test]
    fn test_refresh_delay_bounds() {
        let now = Utc::now();
        // Plenty of time left: refresh 20 minutes before expiry
        let expires = now + chrono::Duration::hours(2);
        let delay = refresh_delay(expires, now);
        assert_eq!(delay, Duration::from_secs(100 * 60));
        // Nearly expired: still wait the minimum interval
        let expires = now + chrono::Duration::minutes(1);
        assert_eq!(refresh_delay(expires, now), CREDS_MIN_INTERVAL);
    }

    #[tokio::test]
    async fn test_register_requires_product_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "{}");
        let p = Provisioner::new(config, reqwest::Client::new());
        match p.register().await {
            Err(AgentError::BadArgs(_)) => {}
            other => panic!("expected BadArgs, got {:?}", other.err()),
        }

        let config = test_config(
            dir.path(),
            r#"{ device: { product: "PUT-YOUR-PRODUCT-ID-HERE", id: "AB12CD34EF" } }"#,
        );
        let p = Provisioner::new(config, reqwest::Client::new());
        assert!(matches!(p.register().await, Err(AgentError::BadArgs(_))));
    }

    #[tokio::test]
    async fn test_register_is_idempotent_when_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            r#"{
                device: { product: "tok", id: "AB12CD34EF" },
                provision: { api: "https://api.example.com", token: "bearer-tok" },
            }"#,
        );
        let p = Provisioner::new(config, reqwest::Client::new());
        // No HTTP call is made; the device is already registered
        p.register().await.unwrap();
    }

    #[tokio::test]
    async fn test_deprovision_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            r#"{ provision: { api: "https://api.example.com", token: "t", endpoint: "mqtt.example.com" } }"#,
        );
        std::fs::write(dir.path().join(PROVISION_FILE), "{}").unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("device.crt"), "cert").unwrap();
        std::fs::write(certs.join("device.key"), "key").unwrap();

        let p = Provisioner::new(config.clone(), reqwest::Client::new());
        p.deprovision().await;

        let cfg = config.read().await;
        assert!(cfg.api().is_none());
        assert!(cfg.endpoint().is_none());
        assert!(!certs.join("device.crt").exists());
        assert!(!certs.join("device.key").exists());
        assert!(!dir.path().join(PROVISION_FILE).exists());
    }

    #[tokio::test]
    async fn test_claim_mismatch_deprovisions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            r#"{
                device: { id: "NEWID12345" },
                provision: { id: "OLDID12345", api: "https://api.example.com" },
            }"#,
        );
        let p = Provisioner::new(config.clone(), reqwest::Client::new());
        p.check_claim().await;
        assert!(config.read().await.api().is_none());
    }

    #[tokio::test]
    async fn test_stale_release_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            r#"{ provision: { api: "https://api.example.com" } }"#,
        );
        let p = Provisioner::new(config.clone(), reqwest::Client::new());
        let stale = (Utc::now().timestamp_millis() - 60_000).to_string();
        assert!(!p.handle_release("ioto/device/X/provision/release", &stale, false).await);
        // Provisioning was untouched
        assert!(config.read().await.api().is_some());
    }
}
