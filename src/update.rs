//! Software update service
//!
//! Periodically checks the device cloud for firmware updates, paced by a
//! cron schedule with jitter and a minimum period between applied updates.
//! An offered image is downloaded, verified against its SHA-256 checksum,
//! handed to the apply script, and followed by a restart request.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::db::{Database, DbParams};
use crate::provision::Provisioner;
use crate::schedule::cron_until;
use crate::Lifecycle;

/// Fallback delay while the device is not yet provisioned
const UNPROVISIONED_DELAY: Duration = Duration::from_secs(60);

/// Compute the wait before the next update check: the update period since
/// the last applied update, then the cron schedule.
fn next_check_delay(
    last_update: Option<DateTime<Utc>>,
    period: Duration,
    schedule: &str,
    provisioned: bool,
    now: DateTime<Utc>,
) -> Duration {
    let since_period = match last_update {
        Some(last) => {
            let due = last + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero());
            (due - now).to_std().unwrap_or(Duration::ZERO)
        }
        None => Duration::ZERO,
    };
    let mut delay = since_period;
    if delay.is_zero() {
        delay = cron_until(schedule, now).unwrap_or(Duration::ZERO);
    }
    if !provisioned && delay.is_zero() {
        // Not yet provisioned; check back later
        delay = UNPROVISIONED_DELAY;
    }
    delay
}

/// Verify a downloaded image against the advertised checksum.
fn verify_checksum(path: &Path, checksum: &str) -> std::io::Result<bool> {
    let data = std::fs::read(path)?;
    let digest = hex::encode(Sha256::digest(&data));
    Ok(digest.eq_ignore_ascii_case(checksum.trim()))
}

pub struct Updater {
    config: SharedConfig,
    db: Arc<Database>,
    provisioner: Arc<Provisioner>,
    http: reqwest::Client,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Updater {
    pub fn new(
        config: SharedConfig,
        db: Arc<Database>,
        provisioner: Arc<Provisioner>,
        http: reqwest::Client,
        lifecycle: watch::Sender<Lifecycle>,
    ) -> Updater {
        Updater {
            config,
            db,
            provisioner,
            http,
            lifecycle,
        }
    }

    /// Run forever: wake on the schedule or an explicit trigger (the
    /// `update` device command).
    pub async fn run(self, mut trigger: mpsc::UnboundedReceiver<()>) {
        loop {
            let delay = {
                let cfg = self.config.read().await;
                let schedule = cfg.get_str("update.schedule", "* * * * *");
                let jitter = cfg.get_duration_secs("update.jitter", 0);
                let period = Duration::from_secs(cfg.get_duration_secs("update.period", 24 * 3600));
                let provisioned = cfg.api().is_some();
                let last_update = self
                    .db
                    .get_field("SyncState", "state", "lastUpdate")
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc));
                let mut delay = next_check_delay(last_update, period, &schedule, provisioned, Utc::now());
                if !delay.is_zero() && jitter > 0 {
                    delay += Duration::from_millis(rand::random::<u64>() % (jitter * 1000));
                }
                delay
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                request = trigger.recv() => {
                    if request.is_none() {
                        break;
                    }
                    info!("Update check requested");
                }
            }
            if let Err(e) = self.check_once().await {
                error!("update: {}", e);
            }
        }
    }

    /// One update check. Applies and requests a restart when a verified
    /// image is available.
    pub async fn check_once(&self) -> anyhow::Result<()> {
        let (api, token, body, image_path, apply_script) = {
            let cfg = self.config.read().await;
            let (api, token) = match (cfg.api(), cfg.api_token()) {
                (Some(api), Some(token)) => (api, token),
                _ => {
                    debug!("Update check skipped: not provisioned");
                    return Ok(());
                }
            };
            let mut body = cfg.get("device").cloned().unwrap_or_else(|| json!({}));
            body["version"] = json!(cfg.get_str("version", "1.0.0"));
            body["agentVersion"] = json!(env!("CARGO_PKG_VERSION"));
            (
                api,
                token,
                body,
                cfg.state_dir.join("update.bin"),
                cfg.get_opt("scripts.update"),
            )
        };
        let url = format!("{}/tok/provision/update", api);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            if text.contains("Cannot find device") || text.contains("Authentication failed") {
                // The device was removed or released; re-provision after a
                // restart
                info!("{}: releasing device ...", text.trim());
                self.provisioner.deprovision().await;
                let _ = self.lifecycle.send(Lifecycle::Restart);
                return Ok(());
            }
            warn!("Cannot reach device cloud for update: {}", text.trim());
            return Ok(());
        }
        let offer: Value = response.json().await?;
        let (image, checksum, version) = match (
            offer.get("url").and_then(|v| v.as_str()),
            offer.get("checksum").and_then(|v| v.as_str()),
            offer.get("version").and_then(|v| v.as_str()),
        ) {
            (Some(u), Some(c), Some(v)) => (u.to_string(), c.to_string(), v.to_string()),
            _ => {
                debug!("No update available");
                return Ok(());
            }
        };
        info!("Device has updated firmware: {}", version);
        self.download(&image, &image_path).await?;
        if !verify_checksum(&image_path, &checksum)? {
            error!("Update image checksum mismatch, discarding");
            let _ = std::fs::remove_file(&image_path);
            return Ok(());
        }
        self.mark_updated();
        if let Some(script) = apply_script {
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(format!("{} {}", script, image_path.display()))
                .status()
                .await?;
            if !status.success() {
                error!("Update apply script failed: {}", status);
                return Ok(());
            }
        }
        info!("Update applied, restarting");
        let _ = self.lifecycle.send(Lifecycle::Restart);
        Ok(())
    }

    async fn download(&self, url: &str, dest: &PathBuf) -> anyhow::Result<()> {
        let response = self.http.get(url).send().await?;
        let bytes = response.bytes().await?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &bytes)?;
        info!("Downloaded update image ({} bytes)", bytes.len());
        Ok(())
    }

    fn mark_updated(&self) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Err(e) = self.db.update(
            "SyncState",
            json!({"id": "state", "lastUpdate": now}),
            &DbParams { bypass: true, upsert: true },
        ) {
            warn!("Cannot record update time: {}", e);
        }
    }
}
