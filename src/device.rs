//! Device claim identity
//!
//! Derives the stable 10-character claim ID used to associate the device
//! with an account during first-time cloud claim. The ID is derived once
//! (`auto` generates it, `factory` asks an external serialization service or
//! local command) and persisted to `config/device.json5`; a persisted
//! installation never re-derives it.

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::SharedConfig;
use crate::error::AgentError;

const CLAIM_ID_LEN: usize = 10;
const FACTORY_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Generate a printable claim ID from a cryptographic RNG.
pub fn generate_claim_id() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(CLAIM_ID_LEN)
        .map(char::from)
        .collect()
}

/// Ensure the device has a claim ID, deriving one when needed.
///
/// Blocks until an ID is available. Returns the ID, or an error for modes
/// that cannot make progress.
pub async fn serialize(config: &SharedConfig, http: &reqwest::Client) -> Result<String, AgentError> {
    {
        let cfg = config.read().await;
        if let Some(id) = cfg.device_id() {
            if id != "auto" {
                return Ok(id);
            }
        }
    }
    let mode = {
        let cfg = config.read().await;
        cfg.services
            .serialize
            .clone()
            .unwrap_or_else(|| "auto".to_string())
    };
    loop {
        match derive_id(config, http, &mode).await? {
            Some(id) => {
                let mut cfg = config.write().await;
                cfg.set("device.id", json!(id));
                if let Err(e) = cfg.save_device() {
                    error!("Cannot save device identity: {}", e);
                    return Err(AgentError::CantWrite(e.to_string()));
                }
                info!("Device claim ID: {}", id);
                return Ok(id);
            }
            None => tokio::time::sleep(RETRY_DELAY).await,
        }
    }
}

async fn derive_id(
    config: &SharedConfig,
    http: &reqwest::Client,
    mode: &str,
) -> Result<Option<String>, AgentError> {
    match mode {
        "none" => Err(AgentError::BadArgs(
            "device id required when serialization is disabled".into(),
        )),
        "factory" => {
            let (endpoint, descriptor, product) = {
                let cfg = config.read().await;
                let endpoint = cfg.get_opt("api.serialize").ok_or_else(|| {
                    AgentError::BadArgs("missing api.serialize endpoint".into())
                })?;
                let descriptor = cfg.get("device").cloned().unwrap_or_else(|| json!({}));
                (endpoint, descriptor, cfg.product().unwrap_or_default())
            };
            if endpoint.starts_with("http") {
                Ok(fetch_factory_id(http, &endpoint, &descriptor).await)
            } else {
                Ok(run_factory_command(&endpoint, &product).await)
            }
        }
        // Default "auto"
        _ => Ok(Some(generate_claim_id())),
    }
}

/// Ask the manufacturing controller for a device ID.
async fn fetch_factory_id(http: &reqwest::Client, endpoint: &str, descriptor: &Value) -> Option<String> {
    let response = http
        .post(endpoint)
        .timeout(FACTORY_TIMEOUT)
        .json(descriptor)
        .send()
        .await;
    match response {
        Ok(resp) => match resp.json::<Value>().await {
            Ok(body) => match body.get("id").and_then(|v| v.as_str()) {
                Some(id) => Some(id.to_string()),
                None => {
                    error!("Cannot find device ID in serialization response");
                    None
                }
            },
            Err(e) => {
                error!("Cannot parse serialization response: {}", e);
                None
            }
        },
        Err(e) => {
            error!("Cannot fetch device ID from {}: {}", endpoint, e);
            None
        }
    }
}

/// Run a local serialization command and parse the `id` field of its output.
async fn run_factory_command(command: &str, product: &str) -> Option<String> {
    let output = tokio::process::Command::new(command)
        .arg(product)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            match serde_json::from_str::<Value>(stdout.trim()) {
                Ok(body) => body.get("id").and_then(|v| v.as_str()).map(String::from),
                // Plain text output is the ID itself
                Err(_) => {
                    let id = stdout.trim().to_string();
                    (!id.is_empty()).then_some(id)
                }
            }
        }
        Ok(out) => {
            error!("Serialization command failed with status {}", out.status);
            None
        }
        Err(e) => {
            error!("Cannot run serialization command {}: {}", command, e);
            None
        }
    }
}
