//! Device shadow state
//!
//! Maintains a local shadow document persisted to `config/shadow.json5` and
//! mirrored to the cloud shadow service. Only dedicated clouds support
//! shadows; other cloud types get a warning and no subscriptions.

use std::path::PathBuf;
use std::sync::Arc;

use rumqttc::QoS;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::{self, SharedConfig, SHADOW_FILE};
use crate::error::AgentError;
use crate::mqtt::MqttSession;
use crate::MESSAGE_SIZE;

#[derive(Clone)]
pub struct Shadow {
    inner: Arc<Inner>,
}

struct Inner {
    config: SharedConfig,
    session: MqttSession,
    path: PathBuf,
    /// `$aws/things/<thing>/shadow/name/<name>`
    base_topic: String,
    doc: Mutex<Value>,
}

/// Wrap the reported state for the shadow service.
fn build_report(doc: &Value) -> String {
    json!({ "state": { "reported": doc } }).to_string()
}

impl Shadow {
    /// Load the shadow document and build the handle. The file path is
    /// resolved first, then tested for access.
    pub async fn start(config: SharedConfig, session: MqttSession) -> Result<Shadow, AgentError> {
        let (path, base_topic) = {
            let cfg = config.read().await;
            let thing = cfg
                .device_id()
                .ok_or_else(|| AgentError::BadState("device id not set".into()))?;
            let name = cfg.get_str("cloud.shadow", "default");
            (
                cfg.config_dir.join(SHADOW_FILE),
                format!("$aws/things/{}/shadow/name/{}", thing, name),
            )
        };
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| AgentError::CantRead(format!("{}: {}", path.display(), e)))?;
            json5::from_str(&content)
                .map_err(|e| AgentError::CantRead(format!("{}: {}", path.display(), e)))?
        } else {
            json!({})
        };
        let shadow = Shadow {
            inner: Arc::new(Inner {
                config,
                session,
                path,
                base_topic,
                doc: Mutex::new(doc),
            }),
        };
        shadow.clone().spawn_receiver();
        Ok(shadow)
    }

    /// Subscribe for shadow responses and ask for the current cloud state.
    /// Call on each connect.
    pub async fn on_connect(&self) {
        let cloud_type = self.inner.config.read().await.cloud_type();
        if cloud_type.as_deref() != Some("dedicated") {
            warn!(
                "Cloud type \"{}\" does not support device shadows",
                cloud_type.unwrap_or_default()
            );
            return;
        }
        let get_topic = format!("{}/get", self.inner.base_topic);
        if let Err(e) = self
            .inner
            .session
            .publish(&get_topic, String::new(), QoS::AtLeastOnce, false)
            .await
        {
            debug!("shadow: {}", e);
        } else {
            info!("Connected to cloud shadow service");
        }
    }

    fn spawn_receiver(self) {
        let mut rx = self
            .inner
            .session
            .subscribe_local(&format!("{}/+/+", self.inner.base_topic));
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                self.receive(&msg.topic, &msg.payload).await;
            }
        });
    }

    async fn receive(&self, topic: &str, payload: &str) {
        trace!("Received shadow: {}", payload);
        if topic.ends_with("/get/accepted") {
            let parsed: Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(e) => {
                    error!("Cannot parse shadow state: {}", e);
                    return;
                }
            };
            let reported = parsed
                .get("state")
                .and_then(|s| s.get("reported"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            {
                let mut doc = self.inner.doc.lock().await;
                *doc = reported;
            }
            if let Err(e) = self.save_file().await {
                error!("shadow: {}", e);
            }
        } else if topic.ends_with("/get/rejected") {
            error!("Get shadow rejected: {}", payload);
        } else if topic.ends_with("/update/rejected") {
            error!("Update shadow rejected: {}", payload);
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.doc.lock().await.get(key).cloned()
    }

    /// Set a shadow value; optionally persist and publish immediately.
    pub async fn set(&self, key: &str, value: Value, save: bool) {
        {
            let mut doc = self.inner.doc.lock().await;
            doc[key] = value;
        }
        if save {
            if let Err(e) = self.save().await {
                error!("shadow: {}", e);
            }
        }
    }

    async fn save_file(&self) -> Result<(), AgentError> {
        let (nosave, dev_profile) = {
            let cfg = self.inner.config.read().await;
            (cfg.nosave, cfg.profile == "dev")
        };
        if nosave {
            return Ok(());
        }
        let doc = self.inner.doc.lock().await;
        let content = serde_json::to_string_pretty(&*doc)
            .map_err(|e| AgentError::CantWrite(e.to_string()))?;
        if dev_profile {
            std::fs::write(&self.inner.path, content).map_err(|e| {
                AgentError::CantWrite(format!("{}: {}", self.inner.path.display(), e))
            })?;
        } else {
            config::write_private(&self.inner.path, content.as_bytes()).map_err(|e| {
                AgentError::CantWrite(format!("{}: {}", self.inner.path.display(), e))
            })?;
        }
        Ok(())
    }

    /// Persist the document and publish the reported state.
    pub async fn save(&self) -> Result<(), AgentError> {
        self.save_file().await?;
        let payload = {
            let doc = self.inner.doc.lock().await;
            build_report(&doc)
        };
        if payload.len() > MESSAGE_SIZE {
            return Err(AgentError::WontFit(
                "shadow state is too big to publish".into(),
            ));
        }
        let topic = format!("{}/update", self.inner.base_topic);
        self.inner
            .session
            .publish(&topic, payload, QoS::AtLeastOnce, false)
            .await
    }
}
