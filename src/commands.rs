//! Command dispatcher
//!
//! Cloud commands arrive as `Command` model rows created or updated through
//! the sync path. The dispatcher reacts to the `command` field: reboot,
//! release, reprovision and update are handled directly; anything else is
//! broadcast on the signal bus as `device:command:<cmd>` for applications
//! to watch.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crate::db::{Database, DbEvent, DbItem};
use crate::provision::Provisioner;
use crate::Lifecycle;

/// Signal bus event: name plus the command item body
pub type Signal = (String, Value);

pub struct CommandDispatcher {
    provisioner: Arc<Provisioner>,
    lifecycle: watch::Sender<Lifecycle>,
    bus: broadcast::Sender<Signal>,
    update_tx: Option<mpsc::UnboundedSender<()>>,
}

impl CommandDispatcher {
    /// Register the database trigger and start the dispatch task. Returns
    /// the signal bus handle for application subscribers.
    pub fn start(
        db: &Database,
        provisioner: Arc<Provisioner>,
        lifecycle: watch::Sender<Lifecycle>,
        update_tx: Option<mpsc::UnboundedSender<()>>,
    ) -> broadcast::Sender<Signal> {
        let (bus, _) = broadcast::channel(16);
        let dispatcher = CommandDispatcher {
            provisioner,
            lifecycle,
            bus: bus.clone(),
            update_tx,
        };
        let (tx, rx) = mpsc::unbounded_channel::<DbItem>();
        db.add_callback(move |model, item, _params, cmd, event| {
            if event == DbEvent::Commit
                && model.name == "Command"
                && matches!(cmd, "create" | "update" | "upsert")
            {
                let _ = tx.send(item.clone());
            }
        });
        tokio::spawn(dispatcher.run(rx));
        bus
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<DbItem>) {
        info!("Command dispatcher started");
        while let Some(item) = rx.recv().await {
            self.dispatch(item).await;
        }
    }

    async fn dispatch(&self, item: DbItem) {
        let command = match item.field("command") {
            Some(cmd) => cmd.to_string(),
            None => {
                warn!("Command item {} has no command field", item.key);
                return;
            }
        };
        info!("Got device command {}", command);
        match command.as_str() {
            "reboot" => {
                let _ = self.lifecycle.send(Lifecycle::Restart);
            }
            "release" => {
                self.provisioner.deprovision().await;
            }
            "reprovision" => {
                self.provisioner.deprovision().await;
                if let Err(e) = self.provisioner.provision().await {
                    error!("reprovision: {}", e);
                }
            }
            "update" => match &self.update_tx {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => warn!("Update service not enabled"),
            },
            other => {
                // Signal other command watchers
                let name = format!("device:command:{}", other);
                let _ = self.bus.send((name, item.value.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Overrides};
    use crate::db::{DbParams, ModelSpec};
    use serde_json::json;
    use std::path::Path;

    async fn test_fixture(dir: &Path) -> (Arc<Database>, broadcast::Sender<Signal>, watch::Receiver<Lifecycle>) {
        std::fs::write(dir.join("ioto.json5"), "{}").unwrap();
        let overrides = Overrides {
            config_dir: Some(dir.to_path_buf()),
            state_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        let config = Arc::new(tokio::sync::RwLock::new(Config::load(&overrides).unwrap()));
        let provisioner = Provisioner::new(config, reqwest::Client::new());
        let db = Arc::new(
            Database::open(dir.join("device.db"), vec![ModelSpec::new("Command", true)], true)
                .unwrap(),
        );
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Run);
        let bus = CommandDispatcher::start(&db, provisioner, lifecycle_tx, None);
        (db, bus, lifecycle_rx)
    }

    #[tokio::test]
    async fn test_reboot_requests_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _bus, mut lifecycle) = test_fixture(dir.path()).await;
        db.create(
            "Command",
            json!({"id": "c1", "command": "reboot"}),
            &DbParams { bypass: true, upsert: true },
        )
        .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), lifecycle.changed())
            .await
            .expect("lifecycle change")
            .unwrap();
        assert_eq!(*lifecycle.borrow(), Lifecycle::Restart);
    }

    #[tokio::test]
    async fn test_unknown_command_signals_bus() {
        let dir = tempfile::tempdir().unwrap();
        let (db, bus, _lifecycle) = test_fixture(dir.path()).await;
        let mut signals = bus.subscribe();
        db.create(
            "Command",
            json!({"id": "c2", "command": "blink", "args": {"times": 3}}),
            &DbParams { bypass: true, upsert: true },
        )
        .unwrap();
        let (name, body) =
            tokio::time::timeout(std::time::Duration::from_secs(2), signals.recv())
                .await
                .expect("signal")
                .unwrap();
        assert_eq!(name, "device:command:blink");
        assert_eq!(body["args"]["times"], json!(3));
    }

    #[tokio::test]
    async fn test_non_command_models_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ioto.json5"), "{}").unwrap();
        let overrides = Overrides {
            config_dir: Some(dir.path().to_path_buf()),
            state_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = Arc::new(tokio::sync::RwLock::new(Config::load(&overrides).unwrap()));
        let provisioner = Provisioner::new(config, reqwest::Client::new());
        let db = Arc::new(
            Database::open(
                dir.path().join("device.db"),
                vec![ModelSpec::new("Command", true), ModelSpec::new("Sensor", true)],
                true,
            )
            .unwrap(),
        );
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Run);
        let bus = CommandDispatcher::start(&db, provisioner, lifecycle_tx, None);
        let mut signals = bus.subscribe();
        db.create(
            "Sensor",
            json!({"id": "s1", "command": "reboot"}),
            &DbParams::default(),
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(signals.try_recv().is_err());
        assert_eq!(*lifecycle_rx.borrow(), Lifecycle::Run);
    }
}
