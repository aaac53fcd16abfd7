//! Bidirectional database sync engine
//!
//! Local mutations are captured from database triggers into a coalescing
//! change buffer backed by a crash-safe sync log, then published to the
//! cloud in sequenced batches. Cloud acknowledgements free the matching
//! changes. Cloud-originated mutations arrive over the sync topics and are
//! applied with bypass to prevent echo.
//!
//! The engine runs as a single task owning all mutable state; the rest of
//! the agent talks to it through a cloneable [`SyncHandle`].

pub mod log;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::db::{Database, DbEvent, DbItem, DbParams, ModelSpec};
use crate::MESSAGE_SIZE;
use self::log::SyncLog;

/// Retransmit window after a change is published
const SYNC_DELAY: Duration = Duration::from_secs(5);

/// Batch ceiling leaves room for the envelope within one MQTT message
const BATCH_CEILING: usize = MESSAGE_SIZE - 1024;

/// An MQTT publish produced by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: String,
}

/// One pending local mutation awaiting cloud acknowledgement.
///
/// `seq == 0` means the change is buffered and has never been published in
/// its current form; it may be freely overwritten. A non-zero `seq` matches
/// the batch it was last published in.
#[derive(Debug, Clone)]
struct Change {
    cmd: String,
    key: String,
    data: String,
    updated: String,
    due: Instant,
    seq: i32,
}

/// Messages accepted by the engine task
pub enum SyncMsg {
    Capture {
        model: ModelSpec,
        item: DbItem,
        params: DbParams,
        cmd: String,
        guarantee: bool,
    },
    Free {
        key: String,
    },
    Flush {
        force: bool,
    },
    Connected,
    Disconnected,
    Receive {
        topic: String,
        payload: String,
    },
    SyncDown {
        when: Option<String>,
    },
    SyncUp {
        guarantee: bool,
    },
}

/// Cloneable handle to the engine task
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncMsg>,
}

impl SyncHandle {
    pub fn capture(&self, model: ModelSpec, item: DbItem, params: DbParams, cmd: &str) {
        let _ = self.tx.send(SyncMsg::Capture {
            model,
            item,
            params,
            cmd: cmd.to_string(),
            guarantee: true,
        });
    }

    pub fn free(&self, key: &str) {
        let _ = self.tx.send(SyncMsg::Free { key: key.to_string() });
    }

    pub fn flush(&self, force: bool) {
        let _ = self.tx.send(SyncMsg::Flush { force });
    }

    pub fn connected(&self) {
        let _ = self.tx.send(SyncMsg::Connected);
    }

    pub fn disconnected(&self) {
        let _ = self.tx.send(SyncMsg::Disconnected);
    }

    pub fn receive(&self, topic: &str, payload: &str) {
        let _ = self.tx.send(SyncMsg::Receive {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Request changes made in the cloud since `when` (default: persisted
    /// last sync-down time).
    pub fn sync_down(&self, when: Option<String>) {
        let _ = self.tx.send(SyncMsg::SyncDown { when });
    }

    /// Re-emit every syncing record, then flush.
    pub fn sync_up(&self, guarantee: bool) {
        let _ = self.tx.send(SyncMsg::SyncUp { guarantee });
    }
}

pub struct SyncEngine {
    db: Arc<Database>,
    log: SyncLog,
    changes: HashMap<String, Change>,
    next_seq: i32,
    sync_size: usize,
    max_sync_size: usize,
    publisher: mpsc::UnboundedSender<Outbound>,
    device_id: String,
    connected: bool,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        publisher: mpsc::UnboundedSender<Outbound>,
        device_id: String,
        max_sync_size: usize,
        nosave: bool,
    ) -> SyncEngine {
        let mut log = SyncLog::open(db.path(), nosave);

        // Rebuild the change buffer from the crash log; identical keys
        // coalesce and replay order makes the last write win.
        let now = Instant::now();
        let mut changes = HashMap::new();
        for entry in log.replay() {
            changes.insert(
                entry.key.clone(),
                Change {
                    cmd: entry.cmd,
                    key: entry.key,
                    data: entry.data,
                    updated: entry.updated,
                    due: now,
                    seq: 0,
                },
            );
        }
        if !changes.is_empty() {
            info!("Recovered {} pending changes from sync log", changes.len());
        }
        SyncEngine {
            db,
            log,
            changes,
            // Start from a random value so restarted sessions do not reuse
            // recent batch numbers; zero is reserved for "never published".
            next_seq: (rand::random::<u32>() % (i32::MAX as u32 - 1)) as i32 + 1,
            sync_size: 0,
            max_sync_size,
            publisher,
            device_id,
            connected: false,
        }
    }

    /// Run the engine until the handle side is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SyncMsg>) {
        loop {
            let deadline = self.next_due();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = async {
                    match deadline {
                        Some(due) => {
                            let now = Instant::now();
                            tokio::time::sleep(due.saturating_duration_since(now)).await
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    self.flush(false);
                }
            }
        }
        debug!("Sync engine stopped");
    }

    fn handle(&mut self, msg: SyncMsg) {
        match msg {
            SyncMsg::Capture { model, item, params, cmd, guarantee } => {
                self.capture(&model, &item, &params, &cmd, guarantee)
            }
            SyncMsg::Free { key } => self.free(&key),
            SyncMsg::Flush { force } => self.flush(force),
            SyncMsg::Connected => {
                self.connected = true;
                if !self.changes.is_empty() {
                    self.flush(false);
                }
            }
            SyncMsg::Disconnected => self.connected = false,
            SyncMsg::Receive { topic, payload } => self.receive(&topic, &payload),
            SyncMsg::SyncDown { when } => self.sync_down(when),
            SyncMsg::SyncUp { guarantee } => self.sync_up(guarantee),
        }
    }

    /// Earliest pending due time, when connected with pending changes.
    fn next_due(&self) -> Option<Instant> {
        if !self.connected || self.changes.is_empty() {
            return None;
        }
        self.changes.values().map(|c| c.due).min()
    }

    /// Capture one committed mutation into the change buffer.
    fn capture(&mut self, model: &ModelSpec, item: &DbItem, params: &DbParams, cmd: &str, guarantee: bool) {
        if !model.sync || params.bypass {
            return;
        }
        let data = item.value.to_string();
        let updated = item.field("updated").unwrap_or_default().to_string();
        let now = Instant::now();

        match self.changes.get_mut(&item.key) {
            Some(change) => {
                // A published change keeps living until acked, but an
                // overwrite invalidates its in-flight seq: the stale ack no
                // longer matches and the new value gets a fresh seq on the
                // next batch.
                change.cmd = cmd.to_string();
                change.data = data.clone();
                change.updated = updated.clone();
                change.due = now;
                change.seq = 0;
            }
            None => {
                self.changes.insert(
                    item.key.clone(),
                    Change {
                        cmd: cmd.to_string(),
                        key: item.key.clone(),
                        data: data.clone(),
                        updated: updated.clone(),
                        due: now,
                        seq: 0,
                    },
                );
            }
        }
        if guarantee {
            match self.log.append(cmd, &data, &item.key, &updated) {
                Ok(n) => self.sync_size += n,
                Err(e) => warn!("sync: {}", e),
            }
        }
        if self.connected && self.sync_size >= self.max_sync_size {
            self.flush(false);
        }
    }

    /// The record itself was freed; its pending change dies with it.
    fn free(&mut self, key: &str) {
        if self.changes.remove(key).is_some() && self.changes.is_empty() {
            self.sync_size = 0;
            if let Err(e) = self.log.truncate() {
                warn!("sync: {}", e);
            }
        }
    }

    /// Publish due changes as one sequenced batch.
    fn flush(&mut self, force: bool) {
        if !self.connected {
            return;
        }
        let now = Instant::now();
        let mut batch = String::new();
        let mut seq = 0;
        let mut count = 0usize;
        let mut pending = 0usize;

        let keys: Vec<String> = self.changes.keys().cloned().collect();
        for key in keys {
            let due_now = match self.changes.get(&key) {
                Some(change) => force || change.due <= now,
                None => continue,
            };
            if !due_now {
                pending += 1;
                continue;
            }
            if batch.is_empty() {
                seq = self.next_seq;
                self.next_seq = if self.next_seq >= i32::MAX { 1 } else { self.next_seq + 1 };
                batch = format!("{{\"seq\":{},\"changes\":[", seq);
            }
            let Some(change) = self.changes.get_mut(&key) else {
                continue;
            };
            let entry = format!(
                "{{\"cmd\":{},\"key\":{},\"item\":{}}},",
                json!(change.cmd),
                json!(change.key),
                change.data
            );
            if batch.len() + entry.len() > BATCH_CEILING {
                if count == 0 {
                    // A single oversized change can never fit in a message
                    warn!("Dropping change {} that exceeds the batch ceiling", key);
                    self.changes.remove(&key);
                    continue;
                }
                // Batch is full; the remainder keeps its due time and goes
                // out on the next flush.
                break;
            }
            batch.push_str(&entry);
            change.seq = seq;
            change.due = now + SYNC_DELAY;
            count += 1;
        }
        self.sync_size = 0;
        if count == 0 {
            return;
        }
        batch.pop();
        batch.push_str("]}");

        trace!("Sending {} sync changes, {} pending", count, pending);
        let topic = format!(
            "$aws/rules/IotoDevice/ioto/service/{}/db/syncToDynamo",
            self.device_id
        );
        let _ = self.publisher.send(Outbound { topic, payload: batch });
    }

    /// Free changes the cloud acknowledged. A key whose current seq does
    /// not match reflects a subsequent overwrite and is left alone.
    fn ack(&mut self, json: &Value) {
        let seq = json.get("seq").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let keys = match json.get("keys").and_then(|v| v.as_array()) {
            Some(keys) => keys,
            None => return,
        };
        let before = self.changes.len();
        for key in keys {
            if let Some(key) = key.as_str() {
                if self.changes.get(key).map(|c| c.seq) == Some(seq) {
                    self.changes.remove(key);
                }
            }
        }
        if before > 0 && self.changes.is_empty() {
            self.sync_size = 0;
            if let Err(e) = self.log.truncate() {
                warn!("sync: {}", e);
            }
        }
    }

    /// Handle a message from the sync topics. The trailing topic segment
    /// selects the operation.
    fn receive(&mut self, topic: &str, payload: &str) {
        let json: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!("Cannot parse sync message on {}: {}", topic, e);
                return;
            }
        };
        let op = topic.rsplit('/').next().unwrap_or_default();
        match op {
            "SYNC" => self.ack(&json),
            "SYNCDOWN" | "SYNCUP" => {
                let updated = json.get("updated").and_then(|v| v.as_str()).unwrap_or_default();
                let last = self.db.get_field("SyncState", "state", "lastSyncDown");
                if last.as_deref().map_or(true, |l| l < updated) {
                    info!("Sync down complete for {}", updated);
                    let _ = self.db.update(
                        "SyncState",
                        json!({"id": "state", "lastSyncDown": updated}),
                        &DbParams { bypass: true, upsert: true },
                    );
                }
            }
            "INSERT" | "REMOVE" | "UPSERT" | "MODIFY" => self.apply(op, &json),
            _ => debug!("Bad sync topic {}", topic),
        }
    }

    /// Apply one cloud mutation with stale-update suppression.
    fn apply(&mut self, op: &str, json: &Value) {
        let key = match json.get("sk").and_then(|v| v.as_str()) {
            Some(sk) => sk.to_string(),
            None => {
                debug!("Sync message missing sk");
                return;
            }
        };
        if let Some(prior) = self.db.get_by_key(&key) {
            if let (Some(incoming), Some(prior_updated)) =
                (json.get("updated").and_then(|v| v.as_str()), prior.field("updated"))
            {
                if incoming < prior_updated {
                    trace!("Discard stale sync update for {}", key);
                    return;
                }
            }
        }
        let params = DbParams {
            bypass: true,
            upsert: matches!(op, "UPSERT" | "MODIFY"),
        };
        let cmd = match op {
            "REMOVE" => "remove",
            "INSERT" => "create",
            _ => "update",
        };
        if let Err(e) = self.db.apply(&key, json.clone(), cmd, &params) {
            debug!("Sync apply dropped for {}: {}", key, e);
        }
    }

    fn sync_down(&mut self, when: Option<String>) {
        let last = when
            .or_else(|| self.db.get_field("SyncState", "state", "lastSyncDown"))
            .unwrap_or_else(|| "0".to_string());
        let topic = format!(
            "$aws/rules/IotoDevice/ioto/service/{}/db/syncUp",
            self.device_id
        );
        let payload = json!({ "lastSync": last }).to_string();
        let _ = self.publisher.send(Outbound { topic, payload });
    }

    fn sync_up(&mut self, guarantee: bool) {
        for item in self.db.items() {
            if let Some(spec) = self.db.model(&item.model).cloned() {
                if spec.sync {
                    self.capture(&spec, &item, &DbParams::default(), "update", guarantee);
                }
            }
        }
        self.flush(false);
    }
}

/// Start the engine and register its database trigger.
pub fn start(
    db: Arc<Database>,
    publisher: mpsc::UnboundedSender<Outbound>,
    device_id: String,
    max_sync_size: usize,
    nosave: bool,
) -> SyncHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SyncHandle { tx };

    let engine = SyncEngine::new(db.clone(), publisher, device_id, max_sync_size, nosave);
    tokio::spawn(engine.run(rx));

    let trigger = handle.clone();
    db.add_callback(move |model, item, params, cmd, event| match event {
        DbEvent::Commit => trigger.capture(model.clone(), item.clone(), params.clone(), cmd),
        DbEvent::Free => trigger.free(&item.key),
    });
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ModelSpec;
    use tempfile::TempDir;

    fn test_setup() -> (SyncEngine, mpsc::UnboundedReceiver<Outbound>, Arc<Database>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            Database::open(
                dir.path().join("device.db"),
                vec![ModelSpec::new("Sensor", true), ModelSpec::new("SyncState", false)],
                true,
            )
            .unwrap(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = SyncEngine::new(db.clone(), tx, "D123456789".to_string(), 1024, false);
        engine.connected = true;
        (engine, rx, db, dir)
    }

    fn sensor_item(db: &Database, id: &str, v: i64) -> DbItem {
        db.create(
            "Sensor",
            json!({"id": id, "v": v}),
            &DbParams { bypass: false, upsert: true },
        )
        .unwrap()
    }

    #[test]
    fn test_capture_and_flush_publishes_batch() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        let spec = db.model("Sensor").unwrap().clone();
        let item = sensor_item(&db, "s1", 1);
        engine.capture(&spec, &item, &DbParams::default(), "create", true);
        engine.flush(false);

        let out = rx.try_recv().unwrap();
        assert_eq!(
            out.topic,
            "$aws/rules/IotoDevice/ioto/service/D123456789/db/syncToDynamo"
        );
        assert!(out.payload.contains("\"cmd\":\"create\""));
        assert!(out.payload.contains("\"key\":\"Sensor#s1\""));
        assert!(out.payload.contains("\"v\":1"));
        let parsed: Value = serde_json::from_str(&out.payload).unwrap();
        assert!(parsed["seq"].as_i64().unwrap() >= 1);
        assert_eq!(parsed["changes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_coalesce_keeps_latest_value() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        let spec = db.model("Sensor").unwrap().clone();
        let item1 = sensor_item(&db, "s1", 1);
        let item2 = sensor_item(&db, "s1", 2);
        engine.capture(&spec, &item1, &DbParams::default(), "create", true);
        engine.capture(&spec, &item2, &DbParams::default(), "update", true);

        // At most one change per key
        assert_eq!(engine.changes.len(), 1);
        engine.flush(false);
        let out = rx.try_recv().unwrap();
        assert!(out.payload.contains("\"v\":2"));
        assert!(!out.payload.contains("\"v\":1"));
    }

    #[test]
    fn test_overwrite_after_publish_invalidates_ack() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        let spec = db.model("Sensor").unwrap().clone();
        let item1 = sensor_item(&db, "s1", 1);
        engine.capture(&spec, &item1, &DbParams::default(), "create", true);
        engine.flush(false);
        let out = rx.try_recv().unwrap();
        let published: Value = serde_json::from_str(&out.payload).unwrap();
        let seq = published["seq"].as_i64().unwrap();

        // Update lands before the ack for the first publish
        let item2 = sensor_item(&db, "s1", 2);
        engine.capture(&spec, &item2, &DbParams::default(), "update", true);

        engine.receive(
            "ioto/device/D123456789/sync/SYNC",
            &json!({"seq": seq, "keys": ["Sensor#s1"]}).to_string(),
        );

        // The stale ack was dropped; the new value is still buffered
        assert_eq!(engine.changes.len(), 1);
        assert!(engine.changes["Sensor#s1"].data.contains("\"v\":2"));

        // The next flush assigns a fresh seq
        engine.flush(true);
        let out = rx.try_recv().unwrap();
        let next: Value = serde_json::from_str(&out.payload).unwrap();
        assert_ne!(next["seq"].as_i64().unwrap(), seq);
    }

    #[test]
    fn test_ack_empties_buffer_and_truncates_log() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        let spec = db.model("Sensor").unwrap().clone();
        let item = sensor_item(&db, "s1", 1);
        engine.capture(&spec, &item, &DbParams::default(), "create", true);
        assert!(engine.log.size() > 0);
        engine.flush(false);
        let out = rx.try_recv().unwrap();
        let seq = serde_json::from_str::<Value>(&out.payload).unwrap()["seq"]
            .as_i64()
            .unwrap();

        engine.receive(
            "ioto/device/D123456789/sync/SYNC",
            &json!({"seq": seq, "keys": ["Sensor#s1"]}).to_string(),
        );
        assert!(engine.changes.is_empty());
        assert_eq!(engine.log.size(), 0);
    }

    #[test]
    fn test_replay_reconstructs_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            Database::open(dir.path().join("device.db"), vec![ModelSpec::new("Sensor", true)], true)
                .unwrap(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        {
            let mut engine = SyncEngine::new(db.clone(), tx.clone(), "D1".into(), 1024, false);
            engine.connected = true;
            let spec = db.model("Sensor").unwrap().clone();
            let i1 = sensor_item(&db, "s1", 1);
            engine.capture(&spec, &i1, &DbParams::default(), "create", true);
            let i2 = sensor_item(&db, "s1", 2);
            engine.capture(&spec, &i2, &DbParams::default(), "update", true);
            let i3 = sensor_item(&db, "s2", 3);
            engine.capture(&spec, &i3, &DbParams::default(), "create", true);
            // Killed here: no flush, no truncate
        }
        let engine = SyncEngine::new(db.clone(), tx, "D1".into(), 1024, false);
        assert_eq!(engine.changes.len(), 2);
        // Replay preserves order, so the last write wins
        assert!(engine.changes["Sensor#s1"].data.contains("\"v\":2"));
        assert_eq!(engine.changes["Sensor#s1"].seq, 0);
    }

    #[test]
    fn test_batch_ceiling_splits_flush() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        let spec = db.model("Sensor").unwrap().clone();
        // Each item carries ~32 KiB of payload, so at most a few fit per batch
        let blob = "x".repeat(32 * 1024);
        for i in 0..8 {
            let item = db
                .create(
                    "Sensor",
                    json!({"id": format!("s{}", i), "blob": blob}),
                    &DbParams { bypass: false, upsert: true },
                )
                .unwrap();
            engine.capture(&spec, &item, &DbParams::default(), "create", false);
        }
        engine.flush(true);
        let first = rx.try_recv().unwrap();
        assert!(first.payload.len() <= BATCH_CEILING + 2);
        let sent: Value = serde_json::from_str(&first.payload).unwrap();
        let sent_count = sent["changes"].as_array().unwrap().len();
        assert!(sent_count < 8, "ceiling must split the batch");
        // The remainder is still buffered with seq 0
        let remaining = engine.changes.values().filter(|c| c.seq == 0).count();
        assert_eq!(remaining, 8 - sent_count);
    }

    #[test]
    fn test_seq_wraps_to_one() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        let spec = db.model("Sensor").unwrap().clone();
        engine.next_seq = i32::MAX;
        let item = sensor_item(&db, "s1", 1);
        engine.capture(&spec, &item, &DbParams::default(), "create", false);
        engine.flush(true);
        let out = rx.try_recv().unwrap();
        let seq = serde_json::from_str::<Value>(&out.payload).unwrap()["seq"].as_i64().unwrap();
        assert_eq!(seq, i32::MAX as i64);
        assert_eq!(engine.next_seq, 1);
    }

    #[test]
    fn test_receive_insert_applies_with_bypass() {
        let (mut engine, _rx, db, _dir) = test_setup();
        let msg = json!({
            "sk": "Sensor#s9",
            "id": "s9",
            "v": 9,
            "updated": "2030-01-01T00:00:00.000Z"
        });
        engine.receive("ioto/device/D123456789/sync/INSERT", &msg.to_string());
        assert_eq!(db.get("Sensor", "s9").unwrap().value["v"], json!(9));
        // Applied with bypass: nothing was captured for echo
        assert!(engine.changes.is_empty());

        // The same INSERT again is a no-op
        engine.receive("ioto/device/D123456789/sync/INSERT", &msg.to_string());
        assert_eq!(db.get("Sensor", "s9").unwrap().value["v"], json!(9));
    }

    #[test]
    fn test_stale_update_is_discarded() {
        let (mut engine, _rx, db, _dir) = test_setup();
        db.create(
            "Sensor",
            json!({"id": "s1", "v": 5, "updated": "2030-06-01T00:00:00.000Z"}),
            &DbParams { bypass: true, upsert: false },
        )
        .unwrap();
        let stale = json!({
            "sk": "Sensor#s1",
            "id": "s1",
            "v": 1,
            "updated": "2030-01-01T00:00:00.000Z"
        });
        engine.receive("ioto/device/D123456789/sync/UPSERT", &stale.to_string());
        assert_eq!(db.get("Sensor", "s1").unwrap().value["v"], json!(5));
    }

    #[test]
    fn test_sync_down_publishes_last_sync() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        db.create(
            "SyncState",
            json!({"id": "state", "lastSyncDown": "2030-02-02T00:00:00.000Z"}),
            &DbParams { bypass: true, upsert: true },
        )
        .unwrap();
        engine.sync_down(None);
        let out = rx.try_recv().unwrap();
        assert_eq!(out.topic, "$aws/rules/IotoDevice/ioto/service/D123456789/db/syncUp");
        let parsed: Value = serde_json::from_str(&out.payload).unwrap();
        assert_eq!(parsed["lastSync"], json!("2030-02-02T00:00:00.000Z"));
    }

    #[test]
    fn test_sync_up_reemits_all_syncing_records() {
        let (mut engine, mut rx, db, _dir) = test_setup();
        sensor_item(&db, "s1", 1);
        sensor_item(&db, "s2", 2);
        db.create("SyncState", json!({"id": "state"}), &DbParams { bypass: true, upsert: true })
            .unwrap();
        engine.sync_up(false);
        let out = rx.try_recv().unwrap();
        let parsed: Value = serde_json::from_str(&out.payload).unwrap();
        let changes = parsed["changes"].as_array().unwrap();
        // SyncState does not sync
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c["cmd"] == json!("update")));
    }

    #[test]
    fn test_free_drops_change() {
        let (mut engine, _rx, db, _dir) = test_setup();
        let spec = db.model("Sensor").unwrap().clone();
        let item = sensor_item(&db, "s1", 1);
        engine.capture(&spec, &item, &DbParams::default(), "create", true);
        assert_eq!(engine.changes.len(), 1);
        engine.free("Sensor#s1");
        assert!(engine.changes.is_empty());
        assert_eq!(engine.log.size(), 0);
    }
}
