//! Local database contract
//!
//! The embedded database engine proper (schema, journal, indexing) is an
//! external collaborator. This module implements the contract the agent
//! consumes from it: models with a `sync` flag, items keyed `Model#sortKey`
//! carrying an `updated` field, commit triggers with bypass/upsert params,
//! enumeration of the primary index, and simple JSON persistence.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::AgentError;

/// Model descriptor. `sync` marks models replicated to the cloud.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub sync: bool,
    /// Field used as the sort key when building the item key
    pub key_field: String,
}

impl ModelSpec {
    pub fn new(name: &str, sync: bool) -> Self {
        Self {
            name: name.to_string(),
            sync,
            key_field: "id".to_string(),
        }
    }
}

/// A stored item: full key (`Model#sortKey`), owning model and JSON value
#[derive(Debug, Clone)]
pub struct DbItem {
    pub key: String,
    pub model: String,
    pub value: Value,
}

impl DbItem {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.value.get(name).and_then(|v| v.as_str())
    }
}

/// Trigger event classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbEvent {
    /// A mutation was committed (cmd is one of create/update/upsert/remove)
    Commit,
    /// The underlying record was freed
    Free,
}

/// Per-operation parameters passed through to triggers.
///
/// `bypass` marks mutations originating from the cloud-apply path so that
/// capture does not echo them back.
#[derive(Debug, Clone, Default)]
pub struct DbParams {
    pub bypass: bool,
    pub upsert: bool,
}

type Callback = Arc<dyn Fn(&ModelSpec, &DbItem, &DbParams, &str, DbEvent) + Send + Sync>;

/// The local item store
pub struct Database {
    path: PathBuf,
    nosave: bool,
    models: HashMap<String, ModelSpec>,
    items: Mutex<BTreeMap<String, DbItem>>,
    callbacks: Mutex<Vec<Callback>>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Split a full item key into (model, sort key)
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('#')
}

impl Database {
    /// Open the store, loading any persisted items.
    pub fn open(path: PathBuf, models: Vec<ModelSpec>, nosave: bool) -> Result<Database> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let mut items = BTreeMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read database {}", path.display()))?;
            let doc: Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse database {}", path.display()))?;
            if let Some(map) = doc.get("items").and_then(|v| v.as_object()) {
                for (key, value) in map {
                    if let Some((model, _)) = split_key(key) {
                        items.insert(
                            key.clone(),
                            DbItem {
                                key: key.clone(),
                                model: model.to_string(),
                                value: value.clone(),
                            },
                        );
                    }
                }
            }
            info!("Database loaded: {} items from {}", items.len(), path.display());
        }
        Ok(Database {
            path,
            nosave,
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
            items: Mutex::new(items),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Register a trigger invoked on every commit and free.
    pub fn add_callback<F>(&self, cb: F)
    where
        F: Fn(&ModelSpec, &DbItem, &DbParams, &str, DbEvent) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Arc::new(cb));
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    fn item_key(&self, model: &ModelSpec, value: &Value) -> Result<String, AgentError> {
        let sk = value
            .get(&model.key_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AgentError::BadArgs(format!(
                    "{} item is missing key field \"{}\"",
                    model.name, model.key_field
                ))
            })?;
        Ok(format!("{}#{}", model.name, sk))
    }

    /// Invoke triggers outside the item lock.
    fn fire(&self, model: &ModelSpec, item: &DbItem, params: &DbParams, cmd: &str, event: DbEvent) {
        let callbacks: Vec<Callback> = self.callbacks.lock().unwrap().clone();
        for cb in callbacks {
            cb(model, item, params, cmd, event);
        }
    }

    fn stamp(value: &mut Value, params: &DbParams) {
        if !value.is_object() {
            return;
        }
        // Cloud-applied items keep their authoritative updated time
        let keep = params.bypass && value.get("updated").and_then(|v| v.as_str()).is_some();
        if !keep {
            value["updated"] = json!(now_iso());
        }
    }

    /// Create an item. Fails with BadState when it already exists, unless
    /// `params.upsert` is set.
    pub fn create(&self, model: &str, mut value: Value, params: &DbParams) -> Result<DbItem, AgentError> {
        let spec = self
            .models
            .get(model)
            .ok_or_else(|| AgentError::BadArgs(format!("unknown model {}", model)))?
            .clone();
        let key = self.item_key(&spec, &value)?;
        Self::stamp(&mut value, params);
        let item = DbItem {
            key: key.clone(),
            model: spec.name.clone(),
            value,
        };
        {
            let mut items = self.items.lock().unwrap();
            if items.contains_key(&key) && !params.upsert {
                return Err(AgentError::BadState(format!("item {} already exists", key)));
            }
            items.insert(key, item.clone());
        }
        let cmd = if params.upsert { "upsert" } else { "create" };
        self.fire(&spec, &item, params, cmd, DbEvent::Commit);
        Ok(item)
    }

    /// Update an item, merging the given fields. With `params.upsert` a
    /// missing item is created instead.
    pub fn update(&self, model: &str, mut value: Value, params: &DbParams) -> Result<DbItem, AgentError> {
        let spec = self
            .models
            .get(model)
            .ok_or_else(|| AgentError::BadArgs(format!("unknown model {}", model)))?
            .clone();
        let key = self.item_key(&spec, &value)?;
        Self::stamp(&mut value, params);
        let item = {
            let mut items = self.items.lock().unwrap();
            match items.get_mut(&key) {
                Some(existing) => {
                    if let (Some(dest), Some(src)) =
                        (existing.value.as_object_mut(), value.as_object())
                    {
                        for (k, v) in src {
                            dest.insert(k.clone(), v.clone());
                        }
                    }
                    existing.clone()
                }
                None => {
                    if !params.upsert {
                        return Err(AgentError::BadState(format!("item {} not found", key)));
                    }
                    let item = DbItem {
                        key: key.clone(),
                        model: spec.name.clone(),
                        value,
                    };
                    items.insert(key.clone(), item.clone());
                    item
                }
            }
        };
        let cmd = if params.upsert { "upsert" } else { "update" };
        self.fire(&spec, &item, params, cmd, DbEvent::Commit);
        Ok(item)
    }

    /// Remove an item by model and value (key fields only are consulted).
    pub fn remove(&self, model: &str, value: &Value, params: &DbParams) -> Result<Option<DbItem>, AgentError> {
        let spec = self
            .models
            .get(model)
            .ok_or_else(|| AgentError::BadArgs(format!("unknown model {}", model)))?
            .clone();
        let key = self.item_key(&spec, value)?;
        self.remove_by_key(&key, params)
    }

    /// Remove an item by full key.
    pub fn remove_by_key(&self, key: &str, params: &DbParams) -> Result<Option<DbItem>, AgentError> {
        let removed = self.items.lock().unwrap().remove(key);
        if let Some(item) = &removed {
            let spec = match self.models.get(&item.model) {
                Some(s) => s.clone(),
                None => ModelSpec::new(&item.model, false),
            };
            self.fire(&spec, item, params, "remove", DbEvent::Commit);
        }
        Ok(removed)
    }

    /// Free an item without a remove commit (cache eviction, expiry).
    /// Fires only the Free trigger so pending sync changes die with it.
    pub fn evict(&self, key: &str) {
        let removed = self.items.lock().unwrap().remove(key);
        if let Some(item) = &removed {
            let spec = match self.models.get(&item.model) {
                Some(s) => s.clone(),
                None => ModelSpec::new(&item.model, false),
            };
            self.fire(&spec, item, &DbParams::default(), "remove", DbEvent::Free);
        }
    }

    /// Apply a cloud-originated mutation addressed by full key. Unlike the
    /// model-level operations, the item is stored at the given key verbatim.
    pub fn apply(
        &self,
        key: &str,
        mut value: Value,
        cmd: &str,
        params: &DbParams,
    ) -> Result<(), AgentError> {
        let model = split_key(key)
            .map(|(m, _)| m.to_string())
            .ok_or_else(|| AgentError::BadState(format!("bad item key {}", key)))?;
        let spec = self
            .models
            .get(&model)
            .ok_or_else(|| AgentError::BadState(format!("unknown model in key {}", key)))?
            .clone();
        if cmd == "remove" {
            self.remove_by_key(key, params)?;
            return Ok(());
        }
        Self::stamp(&mut value, params);
        let item = {
            let mut items = self.items.lock().unwrap();
            match items.get_mut(key) {
                Some(existing) => {
                    if cmd == "create" && !params.upsert {
                        return Err(AgentError::BadState(format!("item {} already exists", key)));
                    }
                    if let (Some(dest), Some(src)) =
                        (existing.value.as_object_mut(), value.as_object())
                    {
                        for (k, v) in src {
                            dest.insert(k.clone(), v.clone());
                        }
                    }
                    existing.clone()
                }
                None => {
                    let item = DbItem {
                        key: key.to_string(),
                        model: spec.name.clone(),
                        value,
                    };
                    items.insert(key.to_string(), item.clone());
                    item
                }
            }
        };
        self.fire(&spec, &item, params, cmd, DbEvent::Commit);
        Ok(())
    }

    pub fn get(&self, model: &str, sk: &str) -> Option<DbItem> {
        self.get_by_key(&format!("{}#{}", model, sk))
    }

    pub fn get_by_key(&self, key: &str) -> Option<DbItem> {
        self.items.lock().unwrap().get(key).cloned()
    }

    pub fn get_field(&self, model: &str, sk: &str, field: &str) -> Option<String> {
        self.get(model, sk)
            .and_then(|item| item.field(field).map(|s| s.to_string()))
    }

    /// Snapshot of the primary index, in key order.
    pub fn items(&self) -> Vec<DbItem> {
        self.items.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the store. A no-op when `nosave` is set.
    pub fn save(&self) -> Result<()> {
        if self.nosave {
            debug!("Database save skipped (nosave)");
            return Ok(());
        }
        let items = self.items.lock().unwrap();
        let map: serde_json::Map<String, Value> = items
            .iter()
            .map(|(k, item)| (k.clone(), item.value.clone()))
            .collect();
        let doc = json!({ "items": map });
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&doc).context("Failed to serialize database")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write database {}", self.path.display()))?;
        Ok(())
    }

    pub fn close(&self) {
        if let Err(e) = self.save() {
            warn!("Database save failed on close: {}", e);
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        Database::open(
            dir.path().join("device.db"),
            vec![ModelSpec::new("Sensor", true), ModelSpec::new("SyncState", false)],
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_create_fires_trigger_with_params() {
        let db = test_db();
        let seen = Arc::new(AtomicUsize::new(0));
        let bypassed = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let bypassed2 = bypassed.clone();
        db.add_callback(move |model, item, params, cmd, event| {
            if event == DbEvent::Commit {
                seen2.fetch_add(1, Ordering::SeqCst);
                if params.bypass {
                    bypassed2.fetch_add(1, Ordering::SeqCst);
                }
                assert!(model.sync);
                assert_eq!(cmd, "create");
                assert_eq!(item.key, "Sensor#s1");
            }
        });
        db.create("Sensor", json!({"id": "s1", "v": 1}), &DbParams::default())
            .unwrap();
        db.create(
            "Sensor",
            json!({"id": "s2", "v": 2, "updated": "2024-01-01T00:00:00.000Z"}),
            &DbParams { bypass: true, upsert: false },
        )
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(bypassed.load(Ordering::SeqCst), 1);
        // bypass keeps the authoritative updated stamp
        assert_eq!(
            db.get_field("Sensor", "s2", "updated").unwrap(),
            "2024-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn test_duplicate_create_rejected_without_upsert() {
        let db = test_db();
        db.create("Sensor", json!({"id": "s1", "v": 1}), &DbParams::default())
            .unwrap();
        assert!(db
            .create("Sensor", json!({"id": "s1", "v": 2}), &DbParams::default())
            .is_err());
        db.create(
            "Sensor",
            json!({"id": "s1", "v": 2}),
            &DbParams { bypass: false, upsert: true },
        )
        .unwrap();
        assert_eq!(db.get("Sensor", "s1").unwrap().value["v"], json!(2));
    }

    #[test]
    fn test_update_merges_fields() {
        let db = test_db();
        db.create("Sensor", json!({"id": "s1", "v": 1, "name": "tank"}), &DbParams::default())
            .unwrap();
        db.update("Sensor", json!({"id": "s1", "v": 2}), &DbParams::default())
            .unwrap();
        let item = db.get("Sensor", "s1").unwrap();
        assert_eq!(item.value["v"], json!(2));
        assert_eq!(item.value["name"], json!("tank"));
    }

    #[test]
    fn test_remove_commits_and_evict_fires_free() {
        let db = test_db();
        let frees = Arc::new(AtomicUsize::new(0));
        let removes = Arc::new(AtomicUsize::new(0));
        let frees2 = frees.clone();
        let removes2 = removes.clone();
        db.add_callback(move |_, _, _, cmd, event| match event {
            DbEvent::Free => {
                frees2.fetch_add(1, Ordering::SeqCst);
            }
            DbEvent::Commit => {
                if cmd == "remove" {
                    removes2.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        db.create("Sensor", json!({"id": "s1"}), &DbParams::default()).unwrap();
        db.create("Sensor", json!({"id": "s2"}), &DbParams::default()).unwrap();

        // Remove commits (so the deletion syncs) but does not free
        let removed = db.remove("Sensor", &json!({"id": "s1"}), &DbParams::default()).unwrap();
        assert!(removed.is_some());
        assert_eq!(removes.load(Ordering::SeqCst), 1);
        assert_eq!(frees.load(Ordering::SeqCst), 0);
        assert!(db.get("Sensor", "s1").is_none());

        // Eviction frees without a remove commit
        db.evict("Sensor#s2");
        assert_eq!(frees.load(Ordering::SeqCst), 1);
        assert_eq!(removes.load(Ordering::SeqCst), 1);
        assert!(db.get("Sensor", "s2").is_none());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");
        {
            let db = Database::open(path.clone(), vec![ModelSpec::new("Sensor", true)], false).unwrap();
            db.create("Sensor", json!({"id": "s1", "v": 7}), &DbParams::default()).unwrap();
            db.save().unwrap();
        }
        let db = Database::open(path, vec![ModelSpec::new("Sensor", true)], false).unwrap();
        assert_eq!(db.get("Sensor", "s1").unwrap().value["v"], json!(7));
    }
}
