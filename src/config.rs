//! Configuration management
//!
//! Loads the layered JSON5 configuration documents and blends them into a
//! single tree: the master file, optional local overrides (applied before
//! and after the other layers as a last-chance override), optional
//! web/device/provision overlays, and `conditional.profile.<name>` sections
//! selected by CLI, environment, or config. Later layers win; `conditional`
//! is merged after each layer and then removed from the tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::AgentError;

pub const CONFIG_FILE: &str = "ioto.json5";
pub const LOCAL_FILE: &str = "local.json5";
pub const WEB_FILE: &str = "web.json5";
pub const DEVICE_FILE: &str = "device.json5";
pub const PROVISION_FILE: &str = "provision.json5";
pub const SHADOW_FILE: &str = "shadow.json5";

pub const CERTIFICATE_FILE: &str = "device.crt";
pub const KEY_FILE: &str = "device.key";

/// Unconfigured product token sentinel
pub const PRODUCT_PLACEHOLDER: &str = "PUT-YOUR-PRODUCT-ID-HERE";

const DEFAULT_BUILDER: &str = "https://api.admin.nimbusedge.io/api";

/// Shared handle to the loaded configuration
pub type SharedConfig = Arc<tokio::sync::RwLock<Config>>;

/// Command line / environment overrides applied during load
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub ioto_file: Option<PathBuf>,
    pub id: Option<String>,
    pub product: Option<String>,
    pub account: Option<String>,
    pub cloud: Option<String>,
    pub profile: Option<String>,
    pub reset: bool,
    pub test: bool,
}

/// Enabled services, resolved from the central boolean table
#[derive(Debug, Clone, Default)]
pub struct Services {
    pub web: bool,
    pub database: bool,
    pub update: bool,
    pub logs: bool,
    pub keys: bool,
    pub mqtt: bool,
    pub provision: bool,
    pub shadow: bool,
    pub sync: bool,
    pub register: bool,
    pub test: bool,
    /// Claim ID derivation mode: auto, factory, none
    pub serialize: Option<String>,
}

pub struct Config {
    tree: Value,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub profile: String,
    pub services: Services,
    pub nosave: bool,
    pub test_mode: bool,
}

/// Deep-merge `src` into `dest`: objects merge recursively, everything else
/// is overwritten.
pub fn merge(dest: &mut Value, src: &Value) {
    if let (Value::Object(d), Value::Object(s)) = (&mut *dest, src) {
        for (key, value) in s {
            match d.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    merge(existing, value);
                }
                _ => {
                    d.insert(key.clone(), value.clone());
                }
            }
        }
    } else {
        *dest = src.clone();
    }
}

/// Parse a duration setting: a bare number of seconds or "N unit".
pub fn parse_duration(value: &Value, default_secs: u64) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(default_secs),
        Value::String(s) => {
            let s = s.trim();
            let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
                Some(pos) => (&s[..pos], s[pos..].trim()),
                None => (s, ""),
            };
            let n: u64 = match num.parse() {
                Ok(n) => n,
                Err(_) => return default_secs,
            };
            match unit {
                "" | "sec" | "secs" | "second" | "seconds" => n,
                "min" | "mins" | "minute" | "minutes" => n * 60,
                "hr" | "hrs" | "hour" | "hours" => n * 3600,
                "day" | "days" => n * 86400,
                "week" | "weeks" => n * 7 * 86400,
                _ => default_secs,
            }
        }
        _ => default_secs,
    }
}

/// Parse a size setting: a bare byte count or a k/m/g suffixed string.
pub fn parse_size(value: &Value, default: usize) -> usize {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(default as u64) as usize,
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
                Some(pos) => (s[..pos].to_string(), s[pos..].trim().to_string()),
                None => (s.clone(), String::new()),
            };
            let n: usize = match num.parse() {
                Ok(n) => n,
                Err(_) => return default,
            };
            match unit.as_str() {
                "" | "b" => n,
                "k" | "kb" => n * 1024,
                "m" | "mb" => n * 1024 * 1024,
                "g" | "gb" => n * 1024 * 1024 * 1024,
                _ => default,
            }
        }
        _ => default,
    }
}

impl Config {
    /// Load and blend the configuration documents.
    pub fn load(overrides: &Overrides) -> Result<Config, AgentError> {
        let state_dir = overrides
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let config_dir = if let Some(dir) = &overrides.config_dir {
            dir.clone()
        } else if let Some(file) = &overrides.ioto_file {
            file.parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        } else if Path::new(CONFIG_FILE).exists() {
            PathBuf::from(".")
        } else {
            state_dir.join("config")
        };

        let mut tree = json!({});
        let profile_hint = overrides
            .profile
            .clone()
            .or_else(|| std::env::var("NIMBUS_PROFILE").ok());

        let master = overrides
            .ioto_file
            .clone()
            .unwrap_or_else(|| config_dir.join(CONFIG_FILE));
        Self::load_layer(&mut tree, None, &master, false, profile_hint.as_deref())?;
        Self::load_layer(&mut tree, None, &config_dir.join(LOCAL_FILE), true, profile_hint.as_deref())?;
        Self::load_layer(&mut tree, Some("web"), &config_dir.join(WEB_FILE), true, profile_hint.as_deref())?;
        Self::load_layer(&mut tree, Some("device"), &config_dir.join(DEVICE_FILE), true, profile_hint.as_deref())?;
        if !overrides.reset {
            Self::load_layer(
                &mut tree,
                Some("provision"),
                &config_dir.join(PROVISION_FILE),
                true,
                profile_hint.as_deref(),
            )?;
        }
        // Last chance local overrides
        Self::load_layer(&mut tree, None, &config_dir.join(LOCAL_FILE), true, profile_hint.as_deref())?;

        if let Some(id) = &overrides.id {
            set_path(&mut tree, "device.id", json!(id));
        }
        if let Some(product) = &overrides.product {
            set_path(&mut tree, "device.product", json!(product));
        }
        if let Some(account) = &overrides.account {
            set_path(&mut tree, "device.account", json!(account));
        }
        if let Some(cloud) = &overrides.cloud {
            set_path(&mut tree, "device.cloud", json!(cloud));
        }
        let profile = profile_hint
            .or_else(|| get_path(&tree, "profile").and_then(|v| v.as_str().map(String::from)))
            .unwrap_or_else(|| "dev".to_string());
        set_path(&mut tree, "profile", json!(profile));

        let services = Self::enable_services(&tree);
        let nosave = get_path(&tree, "nosave").and_then(|v| v.as_bool()).unwrap_or(false);
        let test_mode = overrides.test || services.test;

        let config = Config {
            tree,
            config_dir,
            state_dir,
            profile,
            services,
            nosave,
            test_mode,
        };
        if overrides.reset {
            config.reset_files();
        }
        Ok(config)
    }

    fn load_layer(
        tree: &mut Value,
        property: Option<&str>,
        path: &Path,
        optional: bool,
        profile_hint: Option<&str>,
    ) -> Result<(), AgentError> {
        if !path.exists() {
            if optional {
                return Ok(());
            }
            return Err(AgentError::CantRead(format!(
                "cannot find required config file {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| AgentError::CantRead(format!("{}: {}", path.display(), e)))?;
        let extra: Value = json5::from_str(&content)
            .map_err(|e| AgentError::CantRead(format!("cannot parse {}: {}", path.display(), e)))?;
        info!("Loading {}", path.display());

        match property {
            Some(prop) => {
                let mut slot = get_path(tree, prop).cloned().unwrap_or_else(|| json!({}));
                merge(&mut slot, &extra);
                set_path(tree, prop, slot);
            }
            None => merge(tree, &extra),
        }
        Self::blend_conditional(tree, profile_hint);
        Ok(())
    }

    /// Blend `conditional.<collection>.<selected>` sections into the root and
    /// remove the `conditional` node.
    fn blend_conditional(tree: &mut Value, profile_hint: Option<&str>) {
        let conditional = match tree.get("conditional").cloned() {
            Some(c) => c,
            None => return,
        };
        if let Some(collections) = conditional.as_object() {
            for (name, collection) in collections {
                let selected = if name == "profile" {
                    profile_hint
                        .map(String::from)
                        .or_else(|| {
                            get_path(tree, "profile").and_then(|v| v.as_str().map(String::from))
                        })
                        .unwrap_or_else(|| "dev".to_string())
                } else {
                    match get_path(tree, name).and_then(|v| v.as_str()) {
                        Some(s) => s.to_string(),
                        None => continue,
                    }
                };
                if let Some(section) = collection.get(&selected) {
                    merge(tree, section);
                }
            }
        }
        if let Some(obj) = tree.as_object_mut() {
            obj.remove("conditional");
        }
    }

    /// Resolve the services table, auto-correcting dependencies with a
    /// warning: keys or mqtt need provision; provision, keys or sync need
    /// mqtt.
    fn enable_services(tree: &Value) -> Services {
        let get = |name: &str, dflt: bool| {
            get_path(tree, &format!("services.{}", name))
                .and_then(|v| v.as_bool())
                .unwrap_or(dflt)
        };
        let mut services = Services {
            web: get("web", true),
            database: get("database", true),
            update: get("update", false),
            logs: get("logs", false),
            keys: get("keys", false),
            mqtt: get("mqtt", false),
            provision: get("provision", false),
            shadow: get("shadow", false),
            sync: get("sync", false),
            register: false,
            test: get("test", false),
            serialize: None,
        };
        if !services.provision && (services.keys || services.mqtt) {
            warn!("Need provisioning service if key or mqtt service is required");
            services.provision = true;
        }
        if (services.provision || services.keys || services.sync) && !services.mqtt {
            warn!("Need MQTT service if provision, key or sync services are required");
            services.mqtt = true;
        }
        services.register = get("register", services.provision);
        services.serialize = get_path(tree, "services.serialize")
            .and_then(|v| v.as_str().map(String::from))
            .or_else(|| services.provision.then(|| "auto".to_string()));

        info!(
            "Enabling services:{}{}{}{}{}{}{}{}{}",
            if services.database { " db" } else { "" },
            if services.logs { " logs" } else { "" },
            if services.mqtt { " mqtt" } else { "" },
            if services.provision { " provision" } else { "" },
            if services.register { " register" } else { "" },
            if services.shadow { " shadow" } else { "" },
            if services.sync { " sync" } else { "" },
            if services.update { " update" } else { "" },
            if services.web { " web" } else { "" },
        );
        services
    }

    // --- accessors ---

    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.tree, path)
    }

    pub fn get_str(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_opt(&self, path: &str) -> Option<String> {
        self.get(path)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    pub fn get_int(&self, path: &str, default: i64) -> i64 {
        self.get(path).and_then(|v| v.as_i64()).unwrap_or(default)
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        self.get(path).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_duration_secs(&self, path: &str, default_secs: u64) -> u64 {
        self.get(path)
            .map(|v| parse_duration(v, default_secs))
            .unwrap_or(default_secs)
    }

    pub fn get_size(&self, path: &str, default: usize) -> usize {
        self.get(path).map(|v| parse_size(v, default)).unwrap_or(default)
    }

    pub fn set(&mut self, path: &str, value: Value) {
        set_path(&mut self.tree, path, value);
    }

    pub fn remove(&mut self, path: &str) {
        remove_path(&mut self.tree, path);
    }

    // --- derived settings ---

    pub fn device_id(&self) -> Option<String> {
        self.get_opt("device.id")
    }

    pub fn product(&self) -> Option<String> {
        self.get_opt("device.product")
    }

    pub fn builder(&self) -> String {
        self.get_str("api.builder", DEFAULT_BUILDER)
    }

    pub fn api(&self) -> Option<String> {
        self.get_opt("provision.api")
    }

    pub fn api_token(&self) -> Option<String> {
        self.get_opt("provision.token")
    }

    pub fn endpoint(&self) -> Option<String> {
        self.get_opt("provision.endpoint")
    }

    pub fn account(&self) -> Option<String> {
        self.get_opt("provision.accountId")
            .or_else(|| self.get_opt("device.account"))
    }

    pub fn cloud_type(&self) -> Option<String> {
        self.get_opt("provision.cloudType")
    }

    // --- paths ---

    /// Expand an `@dir/...` reference against the directory table.
    pub fn expand(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("@config/") {
            self.config_dir.join(rest)
        } else if let Some(rest) = path.strip_prefix("@state/") {
            self.state_dir.join(rest)
        } else if let Some(rest) = path.strip_prefix("@db/") {
            self.state_dir.join("db").join(rest)
        } else if let Some(rest) = path.strip_prefix("@certs/") {
            self.state_dir.join("certs").join(rest)
        } else {
            PathBuf::from(path)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        let configured = self.get_str("database.path", "@db/device.db");
        self.expand(&configured)
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.state_dir.join("certs").join(CERTIFICATE_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.state_dir.join("certs").join(KEY_FILE)
    }

    // --- persistence ---

    /// Write a config block as a private (0600) JSON file.
    fn save_block(&self, block: &str, file: &str) -> Result<()> {
        let value = self.get(block).cloned().unwrap_or_else(|| json!({}));
        let path = self.config_dir.join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(&value).context("Failed to serialize config block")?;
        write_private(&path, content.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved {} to {}", block, path.display());
        Ok(())
    }

    pub fn save_provision(&self) -> Result<()> {
        if self.nosave {
            return Ok(());
        }
        self.save_block("provision", PROVISION_FILE)
    }

    pub fn save_device(&self) -> Result<()> {
        if self.nosave {
            return Ok(());
        }
        self.save_block("device", DEVICE_FILE)
    }

    pub fn remove_provision_file(&self) {
        let path = self.config_dir.join(PROVISION_FILE);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Cannot remove {}: {}", path.display(), e);
            }
        }
    }

    /// Factory reset: erase provisioning state, certificates and sync state,
    /// and restore the seed database when present.
    pub fn reset_files(&self) {
        info!("Reset to factory defaults");
        for path in [
            self.config_dir.join(PROVISION_FILE),
            self.config_dir.join(SHADOW_FILE),
            self.certificate_path(),
            self.key_path(),
            self.state_dir.join("db").join("device.db.jnl"),
            self.state_dir.join("db").join("device.db.sync"),
        ] {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Cannot remove {}: {}", path.display(), e);
                }
            }
        }
        let seed = self.state_dir.join("db").join("device.db.reset");
        let db = self.state_dir.join("db").join("device.db");
        if seed.exists() {
            if let Err(e) = fs::copy(&seed, &db) {
                warn!("Cannot restore {}: {}", db.display(), e);
            }
        } else if db.exists() {
            if let Err(e) = fs::remove_file(&db) {
                warn!("Cannot remove {}: {}", db.display(), e);
            }
        }
        debug!("Factory reset complete");
    }
}

/// Write a file with owner-only permissions.
pub fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn get_path<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = tree;
    for part in path.split('.') {
        node = node.get(part)?;
    }
    Some(node)
}

fn set_path(tree: &mut Value, path: &str, value: Value) {
    let mut node = tree;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            if let Some(obj) = node.as_object_mut() {
                obj.insert(part.to_string(), value);
            }
            return;
        }
        if !node.get(*part).map(|v| v.is_object()).unwrap_or(false) {
            if let Some(obj) = node.as_object_mut() {
                obj.insert(part.to_string(), json!({}));
            }
        }
        node = match node.get_mut(*part) {
            Some(n) => n,
            None => return,
        };
    }
}

fn remove_path(tree: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((p, l)) => (p, l),
        None => ("", path),
    };
    if parent.is_empty() {
        if let Some(obj) = tree.as_object_mut() {
            obj.remove(leaf);
        }
        return;
    }
    let mut node = Some(tree);
    for part in parent.split('.') {
        node = node.and_then(|n| n.get_mut(part));
    }
    if let Some(obj) = node.and_then(|n| n.as_object_mut()) {
        obj.remove(leaf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn base_overrides(dir: &Path) -> Overrides {
        Overrides {
            config_dir: Some(dir.to_path_buf()),
            state_dir: Some(dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_layered_precedence() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            CONFIG_FILE,
            r#"{ api: { builder: "https://base" }, log: { level: "info" } }"#,
        );
        write_config(dir.path(), LOCAL_FILE, r#"{ log: { level: "debug" } }"#);
        let config = Config::load(&base_overrides(dir.path())).unwrap();
        assert_eq!(config.get_str("api.builder", ""), "https://base");
        // local.json5 wins over the master file
        assert_eq!(config.get_str("log.level", ""), "debug");
    }

    #[test]
    fn test_conditional_profile_blended_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            CONFIG_FILE,
            r#"{
                profile: "prod",
                limits: { reprovision: 5 },
                conditional: {
                    profile: {
                        dev: { limits: { reprovision: 1 } },
                        prod: { limits: { reprovision: 9 } },
                    }
                }
            }"#,
        );
        let config = Config::load(&base_overrides(dir.path())).unwrap();
        assert_eq!(config.get_int("limits.reprovision", 0), 9);
        assert!(config.get("conditional").is_none());
    }

    #[test]
    fn test_profile_override_selects_section() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            CONFIG_FILE,
            r#"{ conditional: { profile: { dev: { mode: "development" }, prod: { mode: "production" } } } }"#,
        );
        let mut overrides = base_overrides(dir.path());
        overrides.profile = Some("dev".to_string());
        let config = Config::load(&overrides).unwrap();
        assert_eq!(config.get_str("mode", ""), "development");
        assert_eq!(config.profile, "dev");
    }

    #[test]
    fn test_service_dependencies_auto_corrected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            CONFIG_FILE,
            r#"{ services: { sync: true, mqtt: false, provision: false } }"#,
        );
        let config = Config::load(&base_overrides(dir.path())).unwrap();
        // sync requires mqtt
        assert!(config.services.mqtt);

        write_config(
            dir.path(),
            CONFIG_FILE,
            r#"{ services: { keys: true, provision: false } }"#,
        );
        let config = Config::load(&base_overrides(dir.path())).unwrap();
        // keys require provision, which requires mqtt
        assert!(config.services.provision);
        assert!(config.services.mqtt);
    }

    #[test]
    fn test_cli_overrides_set_device_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), CONFIG_FILE, "{}");
        let mut overrides = base_overrides(dir.path());
        overrides.id = Some("AB12CD34EF".to_string());
        overrides.product = Some("prod-token".to_string());
        let config = Config::load(&overrides).unwrap();
        assert_eq!(config.device_id().unwrap(), "AB12CD34EF");
        assert_eq!(config.product().unwrap(), "prod-token");
    }

    #[test]
    fn test_missing_master_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&base_overrides(dir.path())).is_err());
    }

    #[test]
    fn test_reset_removes_state_and_restores_seed() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), CONFIG_FILE, "{}");
        write_config(dir.path(), PROVISION_FILE, r#"{ token: "tok" }"#);
        let db_dir = dir.path().join("db");
        fs::create_dir_all(&db_dir).unwrap();
        fs::write(db_dir.join("device.db"), "live").unwrap();
        fs::write(db_dir.join("device.db.sync"), "pending").unwrap();
        fs::write(db_dir.join("device.db.reset"), "factory").unwrap();
        let certs = dir.path().join("certs");
        fs::create_dir_all(&certs).unwrap();
        fs::write(certs.join(CERTIFICATE_FILE), "cert").unwrap();
        fs::write(certs.join(KEY_FILE), "key").unwrap();

        let mut overrides = base_overrides(dir.path());
        overrides.reset = true;
        let config = Config::load(&overrides).unwrap();

        assert!(!dir.path().join(PROVISION_FILE).exists());
        assert!(!certs.join(CERTIFICATE_FILE).exists());
        assert!(!certs.join(KEY_FILE).exists());
        assert!(!db_dir.join("device.db.sync").exists());
        assert_eq!(fs::read_to_string(db_dir.join("device.db")).unwrap(), "factory");
        // The provision overlay is not loaded when resetting
        assert!(config.api_token().is_none());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration(&json!(30), 0), 30);
        assert_eq!(parse_duration(&json!("1 min"), 0), 60);
        assert_eq!(parse_duration(&json!("24 hrs"), 0), 86400);
        assert_eq!(parse_duration(&json!("5 secs"), 0), 5);
        assert_eq!(parse_duration(&json!("garbage"), 7), 7);
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size(&json!(1024), 0), 1024);
        assert_eq!(parse_size(&json!("1k"), 0), 1024);
        assert_eq!(parse_size(&json!("256k"), 0), 256 * 1024);
        assert_eq!(parse_size(&json!("1mb"), 0), 1024 * 1024);
    }
}
