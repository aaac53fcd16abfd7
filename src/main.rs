//! Nimbus Edge Agent
//!
//! Embedded device agent for cloud-connected products. Handles device
//! identity, registration, provisioning, the MQTT session, bidirectional
//! database sync, cloud log capture and remote commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use nimbus_agent::commands::CommandDispatcher;
use nimbus_agent::config::{Config, Overrides, SharedConfig};
use nimbus_agent::db::{Database, DbParams, ModelSpec};
use nimbus_agent::device;
use nimbus_agent::error::AgentError;
use nimbus_agent::logs;
use nimbus_agent::mqtt::MqttSession;
use nimbus_agent::provision::Provisioner;
use nimbus_agent::shadow::Shadow;
use nimbus_agent::sync;
use nimbus_agent::update::Updater;
use nimbus_agent::Lifecycle;

#[derive(Parser, Debug, Clone)]
#[command(name = "nimbus-agent", version, about = "Nimbus Edge Agent")]
struct Args {
    /// Config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// State directory
    #[arg(long)]
    state: Option<PathBuf>,

    /// Master config file (overrides --config discovery)
    #[arg(long)]
    ioto: Option<PathBuf>,

    /// Device claim ID
    #[arg(long)]
    id: Option<String>,

    /// Builder product token
    #[arg(long)]
    product: Option<String>,

    /// Owning account for auto-claim
    #[arg(long)]
    account: Option<String>,

    /// Target cloud for auto-claim
    #[arg(long)]
    cloud: Option<String>,

    /// Configuration profile (dev, prod, ...)
    #[arg(long)]
    profile: Option<String>,

    /// Erase provisioning state and certificates (factory reset)
    #[arg(long)]
    reset: bool,

    /// Run in test mode
    #[arg(long)]
    test: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("======================================");
    info!("  Nimbus Edge Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");

    let shutdown = setup_shutdown_handler();

    let mut first_run = true;
    loop {
        match run_agent(&args, first_run, shutdown.clone()).await {
            Ok(Lifecycle::Restart) => {
                info!("Restarting agent ...");
                first_run = false;
            }
            Ok(_) => break,
            Err(e) => {
                error!("Agent error: {}", e);
                std::process::exit(1);
            }
        }
    }
    info!("Agent shutdown complete");
}

/// Initialize logging with tracing. `-v` maps to debug, `-vv` to trace;
/// RUST_LOG always wins.
fn init_logging(verbose: u8) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        let _ = tx.send(true);
    })
    .expect("Error setting Ctrl-C handler");

    rx
}

/// Resolve the database models: the built-in set extended by
/// `database.schema` entries.
fn build_models(config: &Config) -> Vec<ModelSpec> {
    let mut models = vec![
        ModelSpec::new("Device", true),
        ModelSpec::new("Command", true),
        ModelSpec::new("SyncState", false),
    ];
    if let Some(schema) = config.get("database.schema").and_then(|v| v.as_object()) {
        for (name, spec) in schema {
            if models.iter().any(|m| &m.name == name) {
                continue;
            }
            let sync = spec.get("sync").and_then(|v| v.as_bool()).unwrap_or(false);
            models.push(ModelSpec::new(name, sync));
        }
    }
    models
}

/// Upsert the Device row from the device config block.
fn update_device_item(db: &Database, config: &Config) {
    let mut item = json!({
        "id": config.device_id().unwrap_or_default(),
        "state": "online",
    });
    for field in ["name", "model", "description", "product"] {
        if let Some(value) = config.get_opt(&format!("device.{}", field)) {
            item[field] = json!(value);
        }
    }
    if let Some(account) = config.account() {
        item["accountId"] = json!(account);
    }
    if let Err(e) = db.update("Device", item, &DbParams { bypass: false, upsert: true }) {
        error!("Cannot update device item: {}", e);
    }
}

/// Run the agent once, until stop or restart.
async fn run_agent(
    args: &Args,
    first_run: bool,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Lifecycle> {
    let overrides = Overrides {
        config_dir: args.config.clone(),
        state_dir: args.state.clone(),
        ioto_file: args.ioto.clone(),
        id: args.id.clone(),
        product: args.product.clone(),
        account: args.account.clone(),
        cloud: args.cloud.clone(),
        profile: args.profile.clone(),
        // A factory reset applies only to the first pass, not to restarts
        reset: args.reset && first_run,
        test: args.test,
    };
    let config = Config::load(&overrides)?;
    info!(
        "Starting agent with \"{}\" profile in {}",
        config.profile,
        config.config_dir.display()
    );
    let services = config.services.clone();
    let test_mode = config.test_mode;
    let nosave = config.nosave;
    let config: SharedConfig = Arc::new(RwLock::new(config));
    let http = reqwest::Client::new();

    // Derive the claim ID before anything talks to the cloud
    if services.serialize.is_some() {
        device::serialize(&config, &http).await?;
    }
    let device_id = config.read().await.device_id().unwrap_or_default();

    let provisioner = Provisioner::new(config.clone(), http.clone());
    provisioner.check_claim().await;

    if services.register {
        match provisioner.register().await {
            Err(e @ AgentError::BadArgs(_)) => return Err(e.into()),
            Err(e) => warn!("register: {}", e),
            Ok(()) => {}
        }
    }

    let (lifecycle_tx, mut lifecycle_rx) = watch::channel(Lifecycle::Run);
    let mut db_handle: Option<Arc<Database>> = None;
    let mut session_handle: Option<MqttSession> = None;

    // Database and sync engine
    if services.database {
        let (db_path, max_sync_size) = {
            let cfg = config.read().await;
            (cfg.db_path(), cfg.get_size("database.maxSyncSize", 1024))
        };
        let db = Arc::new(Database::open(db_path, build_models(&*config.read().await), nosave)?);
        if db.get("SyncState", "state").is_none() {
            let _ = db.create(
                "SyncState",
                json!({"id": "state", "lastSyncDown": "0", "lastUpdate": "0"}),
                &DbParams { bypass: true, upsert: true },
            );
        }
        let (publish_tx, mut publish_rx) = mpsc::unbounded_channel::<sync::Outbound>();
        let sync_handle = if services.sync {
            Some(sync::start(
                db.clone(),
                publish_tx,
                device_id.clone(),
                max_sync_size,
                nosave,
            ))
        } else {
            None
        };
        // The Device row update lands after the sync trigger is registered
        // so it replicates on first connect
        update_device_item(&db, &*config.read().await);

        // Update trigger for the command dispatcher and scheduler
        let update_tx = if services.update {
            let (tx, rx) = mpsc::unbounded_channel();
            let updater = Updater::new(
                config.clone(),
                db.clone(),
                provisioner.clone(),
                http.clone(),
                lifecycle_tx.clone(),
            );
            tokio::spawn(updater.run(rx));
            Some(tx)
        } else {
            None
        };
        let _bus = CommandDispatcher::start(&db, provisioner.clone(), lifecycle_tx.clone(), update_tx);

        // MQTT session and topic wiring
        if services.mqtt {
            let session = MqttSession::new(config.clone(), provisioner.clone());

            // Outbound sync batches flow through the session
            {
                let session = session.clone();
                tokio::spawn(async move {
                    while let Some(out) = publish_rx.recv().await {
                        if let Err(e) = session
                            .publish(&out.topic, out.payload, rumqttc::QoS::AtLeastOnce, false)
                            .await
                        {
                            // The change stays buffered; the retransmit
                            // window covers it
                            debug!("sync publish: {}", e);
                        }
                    }
                });
            }

            // Inbound sync topics
            if let Some(sync_handle) = &sync_handle {
                for filter in [
                    format!("ioto/device/{}/sync/+", device_id),
                    "ioto/account/all/sync/+".to_string(),
                ] {
                    let mut rx = session.subscribe_local(&filter);
                    let handle = sync_handle.clone();
                    tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            handle.receive(&msg.topic, &msg.payload);
                        }
                    });
                }
            }

            // Cloud release commands
            {
                let mut rx = session.subscribe_local(&format!("ioto/device/{}/provision/+", device_id));
                let provisioner = provisioner.clone();
                let release_session = session.clone();
                tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if provisioner.handle_release(&msg.topic, &msg.payload, test_mode).await {
                            release_session.disconnect().await;
                        }
                    }
                });
            }

            let shadow = if services.shadow {
                match Shadow::start(config.clone(), session.clone()).await {
                    Ok(shadow) => Some(shadow),
                    Err(e) => {
                        warn!("shadow: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            // Per-connect actions: flush pending changes, fetch missed
            // cloud changes, one-shot sync-up after provisioning
            {
                let mut connected = session.connected_watch();
                let sync_handle = sync_handle.clone();
                let provisioner = provisioner.clone();
                let account_session = session.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let mut account_route = false;
                    loop {
                        if connected.changed().await.is_err() {
                            break;
                        }
                        let is_up = *connected.borrow();
                        if let Some(sync) = &sync_handle {
                            if is_up {
                                sync.connected();
                                if provisioner.take_pending_sync_up() {
                                    sync.sync_up(true);
                                }
                                sync.sync_down(None);
                            } else {
                                sync.disconnected();
                            }
                        }
                        if is_up {
                            if !account_route {
                                if let Some(account) = config.read().await.account() {
                                    let filter = format!("ioto/account/{}/#", account);
                                    if let Some(sync) = &sync_handle {
                                        let mut rx = account_session.subscribe_local(&filter);
                                        let handle = sync.clone();
                                        tokio::spawn(async move {
                                            while let Some(msg) = rx.recv().await {
                                                handle.receive(&msg.topic, &msg.payload);
                                            }
                                        });
                                    }
                                    account_route = true;
                                }
                            }
                            if let Some(shadow) = &shadow {
                                shadow.on_connect().await;
                            }
                        }
                    }
                });
            }

            if services.keys {
                tokio::spawn(provisioner.clone().refresh_creds_loop());
            }
            if services.logs {
                let config = config.clone();
                let provisioner = provisioner.clone();
                tokio::spawn(async move {
                    logs::start(config, provisioner).await;
                });
            }

            session.schedule_connect();
            session_handle = Some(session);
        }
        db_handle = Some(db);
    }

    info!("Agent running. Press Ctrl+C to stop.");

    let outcome = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Lifecycle::Stop;
                }
            }
            changed = lifecycle_rx.changed() => {
                if changed.is_err() {
                    break Lifecycle::Stop;
                }
                match *lifecycle_rx.borrow() {
                    Lifecycle::Restart => break Lifecycle::Restart,
                    Lifecycle::Stop => break Lifecycle::Stop,
                    Lifecycle::Run => {}
                }
            }
        }
    };

    info!("Initiating graceful shutdown ...");
    if let Some(session) = &session_handle {
        session.shutdown().await;
    }
    if let Some(db) = &db_handle {
        db.close();
    }
    Ok(outcome)
}
