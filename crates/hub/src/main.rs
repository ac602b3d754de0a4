mod actuator;
mod config;
mod coordinator;
mod db;
mod dispatch;
mod manual;
mod mqtt;
mod outbox;
mod rules;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, time::Duration};
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuators;
use config::ProfileLoader;
use coordinator::{Coordinator, SensorChannel};
use db::Db;
use dispatch::Dispatcher;
use mqtt::Routes;
use outbox::Outbox;
use state::StatusView;
use store::Store;

/// Per-sensor queue depth between the MQTT bridge and the coordinator.
const SENSOR_QUEUE: usize = 16;
const COMMAND_QUEUE: usize = 32;
const PERSIST_QUEUE: usize = 1024;

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_port(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env_port("MQTT_PORT", 1883);
    let web_port = env_port("WEB_PORT", 8080);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:growbox.db?mode=rwc".to_string());

    // ── Config file + grow profile ───────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    // Many common relay boards are active-low. If yours is active-high, set false.
    cfg.pins.active_low = env_flag("RELAY_ACTIVE_LOW", cfg.pins.active_low);

    let profiles = cfg.profile_dir();
    let profile = profiles
        .load(&cfg.profile)
        .with_context(|| format!("failed to load startup profile '{}'", cfg.profile))?;
    if cfg.sensors.is_empty() {
        warn!("no sensors configured, only lighting and commands will act");
    }

    let offset = UtcOffset::from_hms(cfg.utc_offset_hours, 0, 0)
        .context("utc_offset_hours out of range")?;
    let clock = move || OffsetDateTime::now_utc().to_offset(offset);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    let mut store = Store::new(&profile, cfg.history_capacity, cfg.moisture_window);
    if let Some(snapshot) = db.load_snapshot().await? {
        store.restore_timing(&snapshot);
        info!(timing = ?store.timing, "watering timing restored");
    }

    let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE);
    let sink = tokio::spawn(db::run_sink(db.clone(), persist_rx));

    // ── Actuators ───────────────────────────────────────────────────
    let actuators = Actuators::from_pins(&cfg.pins, env_flag("SIMULATE", false))?;
    actuators.all_off();

    // ── Channels ────────────────────────────────────────────────────
    let (display_tx, display_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (view_tx, view_rx) = watch::channel(store.view());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut routes = Routes::new(command_tx.clone());
    let mut sensors = Vec::with_capacity(cfg.sensors.len());
    for s in &cfg.sensors {
        let (tx, rx) = mpsc::channel(SENSOR_QUEUE);
        routes.add_sensor(&s.name, tx);
        sensors.push(SensorChannel::new(&s.name, s.kind, rx));
    }

    let outbox = Outbox::new(display_tx, persist_tx);
    let dispatcher = Dispatcher::new(
        actuators.clone(),
        cfg.pump.clone(),
        cfg.busy_grace_sec,
        outbox.clone(),
    );

    // ── Status view + web ───────────────────────────────────────────
    let status = StatusView::shared();
    status
        .write()
        .await
        .record_system(format!("hub started with profile '{}'", profile.name));

    let web_state = web::AppState {
        status: status.clone(),
        store: view_rx,
        commands: command_tx,
        db: db.clone(),
    };
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            tracing::error!("{e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("growbox-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let bridge = tokio::spawn(mqtt::run(client.clone(), eventloop, routes, status.clone()));
    let display = tokio::spawn(mqtt::forward_display(display_rx, client, status));

    // ── Shutdown signal ─────────────────────────────────────────────
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
        }
        let _ = shutdown_tx.send(true);
    });

    // ── Coordinator ─────────────────────────────────────────────────
    let coordinator = Coordinator::new(store, dispatcher, sensors, command_rx, profiles, outbox, view_tx);
    coordinator
        .run(Duration::from_millis(cfg.tick_ms), clock, shutdown_rx)
        .await?;

    // Coordinator is gone: stop the sensor side, let the sink drain.
    for task in [bridge, display, web_task] {
        task.abort();
        let _ = task.await;
    }
    if let Err(e) = sink.await {
        warn!("persistence sink ended abnormally: {e}");
    }
    actuators.all_off();
    info!("hub stopped");
    Ok(())
}
