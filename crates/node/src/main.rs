mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{EnvSim, Scenario, SoilMoistureSim};

const DISPLAY_TOPIC: &str = "growbox/display";

fn reading_topic(sensor: &str) -> String {
    format!("tele/{sensor}/reading")
}

/// Pump or fan state change seen on the hub's display topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActuatorChange {
    Pump(bool),
    Fan(bool),
}

/// Decode `["Pump Status","ON"]`-style display messages. Everything else on
/// the topic (readings, lights) is ignored.
fn actuator_change(payload: &[u8]) -> Option<ActuatorChange> {
    let v: Value = serde_json::from_slice(payload).ok()?;
    let [name, status] = v.as_array()?.as_slice() else {
        return None;
    };
    let on = match status.as_str()? {
        "ON" => true,
        "OFF" => false,
        _ => return None,
    };
    match name.as_str()? {
        "Pump Status" => Some(ActuatorChange::Pump(on)),
        "Fan Status" => Some(ActuatorChange::Fan(on)),
        _ => None,
    }
}

fn soil_sensor_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "sim".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5)
        .max(1);
    let diurnal_period_s: f64 = env::var("DIURNAL_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let soil_names = soil_sensor_names(
        &env::var("SOIL_SENSORS")
            .unwrap_or_else(|_| "soil_moisture_sensor_1,soil_moisture_sensor_2".to_string()),
    );
    let env_name = env::var("ENV_SENSOR").unwrap_or_else(|_| "environment_sensor".to_string());

    let mut soil = SoilMoistureSim::new(scenario, soil_names.len(), diurnal_period_s);
    let mut environment = EnvSim::new(diurnal_period_s);
    info!(%scenario, soil = ?soil_names, environment = %env_name, "simulated sensors ready");

    let mut mqttoptions = MqttOptions::new(format!("growbox-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // Watch the hub's display topic so the simulation reacts to the pump
    // and fan.
    let (change_tx, mut changes) = mpsc::unbounded_channel();
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(DISPLAY_TOPIC, QoS::AtMostOnce) {
                        error!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == DISPLAY_TOPIC => {
                    if let Some(change) = actuator_change(&p.payload) {
                        if change_tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut tick = interval(Duration::from_secs(sample_every_s));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for (i, name) in soil_names.iter().enumerate() {
                    let value = soil.sample(i);
                    publish(&client, &reading_topic(name), &value).await?;
                    debug!(sensor = %name, value, "published");
                }
                let record = environment.sample();
                publish(&client, &reading_topic(&env_name), &record).await?;
                debug!(sensor = %env_name, ?record, "published");
            }
            Some(change) = changes.recv() => {
                info!(?change, "actuator change");
                match change {
                    ActuatorChange::Pump(on) => soil.set_watering(on),
                    ActuatorChange::Fan(on) => environment.set_fan(on),
                }
            }
        }
    }
}

async fn publish<T: serde::Serialize>(client: &AsyncClient, topic: &str, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value).context("encode reading")?;
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        error!(topic, "publish error: {e}");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
