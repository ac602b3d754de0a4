//! MQTT bridge: routes sensor telemetry into the per-sensor channels and
//! operator commands into the command channel, and publishes coordinator
//! display messages.

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::manual::Command;
use crate::outbox::DisplayMsg;
use crate::state::SharedState;
use crate::store::SensorValue;

pub const TELEMETRY_FILTER: &str = "tele/+/reading";
pub const COMMAND_TOPIC: &str = "growbox/command";
pub const DISPLAY_TOPIC: &str = "growbox/display";

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract sensor name from "tele/<sensor_name>/reading".
pub(crate) fn extract_sensor_name(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// A bare number (soil moisture) or an environment record.
pub(crate) fn parse_reading(payload: &[u8]) -> Result<SensorValue> {
    serde_json::from_slice(payload).context("bad telemetry json")
}

pub(crate) fn parse_command(payload: &[u8]) -> Result<Command> {
    let v: serde_json::Value = serde_json::from_slice(payload).context("bad command json")?;
    Command::parse(&v)
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub enum Routed {
    Reading,
    Command(Command),
}

/// Where inbound publishes go. Sends never wait: a full channel drops the
/// message.
pub struct Routes {
    sensors: HashMap<String, mpsc::Sender<SensorValue>>,
    commands: mpsc::Sender<Command>,
}

impl Routes {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self {
            sensors: HashMap::new(),
            commands,
        }
    }

    pub fn add_sensor(&mut self, name: impl Into<String>, tx: mpsc::Sender<SensorValue>) {
        self.sensors.insert(name.into(), tx);
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<Routed> {
        if let Some(name) = extract_sensor_name(topic) {
            let tx = self
                .sensors
                .get(name)
                .ok_or_else(|| anyhow!("unknown sensor '{name}'"))?;
            let value = parse_reading(payload)?;
            tx.try_send(value)
                .map_err(|e| anyhow!("sensor '{name}' reading dropped: {e}"))?;
            Ok(Routed::Reading)
        } else if topic == COMMAND_TOPIC {
            let cmd = parse_command(payload)?;
            self.commands
                .try_send(cmd.clone())
                .map_err(|e| anyhow!("command dropped: {e}"))?;
            Ok(Routed::Command(cmd))
        } else {
            bail!("unhandled topic={topic}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn subscribe(client: &AsyncClient) {
    for filter in [TELEMETRY_FILTER, COMMAND_TOPIC] {
        if let Err(e) = client.try_subscribe(filter, QoS::AtLeastOnce) {
            error!(filter, "subscribe failed: {e}");
        }
    }
}

/// Poll the MQTT event loop forever. Link loss is logged and retried; the
/// coordinator keeps running on its own.
pub async fn run(client: AsyncClient, mut eventloop: EventLoop, routes: Routes, status: SharedState) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => match routes.route(&p.topic, &p.payload) {
                Ok(Routed::Reading) => {}
                Ok(Routed::Command(cmd)) => {
                    info!(?cmd, "command via mqtt");
                    status.write().await.record_command(format!("mqtt: {cmd:?}"));
                }
                Err(e) => {
                    warn!(topic = %p.topic, "{e:#}");
                    status.write().await.record_error(format!("{e:#}"));
                }
            },
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                subscribe(&client);
                let mut st = status.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = status.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = status.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Fold display messages into the status view and publish them.
pub async fn forward_display(
    mut rx: mpsc::UnboundedReceiver<DisplayMsg>,
    client: AsyncClient,
    status: SharedState,
) {
    while let Some(msg) = rx.recv().await {
        status.write().await.record_display(&msg);
        match serde_json::to_vec(&msg) {
            Ok(payload) => {
                if let Err(e) = client.try_publish(DISPLAY_TOPIC, QoS::AtMostOnce, false, payload) {
                    debug!("display publish dropped: {e}");
                }
            }
            Err(e) => error!("encode display message: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
