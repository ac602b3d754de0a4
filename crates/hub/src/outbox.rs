//! Outbound channels of the coordinator: display messages for the GUI side
//! and persistence messages for the database sink. Sends never block the
//! loop; a closed or full channel only costs a log line.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::PersistMsg;
use crate::rules::{EnvDecision, EnvFields, WateringDecision};
use crate::store::{Actuator, ActuatorStatus, Flag, SensorValue, Store};

/// Coordinator → GUI message. Serialises as a JSON array:
/// `[sensor, value, flag, filtered]`, `[sensor, {field: {value, flag}}]`
/// or `[status_name, status]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DisplayMsg {
    Moisture(String, f64, Option<Flag>, f64),
    Environment(String, EnvFields),
    Status(String, ActuatorStatus),
}

impl DisplayMsg {
    pub fn status(a: Actuator, status: ActuatorStatus) -> Self {
        Self::Status(a.status_key().to_string(), status)
    }
}

impl From<&WateringDecision> for DisplayMsg {
    fn from(d: &WateringDecision) -> Self {
        Self::Moisture(d.sensor.clone(), d.measured, d.flag, d.filtered)
    }
}

impl From<&EnvDecision> for DisplayMsg {
    fn from(d: &EnvDecision) -> Self {
        Self::Environment(d.sensor.clone(), d.fields)
    }
}

#[derive(Clone)]
pub struct Outbox {
    display: mpsc::UnboundedSender<DisplayMsg>,
    persist: mpsc::Sender<PersistMsg>,
}

impl Outbox {
    pub fn new(display: mpsc::UnboundedSender<DisplayMsg>, persist: mpsc::Sender<PersistMsg>) -> Self {
        Self { display, persist }
    }

    pub fn display(&self, msg: DisplayMsg) {
        if self.display.send(msg).is_err() {
            debug!("display channel closed, message dropped");
        }
    }

    pub fn status(&self, a: Actuator, status: ActuatorStatus) {
        self.display(DisplayMsg::status(a, status));
    }

    pub fn persist(&self, msg: PersistMsg) {
        if let Err(e) = self.persist.try_send(msg) {
            warn!("persistence sink unavailable, message dropped: {e}");
        }
    }

    pub fn reading(&self, sensor: &str, value: &SensorValue, now: OffsetDateTime) {
        self.persist(PersistMsg::Reading {
            ts: now.unix_timestamp(),
            sensor: sensor.to_string(),
            value: value.clone(),
        });
    }

    pub fn snapshot(&self, store: &Store, now: OffsetDateTime) {
        self.persist(PersistMsg::Snapshot {
            ts: now.unix_timestamp(),
            body: store.snapshot(),
        });
    }

    /// Outbox wired to fresh channels, receivers returned for inspection.
    #[cfg(test)]
    pub fn channels() -> (
        Self,
        mpsc::UnboundedReceiver<DisplayMsg>,
        mpsc::Receiver<PersistMsg>,
    ) {
        let (dtx, drx) = mpsc::unbounded_channel();
        let (ptx, prx) = mpsc::channel(1024);
        (Self::new(dtx, ptx), drx, prx)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
