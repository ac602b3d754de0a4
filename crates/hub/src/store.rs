//! The Shared State Store: latest readings, bounded history, thresholds,
//! actuator statuses, busy guards, manual overrides and watering timing.
//!
//! The store is owned by the coordinator and only ever mutated from inside a
//! coordinator step. Actuator tasks and sensor channels report back through
//! message channels; they never hold a reference to it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::config::Profile;
use crate::rules::MoistureWindow;

/// Bucket key format for the history trail, e.g. `03-14-24 09:26:53`.
const HISTORY_STAMP: &[FormatItem<'static>] =
    format_description!("[month]-[day]-[year repr:last_two] [hour]:[minute]:[second]");

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Relation of a measured quantity to its configured range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flag {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "HIGH")]
    High,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Actuator {
    #[serde(rename = "Pump")]
    Pump,
    #[serde(rename = "Fan")]
    Fan,
    #[serde(rename = "UV LED")]
    UvLed,
    #[serde(rename = "RGB LED")]
    RgbLed,
}

impl Actuator {
    pub const ALL: [Actuator; 4] = [Self::Pump, Self::Fan, Self::UvLed, Self::RgbLed];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pump => "Pump",
            Self::Fan => "Fan",
            Self::UvLed => "UV LED",
            Self::RgbLed => "RGB LED",
        }
    }

    /// Key used for status messages towards the display, e.g. `"Pump Status"`.
    pub fn status_key(self) -> &'static str {
        match self {
            Self::Pump => "Pump Status",
            Self::Fan => "Fan Status",
            Self::UvLed => "UV LED Status",
            Self::RgbLed => "RGB LED Status",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An RGB triple; serialises as `[r, g, b]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const OFF: Rgb = Rgb(0, 0, 0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchState {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl SwitchState {
    pub fn from_on(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Last commanded state of an actuator: `"ON"`, `"OFF"` or `[r, g, b]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActuatorStatus {
    Switch(SwitchState),
    Color(Rgb),
}

impl ActuatorStatus {
    pub const ON: ActuatorStatus = ActuatorStatus::Switch(SwitchState::On);
    pub const OFF: ActuatorStatus = ActuatorStatus::Switch(SwitchState::Off);
}

/// Concurrency guard for actuation tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Busy {
    Free,
    Busy,
}

/// Environment sensor record. `gas` is in ohms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvRecord {
    pub temperature: f64,
    pub humidity: f64,
    pub gas: f64,
    #[serde(default)]
    pub pressure: f64,
    #[serde(default)]
    pub altitude: f64,
}

/// Payload produced by a sensor channel: a bare soil-moisture number
/// (0–100) or an environment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Moisture(f64),
    Environment(EnvRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub value: SensorValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub moisture: Range,
    pub temperature: Range,
    pub humidity: Range,
    pub voc: Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightingSlot {
    pub uv: bool,
    pub rgb: Rgb,
}

impl LightingSlot {
    pub const OFF: LightingSlot = LightingSlot {
        uv: false,
        rgb: Rgb::OFF,
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_watering: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub soak_end_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryBucket {
    pub stamp: String,
    pub readings: BTreeMap<String, SensorValue>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Store {
    pub profile: String,
    pub latest: BTreeMap<String, Reading>,
    pub history: VecDeque<HistoryBucket>,
    #[serde(skip)]
    pub history_capacity: usize,
    pub thresholds: Thresholds,
    pub soak_minutes: i64,
    pub actuator_status: BTreeMap<Actuator, ActuatorStatus>,
    pub actuator_busy: BTreeMap<Actuator, Busy>,
    pub manual_override: BTreeMap<Actuator, bool>,
    pub timing: Timing,
    pub lighting_schedule: BTreeMap<u8, LightingSlot>,
    /// Lighting forced off by a HIGH temperature flag.
    pub heat_shed: bool,
    /// One outlier window per soil sensor; sensors differ in calibration.
    #[serde(skip)]
    pub water_windows: BTreeMap<String, MoistureWindow>,
    #[serde(skip)]
    moisture_window: usize,
}

impl Store {
    /// Fresh store with every actuator OFF, Free and under automatic control.
    pub fn new(profile: &Profile, history_capacity: usize, moisture_window: usize) -> Self {
        let mut actuator_status = BTreeMap::new();
        let mut actuator_busy = BTreeMap::new();
        let mut manual_override = BTreeMap::new();
        for a in Actuator::ALL {
            let status = if a == Actuator::RgbLed {
                ActuatorStatus::Color(Rgb::OFF)
            } else {
                ActuatorStatus::OFF
            };
            actuator_status.insert(a, status);
            actuator_busy.insert(a, Busy::Free);
            manual_override.insert(a, false);
        }

        Self {
            profile: profile.name.clone(),
            latest: BTreeMap::new(),
            history: VecDeque::with_capacity(history_capacity.min(1024)),
            history_capacity: history_capacity.max(1),
            thresholds: profile.thresholds(),
            soak_minutes: profile.soak_minutes,
            actuator_status,
            actuator_busy,
            manual_override,
            timing: Timing::default(),
            lighting_schedule: profile.lighting_schedule(),
            heat_shed: false,
            water_windows: BTreeMap::new(),
            moisture_window,
        }
    }

    /// The outlier window of `sensor`, created on first use.
    pub fn water_window(&mut self, sensor: &str) -> &mut MoistureWindow {
        let capacity = self.moisture_window;
        self.water_windows
            .entry(sensor.to_string())
            .or_insert_with(|| MoistureWindow::new(capacity))
    }

    // -- Readings ---------------------------------------------------------

    /// Overwrite `latest[sensor]` and append to the history trail.
    pub fn record_reading(&mut self, sensor: &str, value: SensorValue, now: OffsetDateTime) {
        let stamp = now
            .format(HISTORY_STAMP)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());

        match self.history.back_mut() {
            Some(bucket) if bucket.stamp == stamp => {
                bucket.readings.insert(sensor.to_string(), value.clone());
            }
            _ => {
                if self.history.len() >= self.history_capacity {
                    self.history.pop_front();
                }
                let mut readings = BTreeMap::new();
                readings.insert(sensor.to_string(), value.clone());
                self.history.push_back(HistoryBucket { stamp, readings });
            }
        }

        self.latest.insert(sensor.to_string(), Reading { ts: now, value });
    }

    pub fn latest(&self, sensor: &str) -> Option<&Reading> {
        self.latest.get(sensor)
    }

    // -- Actuator bookkeeping ---------------------------------------------

    pub fn is_busy(&self, a: Actuator) -> bool {
        self.actuator_busy.get(&a) == Some(&Busy::Busy)
    }

    pub fn set_busy(&mut self, a: Actuator, busy: Busy) {
        self.actuator_busy.insert(a, busy);
    }

    pub fn status(&self, a: Actuator) -> Option<ActuatorStatus> {
        self.actuator_status.get(&a).copied()
    }

    pub fn set_status(&mut self, a: Actuator, status: ActuatorStatus) {
        self.actuator_status.insert(a, status);
    }

    pub fn is_overridden(&self, a: Actuator) -> bool {
        self.manual_override.get(&a).copied().unwrap_or(false)
    }

    pub fn set_override(&mut self, a: Actuator, on: bool) {
        self.manual_override.insert(a, on);
    }

    /// Return every actuator to automatic control. Busy guards are untouched:
    /// an in-flight task still owns its actuator until it reports back.
    pub fn clear_overrides(&mut self) {
        for flag in self.manual_override.values_mut() {
            *flag = false;
        }
    }

    // -- Watering timing --------------------------------------------------

    /// `Some(end)` while a soak period blocks new watering at `now`.
    pub fn pending_soak(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.timing.soak_end_time.filter(|end| now <= *end)
    }

    /// Record a completed watering. The soak end never moves backwards; a
    /// soak end that does not fit the calendar leaves the timing as it was.
    pub fn record_watering(&mut self, now: OffsetDateTime) {
        let end = self
            .soak_minutes
            .checked_mul(60)
            .map(Duration::seconds)
            .and_then(|soak| now.checked_add(soak));
        let Some(end) = end else {
            warn!(soak_minutes = self.soak_minutes, "soak end out of range, timing unchanged");
            return;
        };
        self.timing.last_watering = Some(now);
        self.timing.soak_end_time = Some(match self.timing.soak_end_time {
            Some(prev) if prev > end => prev,
            _ => end,
        });
    }

    /// Restore watering timing from a persisted snapshot so a restart does
    /// not water again in the middle of a soak period.
    pub fn restore_timing(&mut self, snapshot: &serde_json::Value) {
        if let Some(t) = snapshot.get("timing") {
            if let Ok(timing) = serde_json::from_value::<Timing>(t.clone()) {
                self.timing = timing;
            }
        }
    }

    // -- Configuration ----------------------------------------------------

    /// Merge a (re)loaded grow profile: thresholds, soak length and lighting
    /// schedule are replaced; readings, busy guards, overrides and timing
    /// are kept.
    pub fn merge_profile(&mut self, profile: &Profile) {
        self.profile = profile.name.clone();
        self.thresholds = profile.thresholds();
        self.soak_minutes = profile.soak_minutes;
        self.lighting_schedule = profile.lighting_schedule();
    }

    /// JSON snapshot for the persistence sink.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Everything but the history trail, for the status API.
    pub fn view(&self) -> StoreView {
        StoreView {
            profile: self.profile.clone(),
            latest: self.latest.clone(),
            history_len: self.history.len(),
            thresholds: self.thresholds,
            soak_minutes: self.soak_minutes,
            actuator_status: self.actuator_status.clone(),
            actuator_busy: self.actuator_busy.clone(),
            manual_override: self.manual_override.clone(),
            timing: self.timing.clone(),
            heat_shed: self.heat_shed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreView {
    pub profile: String,
    pub latest: BTreeMap<String, Reading>,
    pub history_len: usize,
    pub thresholds: Thresholds,
    pub soak_minutes: i64,
    pub actuator_status: BTreeMap<Actuator, ActuatorStatus>,
    pub actuator_busy: BTreeMap<Actuator, Busy>,
    pub manual_override: BTreeMap<Actuator, bool>,
    pub timing: Timing,
    pub heat_shed: bool,
}

// ===========================================================================
// Tests
// ===========================================================================
