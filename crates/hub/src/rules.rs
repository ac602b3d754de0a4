//! Threshold rule evaluators. Each evaluator reads thresholds plus a new
//! reading and produces a decision; none of them touches an actuator.
//!
//! Comparison operators differ per rule:
//! - moisture: `< low` is LOW, `> high` is HIGH
//! - environment: `>= high` is HIGH, `<= low` is LOW

use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;

use crate::store::{EnvRecord, Flag, Range, Thresholds};

// ---------------------------------------------------------------------------
// Watering rule
// ---------------------------------------------------------------------------

/// Rolling window of recent soil-moisture readings used to reject single
/// sample noise before deciding whether to water.
#[derive(Debug, Clone)]
pub struct MoistureWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl MoistureWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of the window after leaving out every entry further than one
    /// (population) standard deviation from the window mean. The window
    /// itself is untouched; only `push` evicts. `None` for an empty window.
    pub fn filtered_mean(&self) -> Option<f64> {
        let avg = mean(self.values.iter().copied())?;
        let n = self.values.len() as f64;
        let std_dev = (self.values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n).sqrt();

        let kept = self
            .values
            .iter()
            .copied()
            .filter(|v| (v - avg).abs() <= std_dev);
        Some(mean(kept).unwrap_or(avg))
    }
}

impl Default for MoistureWindow {
    fn default() -> Self {
        Self::new(10)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringDecision {
    pub sensor: String,
    pub measured: f64,
    pub flag: Option<Flag>,
    pub filtered: f64,
}

pub fn moisture_flag(level: f64, range: &Range) -> Option<Flag> {
    if level < range.low {
        Some(Flag::Low)
    } else if level > range.high {
        Some(Flag::High)
    } else {
        None
    }
}

/// Feed `measured` into the window and decide on the outlier-filtered level.
pub fn watering_rule(
    sensor: &str,
    measured: f64,
    window: &mut MoistureWindow,
    range: &Range,
) -> WateringDecision {
    window.push(measured);
    let filtered = window.filtered_mean().unwrap_or(measured);
    WateringDecision {
        sensor: sensor.to_string(),
        measured,
        flag: moisture_flag(filtered, range),
        filtered,
    }
}

// ---------------------------------------------------------------------------
// Environment rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measure {
    pub value: f64,
    pub flag: Option<Flag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvFields {
    pub temperature: Measure,
    pub humidity: Measure,
    pub gas: Measure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvDecision {
    pub sensor: String,
    pub fields: EnvFields,
}

pub fn band_flag(value: f64, range: &Range) -> Option<Flag> {
    if value >= range.high {
        Some(Flag::High)
    } else if value <= range.low {
        Some(Flag::Low)
    } else {
        None
    }
}

/// Ohms to kΩ, rounded to two decimals.
pub fn normalize_gas(ohms: f64) -> f64 {
    (ohms / 1000.0 * 100.0).round() / 100.0
}

pub fn environment_rule(sensor: &str, record: &EnvRecord, t: &Thresholds) -> EnvDecision {
    let gas = normalize_gas(record.gas);
    EnvDecision {
        sensor: sensor.to_string(),
        fields: EnvFields {
            temperature: Measure {
                value: record.temperature,
                flag: band_flag(record.temperature, &t.temperature),
            },
            humidity: Measure {
                value: record.humidity,
                flag: band_flag(record.humidity, &t.humidity),
            },
            gas: Measure {
                value: gas,
                flag: band_flag(gas, &t.voc),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Lighting / time rule
// ---------------------------------------------------------------------------

/// True exactly when the hour of day differs from the previous tick's.
/// The first tick has no previous time and never fires.
pub fn hour_changed(now: OffsetDateTime, previous: Option<OffsetDateTime>) -> bool {
    match previous {
        Some(prev) => prev.hour() != now.hour(),
        None => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
