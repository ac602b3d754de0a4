//! Stateful sensor simulators for running the chamber without hardware.
//!
//! Soil moisture (percent, higher is wetter) models:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading electronic noise
//! - Occasional spikes (sensor flakiness)
//! - Diurnal (day/night) cycle
//! - Per-sensor calibration offsets
//! - Closed-loop watering response (moisture rises while the pump runs)
//!
//! The environment sensor follows a day/night temperature curve, cools
//! while the fan runs, and random-walks humidity, gas resistance and
//! pressure.

use serde::Serialize;
use std::fmt;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// sin of the current position in a cycle of `period_s` seconds.
fn diurnal_phase(period_s: f64) -> f64 {
    let now_s = OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9;
    (2.0 * std::f64::consts::PI * now_s / period_s).sin()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, slow drift toward dry.  Moderate noise.  ~3% spike
    /// rate.  Waters within minutes on a typical profile.
    Drying,
    /// Hovers inside a typical moisture band.  Low noise, rare spikes.
    Stable,
    /// High noise, ~10% spike rate, larger spike magnitude.  Exercises the
    /// hub's outlier filter.
    Flaky,
    /// Starts near saturation.  Very slow drying.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Soil moisture
// ---------------------------------------------------------------------------

struct SoilState {
    /// Current "true" soil moisture in percent.  Evolves each tick.
    base: f64,
    /// Permanent per-sensor calibration offset (percent).
    offset: f64,
    noise_sigma: f64,
}

pub struct SoilMoistureSim {
    sensors: Vec<SoilState>,

    // Random walk parameters
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,

    // Spike parameters
    spike_prob: f32,
    spike_sigma: f64,

    // Diurnal cycle
    diurnal_amplitude: f64,
    diurnal_period_s: f64,

    // Watering response
    watering: bool,
    wet_rate: f64,
}

impl SoilMoistureSim {
    /// `diurnal_period_s` controls the day/night cycle length.  Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, sensor_count: usize, diurnal_period_s: f64) -> Self {
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start) =
            match scenario {
                Scenario::Drying => (-0.1, 1.0, 0.02, 0.6, 0.03_f32, 15.0, 50.0),
                Scenario::Stable => (-0.015, 0.4, 0.05, 0.3, 0.005, 7.0, 80.0),
                Scenario::Flaky => (-0.07, 1.8, 0.02, 1.4, 0.10, 20.0, 60.0),
                Scenario::Wet => (-0.02, 0.6, 0.02, 0.4, 0.02, 10.0, 90.0),
            };

        let sensors = (0..sensor_count)
            .map(|_| {
                let jitter = gaussian(0.0, 3.0);
                let offset = gaussian(0.0, 2.0);
                let sensor_noise = noise_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3);
                SoilState {
                    base: (start + jitter).clamp(0.0, 100.0),
                    offset,
                    noise_sigma: sensor_noise,
                }
            })
            .collect();

        Self {
            sensors,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center: start,
            spike_prob,
            spike_sigma,
            diurnal_amplitude: 2.0,
            diurnal_period_s,
            watering: false,
            wet_rate: 2.0,
        }
    }

    /// Inform the simulator whether the pump is currently running.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    /// Produce the next moisture reading (0–100, one decimal) for the sensor
    /// at `index`.
    pub fn sample(&mut self, index: usize) -> f64 {
        let sensor = &mut self.sensors[index];

        let pull = self.mean_reversion * (self.center - sensor.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.watering { self.wet_rate } else { 0.0 };

        sensor.base = (sensor.base + self.drift_per_sample + pull + walk + wet).clamp(0.0, 100.0);

        // Soil reads driest in the afternoon.
        let diurnal = -self.diurnal_amplitude * diurnal_phase(self.diurnal_period_s);
        let noise = gaussian(0.0, sensor.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        round1((sensor.base + sensor.offset + diurnal + noise + spike).clamp(0.0, 100.0))
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// One environment sensor record; `gas` is resistance in ohms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvReading {
    pub temperature: f64,
    pub humidity: f64,
    pub gas: f64,
    pub pressure: f64,
    pub altitude: f64,
}

const SEA_LEVEL_HPA: f64 = 1013.25;

/// Barometric altitude in metres.
fn altitude_m(pressure_hpa: f64) -> f64 {
    44330.0 * (1.0 - (pressure_hpa / SEA_LEVEL_HPA).powf(1.0 / 5.255))
}

pub struct EnvSim {
    temperature_mean: f64,
    temperature_swing: f64,
    /// Accumulated cooling from the fan, decays when it stops.
    cooling: f64,
    fan_on: bool,
    humidity: f64,
    gas: f64,
    pressure: f64,
    diurnal_period_s: f64,
}

impl EnvSim {
    pub fn new(diurnal_period_s: f64) -> Self {
        Self {
            temperature_mean: 27.0,
            temperature_swing: 7.0,
            cooling: 0.0,
            fan_on: false,
            humidity: gaussian(70.0, 5.0).clamp(30.0, 95.0),
            gas: gaussian(250_000.0, 20_000.0).clamp(20_000.0, 900_000.0),
            pressure: gaussian(SEA_LEVEL_HPA, 3.0),
            diurnal_period_s,
        }
    }

    pub fn set_fan(&mut self, on: bool) {
        self.fan_on = on;
    }

    pub fn sample(&mut self) -> EnvReading {
        self.cooling = if self.fan_on {
            (self.cooling + 0.5).min(6.0)
        } else {
            (self.cooling - 0.25).max(0.0)
        };

        let temperature = self.temperature_mean
            + self.temperature_swing * diurnal_phase(self.diurnal_period_s)
            - self.cooling
            + gaussian(0.0, 0.2);

        self.humidity =
            (self.humidity + 0.05 * (70.0 - self.humidity) + gaussian(0.0, 0.8)).clamp(20.0, 100.0);
        self.gas = (self.gas + 0.05 * (250_000.0 - self.gas) + gaussian(0.0, 8_000.0))
            .clamp(10_000.0, 1_000_000.0);
        self.pressure = (self.pressure + 0.05 * (SEA_LEVEL_HPA - self.pressure)
            + gaussian(0.0, 0.1))
        .clamp(950.0, 1060.0);

        EnvReading {
            temperature: round1(temperature),
            humidity: round1(self.humidity),
            gas: self.gas.round(),
            pressure: round1(self.pressure),
            altitude: round1(altitude_m(self.pressure)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
