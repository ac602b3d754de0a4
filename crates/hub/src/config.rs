//! TOML configuration: the hub config (tick period, pump flow, sensors,
//! actuator pins) and grow profiles (thresholds, soak time, lighting
//! schedule) that can be reloaded at runtime.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::store::{LightingSlot, Range, Rgb, Thresholds};

// ---------------------------------------------------------------------------
// Hub config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Offset applied to UTC before taking the hour of day for lighting.
    #[serde(default)]
    pub utc_offset_hours: i8,
    #[serde(default = "default_profile_dir")]
    pub profile_dir: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_moisture_window")]
    pub moisture_window: usize,
    /// Extra time past a task's expected run before it is presumed lost.
    #[serde(default = "default_busy_grace_sec")]
    pub busy_grace_sec: u64,
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

fn default_tick_ms() -> u64 {
    200
}
fn default_profile_dir() -> String {
    "profiles".to_string()
}
fn default_profile() -> String {
    "basil".to_string()
}
fn default_history_capacity() -> usize {
    10_000
}
fn default_moisture_window() -> usize {
    10
}
fn default_busy_grace_sec() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpConfig {
    pub min_flow_ml: f64,
    pub max_flow_ml: f64,
    pub flow_ml_per_sec: f64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            min_flow_ml: 50.0,
            max_flow_ml: 300.0,
            flow_ml_per_sec: 5.0,
        }
    }
}

/// BCM pin numbers. The RGB strip is driven by three software-PWM pins.
#[derive(Debug, Clone, Deserialize)]
pub struct PinConfig {
    pub fan: i64,
    pub pump: i64,
    pub uv: i64,
    pub rgb: [i64; 3],
    #[serde(default = "default_active_low")]
    pub active_low: bool,
}

fn default_active_low() -> bool {
    true
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            fan: 17,
            pump: 22,
            uv: 27,
            rgb: [5, 6, 13],
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Soil,
    Environment,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub name: String,
    pub kind: SensorKind,
}

/// One week.
pub const MAX_SOAK_MINUTES: i64 = 7 * 24 * 60;
pub const MAX_FLOW_ML: f64 = 10_000.0;
/// Longest single pump run a config may ask for.
pub const MAX_PUMP_RUN_SEC: f64 = 3600.0;

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

impl HubConfig {
    /// Validate every entry and report all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.tick_ms == 0 {
            errors.push("tick_ms must be positive".to_string());
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            errors.push(format!(
                "utc_offset_hours {} out of range [-12, 14]",
                self.utc_offset_hours
            ));
        }
        if self.profile.trim().is_empty() {
            errors.push("profile is empty".to_string());
        }
        if self.history_capacity == 0 {
            errors.push("history_capacity must be positive".to_string());
        }
        if self.moisture_window == 0 {
            errors.push("moisture_window must be positive".to_string());
        }

        self.validate_pump(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_sensors(&mut errors);

        report("config", errors)
    }

    fn validate_pump(&self, errors: &mut Vec<String>) {
        let p = &self.pump;
        if !(p.min_flow_ml.is_finite() && p.min_flow_ml > 0.0) {
            errors.push(format!("pump: min_flow_ml must be positive, got {}", p.min_flow_ml));
        }
        if !(p.max_flow_ml.is_finite() && p.max_flow_ml <= MAX_FLOW_ML) {
            errors.push(format!(
                "pump: max_flow_ml {} exceeds {MAX_FLOW_ML}",
                p.max_flow_ml
            ));
        }
        if p.max_flow_ml < p.min_flow_ml {
            errors.push(format!(
                "pump: max_flow_ml ({}) must not be below min_flow_ml ({})",
                p.max_flow_ml, p.min_flow_ml
            ));
        }
        if !(p.flow_ml_per_sec > 0.0 && p.flow_ml_per_sec.is_finite()) {
            errors.push(format!(
                "pump: flow_ml_per_sec must be positive, got {}",
                p.flow_ml_per_sec
            ));
        } else if p.max_flow_ml / p.flow_ml_per_sec > MAX_PUMP_RUN_SEC {
            errors.push(format!(
                "pump: a full run of {} ml at {} ml/s exceeds {MAX_PUMP_RUN_SEC} s",
                p.max_flow_ml, p.flow_ml_per_sec
            ));
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let pins = &self.pins;
        let named = [
            ("fan", pins.fan),
            ("pump", pins.pump),
            ("uv", pins.uv),
            ("rgb.red", pins.rgb[0]),
            ("rgb.green", pins.rgb[1]),
            ("rgb.blue", pins.rgb[2]),
        ];
        let mut seen: HashSet<i64> = HashSet::new();
        for (name, pin) in named {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pins.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("pins.{name}: {pin} is already used by another actuator"));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, s) in self.sensors.iter().enumerate() {
            if s.name.trim().is_empty() {
                errors.push(format!("sensors[{i}]: name is empty"));
            } else if s.name.contains('/') {
                errors.push(format!("sensor '{}': name must not contain '/'", s.name));
            } else if !seen.insert(&s.name) {
                errors.push(format!("sensor '{}': duplicate name", s.name));
            }
        }
    }

    pub fn profile_dir(&self) -> ProfileDir {
        ProfileDir(PathBuf::from(&self.profile_dir))
    }
}

/// Read, parse, and validate the hub config.
pub fn load(path: &str) -> Result<HubConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: HubConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Grow profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RgbEntry {
    #[serde(rename = "R")]
    pub r: i64,
    #[serde(rename = "G")]
    pub g: i64,
    #[serde(rename = "B")]
    pub b: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    /// Set from the file stem, not read from the file.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "Moisture_Low")]
    pub moisture_low: f64,
    #[serde(rename = "Moisture_High")]
    pub moisture_high: f64,
    #[serde(rename = "Temperature_Low")]
    pub temperature_low: f64,
    #[serde(rename = "Temperature_High")]
    pub temperature_high: f64,
    #[serde(rename = "Humidity_Low")]
    pub humidity_low: f64,
    #[serde(rename = "Humidity_High")]
    pub humidity_high: f64,
    #[serde(rename = "VOC_Low")]
    pub voc_low: f64,
    #[serde(rename = "VOC_High")]
    pub voc_high: f64,
    #[serde(rename = "Soak_Minutes")]
    pub soak_minutes: i64,
    #[serde(rename = "RGB_data", default)]
    pub rgb_data: BTreeMap<String, RgbEntry>,
    #[serde(rename = "UV_data", default)]
    pub uv_data: BTreeMap<String, i64>,
}

impl Profile {
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let pairs = [
            ("Moisture", self.moisture_low, self.moisture_high),
            ("Temperature", self.temperature_low, self.temperature_high),
            ("Humidity", self.humidity_low, self.humidity_high),
            ("VOC", self.voc_low, self.voc_high),
        ];
        for (name, low, high) in pairs {
            if !low.is_finite() || !high.is_finite() {
                errors.push(format!("{name}: thresholds must be finite numbers"));
            } else if low >= high {
                errors.push(format!(
                    "{name}_Low ({low}) must be below {name}_High ({high})"
                ));
            }
        }
        for (name, low, high) in [pairs[0], pairs[2]] {
            if !(0.0..=100.0).contains(&low) || !(0.0..=100.0).contains(&high) {
                errors.push(format!("{name}: thresholds must be within [0, 100]"));
            }
        }

        if self.soak_minutes < 0 {
            errors.push(format!(
                "Soak_Minutes must not be negative, got {}",
                self.soak_minutes
            ));
        } else if self.soak_minutes > MAX_SOAK_MINUTES {
            errors.push(format!(
                "Soak_Minutes {} exceeds {MAX_SOAK_MINUTES} (one week)",
                self.soak_minutes
            ));
        }

        for (hour, rgb) in &self.rgb_data {
            if parse_hour(hour).is_none() {
                errors.push(format!("RGB_data: '{hour}' is not an hour (0-23)"));
            }
            for (c, v) in [("R", rgb.r), ("G", rgb.g), ("B", rgb.b)] {
                if !(0..=255).contains(&v) {
                    errors.push(format!("RGB_data.{hour}.{c} {v} out of range [0, 255]"));
                }
            }
        }
        for (hour, uv) in &self.uv_data {
            if parse_hour(hour).is_none() {
                errors.push(format!("UV_data: '{hour}' is not an hour (0-23)"));
            }
            if !(0..=1).contains(uv) {
                errors.push(format!("UV_data.{hour} must be 0 or 1, got {uv}"));
            }
        }

        report(&format!("profile '{}'", self.name), errors)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            moisture: Range {
                low: self.moisture_low,
                high: self.moisture_high,
            },
            temperature: Range {
                low: self.temperature_low,
                high: self.temperature_high,
            },
            humidity: Range {
                low: self.humidity_low,
                high: self.humidity_high,
            },
            voc: Range {
                low: self.voc_low,
                high: self.voc_high,
            },
        }
    }

    /// Hour-of-day lighting slots. An hour present in only one of
    /// `RGB_data`/`UV_data` gets the other part switched off.
    pub fn lighting_schedule(&self) -> BTreeMap<u8, LightingSlot> {
        let mut schedule: BTreeMap<u8, LightingSlot> = BTreeMap::new();
        for (hour, rgb) in &self.rgb_data {
            if let Some(h) = parse_hour(hour) {
                schedule.entry(h).or_insert(LightingSlot::OFF).rgb =
                    Rgb(channel(rgb.r), channel(rgb.g), channel(rgb.b));
            }
        }
        for (hour, uv) in &self.uv_data {
            if let Some(h) = parse_hour(hour) {
                schedule.entry(h).or_insert(LightingSlot::OFF).uv = *uv != 0;
            }
        }
        schedule
    }
}

fn parse_hour(s: &str) -> Option<u8> {
    s.trim().parse::<u8>().ok().filter(|h| *h < 24)
}

fn channel(v: i64) -> u8 {
    v.clamp(0, 255) as u8
}

fn report(what: &str, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "{what} validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
    }
}

/// Parse and validate a profile from TOML text.
pub fn parse_profile(name: &str, contents: &str) -> Result<Profile> {
    let mut profile: Profile =
        toml::from_str(contents).with_context(|| format!("failed to parse profile: {name}"))?;
    profile.name = name.to_string();
    profile.validate()?;
    Ok(profile)
}

/// Where grow profiles come from on `RELOAD`.
pub trait ProfileLoader {
    fn load(&self, name: &str) -> Result<Profile>;
}

/// Profiles stored as `<dir>/<name>.toml`.
#[derive(Debug, Clone)]
pub struct ProfileDir(pub PathBuf);

impl ProfileLoader for ProfileDir {
    fn load(&self, name: &str) -> Result<Profile> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            bail!("invalid profile name '{name}'");
        }
        let path = self.0.join(format!("{name}.toml"));
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read profile: {}", path.display()))?;
        parse_profile(name, &contents)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const BASIL_TOML: &str = r#"
Temperature_Low = 20
Temperature_High = 35
Moisture_Low = 70
Moisture_High = 95
Humidity_Low = 60
Humidity_High = 100
VOC_Low = 100
VOC_High = 900
Soak_Minutes = 60

[RGB_data]
"6" = { R = 0, G = 50, B = 0 }
"10" = { R = 255, G = 255, B = 255 }
"14" = { R = 255, G = 255, B = 255 }
"22" = { R = 0, G = 0, B = 0 }

[UV_data]
"9" = 1
"10" = 0
"14" = 1
"#;

    pub(crate) fn basil() -> Profile {
        parse_profile("basil", BASIL_TOML).unwrap()
    }

    fn valid_hub() -> HubConfig {
        toml::from_str(
            r#"
[[sensors]]
name = "soil_moisture_sensor_1"
kind = "soil"

[[sensors]]
name = "environment_sensor"
kind = "environment"
"#,
        )
        .unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_err(result: Result<()>, needle: &str) {
        let msg = format!("{:#}", result.unwrap_err());
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Hub config --------------------------------------------------------

    #[test]
    fn hub_defaults_apply() {
        let cfg = valid_hub();
        assert_eq!(cfg.tick_ms, 200);
        assert_eq!(cfg.profile, "basil");
        assert_eq!(cfg.pins.pump, 22);
        assert_eq!(cfg.sensors.len(), 2);
        assert_eq!(cfg.sensors[1].kind, SensorKind::Environment);
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_hub_config_parses() {
        let cfg: HubConfig = toml::from_str("").unwrap();
        assert!(cfg.sensors.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn hub_duplicate_sensor_rejected() {
        let mut cfg = valid_hub();
        cfg.sensors.push(cfg.sensors[0].clone());
        assert_err(cfg.validate(), "duplicate name");
    }

    #[test]
    fn hub_sensor_name_with_slash_rejected() {
        let mut cfg = valid_hub();
        cfg.sensors[0].name = "a/b".into();
        assert_err(cfg.validate(), "must not contain '/'");
    }

    #[test]
    fn hub_pin_outside_header_rejected() {
        let mut cfg = valid_hub();
        cfg.pins.uv = 1;
        assert_err(cfg.validate(), "pins.uv: 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn hub_shared_pin_rejected() {
        let mut cfg = valid_hub();
        cfg.pins.fan = cfg.pins.pump;
        assert_err(cfg.validate(), "already used by another actuator");
    }

    #[test]
    fn hub_pump_flow_inverted_rejected() {
        let mut cfg = valid_hub();
        cfg.pump.max_flow_ml = 10.0;
        assert_err(cfg.validate(), "must not be below min_flow_ml");
    }

    #[test]
    fn hub_pump_bounds_rejected() {
        let mut cfg = valid_hub();
        cfg.pump.max_flow_ml = 1.0e12;
        assert_err(cfg.validate(), "exceeds 10000");

        let mut cfg = valid_hub();
        cfg.pump.max_flow_ml = f64::NAN;
        assert_err(cfg.validate(), "max_flow_ml NaN exceeds");

        let mut cfg = valid_hub();
        cfg.pump.flow_ml_per_sec = 0.01;
        assert_err(cfg.validate(), "a full run of 300 ml at 0.01 ml/s exceeds 3600 s");

        let mut cfg = valid_hub();
        cfg.pump.flow_ml_per_sec = f64::INFINITY;
        assert_err(cfg.validate(), "flow_ml_per_sec must be positive");
    }

    #[test]
    fn hub_multiple_errors_collected() {
        let mut cfg = valid_hub();
        cfg.tick_ms = 0;
        cfg.pump.flow_ml_per_sec = 0.0;
        cfg.utc_offset_hours = 20;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    // -- Profiles ----------------------------------------------------------

    #[test]
    fn basil_parses() {
        let p = basil();
        assert_eq!(p.name, "basil");
        assert_eq!(p.thresholds().moisture, Range { low: 70.0, high: 95.0 });
        assert_eq!(p.soak_minutes, 60);
    }

    #[test]
    fn schedule_merges_rgb_and_uv() {
        let s = basil().lighting_schedule();
        assert_eq!(s[&6], LightingSlot { uv: false, rgb: Rgb(0, 50, 0) });
        assert_eq!(s[&9], LightingSlot { uv: true, rgb: Rgb::OFF });
        assert_eq!(s[&14], LightingSlot { uv: true, rgb: Rgb(255, 255, 255) });
        assert!(!s.contains_key(&3));
    }

    #[test]
    fn profile_without_lighting_is_valid() {
        let text = BASIL_TOML.split("[RGB_data]").next().unwrap();
        let p = parse_profile("bare", text).unwrap();
        assert!(p.lighting_schedule().is_empty());
    }

    #[test]
    fn profile_inverted_range_rejected() {
        let mut p = basil();
        p.temperature_low = 40.0;
        assert_err(p.validate(), "Temperature_Low (40) must be below Temperature_High (35)");
    }

    #[test]
    fn profile_bad_hour_rejected() {
        let mut p = basil();
        p.uv_data.insert("24".into(), 1);
        assert_err(p.validate(), "'24' is not an hour");
    }

    #[test]
    fn profile_bad_color_rejected() {
        let mut p = basil();
        p.rgb_data.insert("5".into(), RgbEntry { r: 300, g: 0, b: -1 });
        let msg = format!("{:#}", p.validate().unwrap_err());
        assert!(msg.contains("RGB_data.5.R 300"), "got: {msg}");
        assert!(msg.contains("RGB_data.5.B -1"), "got: {msg}");
    }

    #[test]
    fn profile_negative_soak_rejected() {
        let mut p = basil();
        p.soak_minutes = -1;
        assert_err(p.validate(), "Soak_Minutes must not be negative");
    }

    #[test]
    fn profile_soak_longer_than_a_week_rejected() {
        let mut p = basil();
        p.soak_minutes = MAX_SOAK_MINUTES;
        p.validate().unwrap();

        p.soak_minutes = i64::MAX;
        assert_err(p.validate(), "exceeds 10080 (one week)");
    }

    #[test]
    fn profile_missing_threshold_fails_to_parse() {
        let text = BASIL_TOML.replace("VOC_High = 900", "");
        assert!(parse_profile("broken", &text).is_err());
    }

    #[test]
    fn profile_dir_rejects_path_traversal() {
        let dir = ProfileDir(PathBuf::from("profiles"));
        assert!(dir.load("../etc/passwd").is_err());
        assert!(dir.load("").is_err());
    }

    #[test]
    fn profile_dir_loads_file() {
        let dir = std::env::temp_dir().join(format!("growbox-profiles-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("basil.toml"), BASIL_TOML).unwrap();

        let p = ProfileDir(dir.clone()).load("basil").unwrap();
        assert_eq!(p.name, "basil");
        assert!(ProfileDir(dir.clone()).load("mint").is_err());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
