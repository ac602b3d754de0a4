//! Operator commands. A command bypasses every dispatch guard: it sets the
//! actuator's override flag, drives the actuator immediately and records
//! the new status. `END` hands control back to the rules and stops a pump
//! left running by hand; fan and lights keep their state until the rules
//! next act on them.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::info;

use crate::actuator::{set_color, set_switch, switch_is_on, Actuators};
use crate::config::ProfileLoader;
use crate::outbox::Outbox;
use crate::store::{Actuator, ActuatorStatus, Rgb, Store, SwitchState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    On,
    Off,
    Toggle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Switch {
        target: Actuator,
        action: SwitchAction,
    },
    /// Raw components as received; clamped when applied.
    Rgb([String; 3]),
    End,
    Reload(String),
}

impl Command {
    /// Accepts `"Pump ON"`, `"Fan OFF"`, `"UV ON"`, `"Toggle Fan"`, `"END"`,
    /// a three element `[r, g, b]` array or `["RELOAD", name]`.
    pub fn parse(v: &Value) -> Result<Command> {
        match v {
            Value::String(s) => parse_word(s.trim()),
            Value::Array(items) => parse_array(items),
            other => bail!("unsupported command shape: {other}"),
        }
    }
}

fn parse_word(s: &str) -> Result<Command> {
    use SwitchAction::*;
    let (target, action) = match s {
        "END" => return Ok(Command::End),
        "Pump ON" => (Actuator::Pump, On),
        "Pump OFF" => (Actuator::Pump, Off),
        "Fan ON" => (Actuator::Fan, On),
        "Fan OFF" => (Actuator::Fan, Off),
        "UV ON" => (Actuator::UvLed, On),
        "UV OFF" => (Actuator::UvLed, Off),
        "Toggle Pump" => (Actuator::Pump, Toggle),
        "Toggle Fan" => (Actuator::Fan, Toggle),
        "Toggle UV" => (Actuator::UvLed, Toggle),
        _ => bail!("unknown command '{s}'"),
    };
    Ok(Command::Switch { target, action })
}

fn parse_array(items: &[Value]) -> Result<Command> {
    match items {
        [Value::String(tag), Value::String(name)] if tag == "RELOAD" => {
            Ok(Command::Reload(name.clone()))
        }
        [r, g, b] => Ok(Command::Rgb([component(r), component(g), component(b)])),
        _ => bail!("unsupported command array of length {}", items.len()),
    }
}

fn component(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// A colour component outside `[0, 255]` or not an integer becomes 0.
pub fn clamp_component(raw: &str) -> u8 {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|v| u8::try_from(v).ok())
        .unwrap_or(0)
}

pub fn clamp_rgb(raw: &[String; 3]) -> Rgb {
    Rgb(
        clamp_component(&raw[0]),
        clamp_component(&raw[1]),
        clamp_component(&raw[2]),
    )
}

/// Apply one operator command. A failed `RELOAD` leaves the store as it was.
pub fn apply(
    cmd: Command,
    store: &mut Store,
    actuators: &Actuators,
    outbox: &Outbox,
    profiles: &dyn ProfileLoader,
) -> Result<()> {
    match cmd {
        Command::Switch { target, action } => {
            let sw = actuators
                .switch(target)
                .ok_or_else(|| anyhow!("{target} is not a switch"))?;
            let on = match action {
                SwitchAction::On => true,
                SwitchAction::Off => false,
                SwitchAction::Toggle => !switch_is_on(sw),
            };
            store.set_override(target, true);
            set_switch(sw, on).with_context(|| format!("manual {target} command failed"))?;

            let status = ActuatorStatus::Switch(SwitchState::from_on(on));
            store.set_status(target, status);
            outbox.status(target, status);
            info!(actuator = %target, on, "manual override");
        }
        Command::Rgb(raw) => {
            let rgb = clamp_rgb(&raw);
            store.set_override(Actuator::RgbLed, true);
            set_color(&actuators.rgb, rgb).context("manual RGB command failed")?;

            let status = ActuatorStatus::Color(rgb);
            store.set_status(Actuator::RgbLed, status);
            outbox.status(Actuator::RgbLed, status);
            info!(actuator = "RGB LED", ?raw, ?rgb, "manual override");
        }
        Command::End => {
            store.clear_overrides();
            // a pump started by hand has no task to stop it
            if switch_is_on(&actuators.pump) && !store.is_busy(Actuator::Pump) {
                set_switch(&actuators.pump, false).context("stopping manual pump run failed")?;
                store.set_status(Actuator::Pump, ActuatorStatus::OFF);
                outbox.status(Actuator::Pump, ActuatorStatus::OFF);
                info!(actuator = "Pump", "manual pump run stopped");
            }
            info!("manual control ended, rules back in charge");
        }
        Command::Reload(name) => {
            let profile = profiles
                .load(&name)
                .with_context(|| format!("reload of profile '{name}' failed"))?;
            store.merge_profile(&profile);
            info!(profile = %name, "profile reloaded");
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actuator::ColorStrip;
    use crate::config::tests::basil;
    use crate::config::Profile;
    use crate::store::Busy;
    use serde_json::json;

    /// Profile source backed by the test profile; any other name fails.
    pub(crate) struct BasilOnly;

    impl ProfileLoader for BasilOnly {
        fn load(&self, name: &str) -> Result<Profile> {
            if name != "basil" {
                bail!("no such profile '{name}'");
            }
            Ok(basil())
        }
    }

    fn setup() -> (Store, Actuators, Outbox) {
        let (outbox, _drx, _prx) = Outbox::channels();
        (Store::new(&basil(), 100, 10), Actuators::mock(), outbox)
    }

    fn run(cmd: Value, store: &mut Store, acts: &Actuators, outbox: &Outbox) -> Result<()> {
        apply(Command::parse(&cmd)?, store, acts, outbox, &BasilOnly)
    }

    // -- Parsing -------------------------------------------------------------

    #[test]
    fn parse_switch_words() {
        assert_eq!(
            Command::parse(&json!("Pump ON")).unwrap(),
            Command::Switch {
                target: Actuator::Pump,
                action: SwitchAction::On
            }
        );
        assert_eq!(
            Command::parse(&json!("UV OFF")).unwrap(),
            Command::Switch {
                target: Actuator::UvLed,
                action: SwitchAction::Off
            }
        );
        assert_eq!(
            Command::parse(&json!("Toggle Fan")).unwrap(),
            Command::Switch {
                target: Actuator::Fan,
                action: SwitchAction::Toggle
            }
        );
        assert_eq!(Command::parse(&json!("END")).unwrap(), Command::End);
    }

    #[test]
    fn parse_reload_and_rgb() {
        assert_eq!(
            Command::parse(&json!(["RELOAD", "basil"])).unwrap(),
            Command::Reload("basil".into())
        );
        assert_eq!(
            Command::parse(&json!(["300", 5, null])).unwrap(),
            Command::Rgb(["300".into(), "5".into(), String::new()])
        );
    }

    #[test]
    fn parse_rejects_unknown_shapes() {
        assert!(Command::parse(&json!("Pump MAYBE")).is_err());
        assert!(Command::parse(&json!(["a", "b"])).is_err());
        assert!(Command::parse(&json!([1, 2, 3, 4])).is_err());
        assert!(Command::parse(&json!({"cmd": "END"})).is_err());
        assert!(Command::parse(&json!(42)).is_err());
    }

    // -- Clamping ------------------------------------------------------------

    #[test]
    fn clamp_out_of_range_and_garbage_to_zero() {
        assert_eq!(clamp_component("300"), 0);
        assert_eq!(clamp_component("-5"), 0);
        assert_eq!(clamp_component("abc"), 0);
        assert_eq!(clamp_component(""), 0);
        assert_eq!(clamp_component(" 255 "), 255);
        assert_eq!(clamp_component("0"), 0);
    }

    #[test]
    fn rgb_override_stores_clamped_triple() {
        let (mut store, acts, outbox) = setup();
        run(json!(["300", "-5", "100"]), &mut store, &acts, &outbox).unwrap();

        assert_eq!(
            store.status(Actuator::RgbLed),
            Some(ActuatorStatus::Color(Rgb(0, 0, 100)))
        );
        assert!(store.is_overridden(Actuator::RgbLed));
        assert_eq!(acts.rgb.lock().unwrap().color(), Rgb(0, 0, 100));
    }

    // -- Switching -----------------------------------------------------------

    #[test]
    fn pump_on_sets_override_and_drives_relay() {
        let (mut store, acts, outbox) = setup();
        run(json!("Pump ON"), &mut store, &acts, &outbox).unwrap();

        assert!(store.is_overridden(Actuator::Pump));
        assert_eq!(store.status(Actuator::Pump), Some(ActuatorStatus::ON));
        assert!(switch_is_on(&acts.pump));
    }

    #[test]
    fn fan_command_overrides_fan_only() {
        let (mut store, acts, outbox) = setup();
        run(json!("Fan ON"), &mut store, &acts, &outbox).unwrap();

        assert!(store.is_overridden(Actuator::Fan));
        assert!(!store.is_overridden(Actuator::Pump));
        assert!(switch_is_on(&acts.fan));
    }

    #[test]
    fn toggle_follows_hardware_state() {
        let (mut store, acts, outbox) = setup();
        run(json!("Toggle UV"), &mut store, &acts, &outbox).unwrap();
        assert_eq!(store.status(Actuator::UvLed), Some(ActuatorStatus::ON));
        run(json!("Toggle UV"), &mut store, &acts, &outbox).unwrap();
        assert_eq!(store.status(Actuator::UvLed), Some(ActuatorStatus::OFF));
        assert!(!switch_is_on(&acts.uv));
    }

    #[test]
    fn status_is_sent_to_display() {
        let (outbox, mut drx, _prx) = Outbox::channels();
        let mut store = Store::new(&basil(), 100, 10);
        let acts = Actuators::mock();
        run(json!("Fan ON"), &mut store, &acts, &outbox).unwrap();

        let msg = drx.try_recv().unwrap();
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!(["Fan Status", "ON"])
        );
    }

    // -- END / RELOAD ----------------------------------------------------------

    #[test]
    fn end_clears_every_override() {
        let (mut store, acts, outbox) = setup();
        run(json!("Pump ON"), &mut store, &acts, &outbox).unwrap();
        run(json!(["1", "2", "3"]), &mut store, &acts, &outbox).unwrap();
        run(json!("END"), &mut store, &acts, &outbox).unwrap();

        for a in Actuator::ALL {
            assert!(!store.is_overridden(a), "{a} still overridden");
        }
        assert!(!switch_is_on(&acts.pump));
        assert_eq!(store.status(Actuator::Pump), Some(ActuatorStatus::OFF));
        // colour stays until the schedule next fires
        assert_eq!(acts.rgb.lock().unwrap().color(), Rgb(1, 2, 3));
    }

    #[test]
    fn end_reports_stopped_pump() {
        let (outbox, mut drx, _prx) = Outbox::channels();
        let mut store = Store::new(&basil(), 100, 10);
        let acts = Actuators::mock();
        run(json!("Pump ON"), &mut store, &acts, &outbox).unwrap();
        run(json!("END"), &mut store, &acts, &outbox).unwrap();

        let last = std::iter::from_fn(|| drx.try_recv().ok()).last().unwrap();
        assert_eq!(
            serde_json::to_value(&last).unwrap(),
            json!(["Pump Status", "OFF"])
        );
    }

    #[test]
    fn end_leaves_rule_watering_running() {
        let (mut store, acts, outbox) = setup();
        store.set_override(Actuator::Fan, true);
        store.set_busy(Actuator::Pump, Busy::Busy);
        set_switch(&acts.pump, true).unwrap();

        run(json!("END"), &mut store, &acts, &outbox).unwrap();
        assert!(switch_is_on(&acts.pump));
        assert!(store.is_busy(Actuator::Pump));
    }

    #[test]
    fn reload_merges_without_touching_guards() {
        let (mut store, acts, outbox) = setup();
        store.thresholds.moisture.low = 10.0;
        store.lighting_schedule.clear();
        store.set_busy(Actuator::Pump, Busy::Busy);
        store.set_override(Actuator::Fan, true);

        run(json!(["RELOAD", "basil"]), &mut store, &acts, &outbox).unwrap();

        assert_eq!(store.thresholds.moisture.low, 70.0);
        assert!(!store.lighting_schedule.is_empty());
        assert!(store.is_busy(Actuator::Pump));
        assert!(store.is_overridden(Actuator::Fan));
    }

    #[test]
    fn failed_reload_keeps_store() {
        let (mut store, acts, outbox) = setup();
        store.thresholds.moisture.low = 10.0;

        let err = run(json!(["RELOAD", "mint"]), &mut store, &acts, &outbox).unwrap_err();
        assert!(format!("{err:#}").contains("mint"));
        assert_eq!(store.thresholds.moisture.low, 10.0);
        assert_eq!(store.profile, "basil");
    }
}
