//! Actuator capabilities. Relays (pump, fan, UV LED) implement [`Switch`];
//! the RGB strip implements [`ColorStrip`]. Mock implementations log state
//! changes and are always available; the `gpio` feature adds rppal-backed
//! drivers for a Raspberry Pi.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::config::PinConfig;
use crate::store::{Actuator, Rgb};

pub trait Switch: Send {
    fn turn_on(&mut self) -> Result<()>;
    fn turn_off(&mut self) -> Result<()>;
    fn is_on(&self) -> bool;

    fn toggle(&mut self) -> Result<()> {
        if self.is_on() {
            self.turn_off()
        } else {
            self.turn_on()
        }
    }
}

pub trait ColorStrip: Send {
    fn adjust_color(&mut self, rgb: Rgb) -> Result<()>;
    fn color(&self) -> Rgb;
}

pub type SharedSwitch = Arc<Mutex<dyn Switch>>;
pub type SharedStrip = Arc<Mutex<dyn ColorStrip>>;

/// Run `f` against a shared switch.
pub fn with_switch<R>(s: &SharedSwitch, f: impl FnOnce(&mut dyn Switch) -> Result<R>) -> Result<R> {
    let mut guard = s.lock().map_err(|_| anyhow!("switch lock poisoned"))?;
    f(&mut *guard)
}

pub fn set_switch(s: &SharedSwitch, on: bool) -> Result<()> {
    with_switch(s, |sw| if on { sw.turn_on() } else { sw.turn_off() })
}

pub fn switch_is_on(s: &SharedSwitch) -> bool {
    s.lock().map(|sw| sw.is_on()).unwrap_or(false)
}

pub fn set_color(s: &SharedStrip, rgb: Rgb) -> Result<()> {
    let mut guard = s.lock().map_err(|_| anyhow!("strip lock poisoned"))?;
    guard.adjust_color(rgb)
}

// ---------------------------------------------------------------------------
// Actuator set
// ---------------------------------------------------------------------------

/// Every actuator of the chamber, chosen once at startup.
#[derive(Clone)]
pub struct Actuators {
    pub pump: SharedSwitch,
    pub fan: SharedSwitch,
    pub uv: SharedSwitch,
    pub rgb: SharedStrip,
}

impl Actuators {
    pub fn mock() -> Self {
        Self {
            pump: Arc::new(Mutex::new(MockRelay::new("pump"))),
            fan: Arc::new(Mutex::new(MockRelay::new("fan"))),
            uv: Arc::new(Mutex::new(MockRelay::new("UV LED"))),
            rgb: Arc::new(Mutex::new(MockStrip::default())),
        }
    }

    #[cfg(feature = "gpio")]
    pub fn gpio(pins: &PinConfig) -> Result<Self> {
        let gpio = Gpio::new()?;
        Ok(Self {
            pump: Arc::new(Mutex::new(RelaySwitch::new(&gpio, "pump", pins.pump, pins.active_low)?)),
            fan: Arc::new(Mutex::new(RelaySwitch::new(&gpio, "fan", pins.fan, pins.active_low)?)),
            uv: Arc::new(Mutex::new(RelaySwitch::new(&gpio, "UV LED", pins.uv, pins.active_low)?)),
            rgb: Arc::new(Mutex::new(PwmStrip::new(&gpio, pins.rgb)?)),
        })
    }

    /// Hardware drivers when built with `gpio` and `simulate` is false,
    /// otherwise mocks.
    pub fn from_pins(pins: &PinConfig, simulate: bool) -> Result<Self> {
        if simulate {
            return Ok(Self::mock());
        }
        hardware(pins)
    }

    pub fn switch(&self, a: Actuator) -> Option<&SharedSwitch> {
        match a {
            Actuator::Pump => Some(&self.pump),
            Actuator::Fan => Some(&self.fan),
            Actuator::UvLed => Some(&self.uv),
            Actuator::RgbLed => None,
        }
    }

    /// Fail-safe: everything off. Keeps going past individual failures.
    pub fn all_off(&self) {
        for (name, s) in [("pump", &self.pump), ("fan", &self.fan), ("UV LED", &self.uv)] {
            if let Err(e) = set_switch(s, false) {
                warn!(actuator = name, "failed to switch off: {e:#}");
            }
        }
        if let Err(e) = set_color(&self.rgb, Rgb::OFF) {
            warn!(actuator = "RGB LED", "failed to switch off: {e:#}");
        }
    }
}

#[cfg(feature = "gpio")]
fn hardware(pins: &PinConfig) -> Result<Actuators> {
    Actuators::gpio(pins)
}

#[cfg(not(feature = "gpio"))]
fn hardware(pins: &PinConfig) -> Result<Actuators> {
    warn!(?pins, "built without `gpio` feature, using mock actuators");
    Ok(Actuators::mock())
}

// ---------------------------------------------------------------------------
// Real GPIO drivers (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelaySwitch {
    name: &'static str,
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    on: bool,
}

#[cfg(feature = "gpio")]
impl RelaySwitch {
    pub fn new(gpio: &Gpio, name: &'static str, pin: i64, active_low: bool) -> Result<Self> {
        let pin = gpio.get(pin as u8)?.into_output();
        let mut relay = Self {
            name,
            pin,
            active_low,
            on: true,
        };
        relay.turn_off()?;
        Ok(relay)
    }

    fn drive(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        self.on = on;
        info!(actuator = self.name, "relay set {}", if on { "ON" } else { "OFF" });
    }
}

#[cfg(feature = "gpio")]
impl Switch for RelaySwitch {
    fn turn_on(&mut self) -> Result<()> {
        self.drive(true);
        Ok(())
    }

    fn turn_off(&mut self) -> Result<()> {
        self.drive(false);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

/// Analog RGB strip behind three MOSFETs, dimmed with software PWM.
#[cfg(feature = "gpio")]
pub struct PwmStrip {
    pins: [OutputPin; 3],
    color: Rgb,
}

#[cfg(feature = "gpio")]
const PWM_HZ: f64 = 200.0;

#[cfg(feature = "gpio")]
impl PwmStrip {
    pub fn new(gpio: &Gpio, pins: [i64; 3]) -> Result<Self> {
        let [r, g, b] = pins;
        let mut strip = Self {
            pins: [
                gpio.get(r as u8)?.into_output(),
                gpio.get(g as u8)?.into_output(),
                gpio.get(b as u8)?.into_output(),
            ],
            color: Rgb::OFF,
        };
        strip.adjust_color(Rgb::OFF)?;
        Ok(strip)
    }
}

#[cfg(feature = "gpio")]
impl ColorStrip for PwmStrip {
    fn adjust_color(&mut self, rgb: Rgb) -> Result<()> {
        let Rgb(r, g, b) = rgb;
        for (pin, level) in self.pins.iter_mut().zip([r, g, b]) {
            if level == 0 {
                pin.clear_pwm()?;
                pin.set_low();
            } else {
                pin.set_pwm_frequency(PWM_HZ, f64::from(level) / 255.0)?;
            }
        }
        self.color = rgb;
        info!(actuator = "RGB LED", r, g, b, "strip color set");
        Ok(())
    }

    fn color(&self) -> Rgb {
        self.color
    }
}

// ---------------------------------------------------------------------------
// Mock drivers (development: no hardware, logs state)
// ---------------------------------------------------------------------------

pub struct MockRelay {
    name: &'static str,
    on: bool,
}

impl MockRelay {
    pub fn new(name: &'static str) -> Self {
        info!(actuator = name, "[mock-gpio] relay registered (no hardware)");
        Self { name, on: false }
    }
}

impl Switch for MockRelay {
    fn turn_on(&mut self) -> Result<()> {
        self.on = true;
        info!(actuator = self.name, "[mock-gpio] relay set ON");
        Ok(())
    }

    fn turn_off(&mut self) -> Result<()> {
        self.on = false;
        info!(actuator = self.name, "[mock-gpio] relay set OFF");
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

#[derive(Default)]
pub struct MockStrip {
    color: Rgb,
}

impl ColorStrip for MockStrip {
    fn adjust_color(&mut self, rgb: Rgb) -> Result<()> {
        self.color = rgb;
        let Rgb(r, g, b) = rgb;
        info!(actuator = "RGB LED", r, g, b, "[mock-gpio] strip color set");
        Ok(())
    }

    fn color(&self) -> Rgb {
        self.color
    }
}

// ===========================================================================
// Tests
// ===========================================================================
