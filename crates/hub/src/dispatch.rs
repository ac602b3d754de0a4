//! Actuation dispatcher: guard checks and the per-actuator busy state
//! machine for the pump and the fan, plus immediate lighting changes.
//!
//! ```text
//! Free ──[guards pass]──▶ Busy ──[completion report]──▶ Free
//!                          │
//!                          └──[deadline passed]──▶ forced OFF, Free
//! ```
//!
//! A dispatched task owns its relay for the whole run and reports back on a
//! channel; the coordinator drains those channels each tick. Reports carry
//! the id of the dispatch that produced them so a late report from a task
//! that was already given up on can never free its successor.

use anyhow::{Context, Result};
use std::fmt;
use std::time::{Duration as StdDuration, Instant};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actuator::{set_color, set_switch, switch_is_on, Actuators, SharedSwitch};
use crate::config::{PumpConfig, MAX_PUMP_RUN_SEC};
use crate::db::PersistMsg;
use crate::outbox::Outbox;
use crate::store::{Actuator, ActuatorStatus, Busy, Flag, LightingSlot, Store, SwitchState};

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Why an automatic dispatch did not happen. Expected control flow, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    NoAction,
    Override,
    Busy,
    Soaking { until: OffsetDateTime },
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAction => write!(f, "nothing to do"),
            Self::Override => write!(f, "manual override active"),
            Self::Busy => write!(f, "previous task still running"),
            Self::Soaking { until } => write!(f, "soaking until {until}"),
        }
    }
}

pub fn pump_guard(store: &Store, now: OffsetDateTime, flag: Option<Flag>) -> Result<(), Blocked> {
    if flag != Some(Flag::Low) {
        return Err(Blocked::NoAction);
    }
    if store.is_overridden(Actuator::Pump) {
        return Err(Blocked::Override);
    }
    if store.is_busy(Actuator::Pump) {
        return Err(Blocked::Busy);
    }
    if let Some(until) = store.pending_soak(now) {
        return Err(Blocked::Soaking { until });
    }
    Ok(())
}

/// HIGH temperature wants the fan on, LOW wants it off.
pub fn fan_guard(store: &Store, temperature: Option<Flag>) -> Result<SwitchState, Blocked> {
    let wanted = match temperature {
        Some(Flag::High) => SwitchState::On,
        Some(Flag::Low) => SwitchState::Off,
        None => return Err(Blocked::NoAction),
    };
    if store.is_overridden(Actuator::Fan) {
        return Err(Blocked::Override);
    }
    if store.is_busy(Actuator::Fan) {
        return Err(Blocked::Busy);
    }
    if store.status(Actuator::Fan) == Some(ActuatorStatus::Switch(wanted)) {
        return Err(Blocked::NoAction);
    }
    Ok(wanted)
}

/// Pump run time: flow scales linearly from `min_flow_ml` at the threshold
/// to `max_flow_ml` for bone-dry soil. Capped at `MAX_PUMP_RUN_SEC`; a
/// nonsensical config yields no run at all.
pub fn pump_run_duration(level: f64, low: f64, cfg: &PumpConfig) -> StdDuration {
    let deficit = if low > 0.0 {
        ((low - level) / low).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let flow_ml = cfg.min_flow_ml + deficit * (cfg.max_flow_ml - cfg.min_flow_ml);
    let secs = (flow_ml / cfg.flow_ml_per_sec).clamp(0.0, MAX_PUMP_RUN_SEC);
    StdDuration::try_from_secs_f64(secs).unwrap_or(StdDuration::ZERO)
}

pub fn lighting_for_hour(store: &Store, hour: u8) -> LightingSlot {
    store
        .lighting_schedule
        .get(&hour)
        .copied()
        .unwrap_or(LightingSlot::OFF)
}

// ---------------------------------------------------------------------------
// Task reports
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PumpReport {
    id: u64,
    pub level: f64,
    pub ran: StdDuration,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct FanReport {
    id: u64,
    pub outcome: Result<SwitchState, String>,
}

async fn pump_task(
    id: u64,
    pump: SharedSwitch,
    run: StdDuration,
    level: f64,
    tx: mpsc::Sender<PumpReport>,
) {
    let started = Instant::now();
    let result = match set_switch(&pump, true) {
        Ok(()) => {
            tokio::time::sleep(run).await;
            set_switch(&pump, false)
        }
        Err(e) => {
            // make sure a half-applied ON does not leave water running
            let _ = set_switch(&pump, false);
            Err(e)
        }
    };
    let report = PumpReport {
        id,
        level,
        ran: started.elapsed(),
        error: result.err().map(|e| format!("{e:#}")),
    };
    let _ = tx.send(report).await;
}

async fn fan_task(id: u64, fan: SharedSwitch, wanted: SwitchState, tx: mpsc::Sender<FanReport>) {
    let outcome = set_switch(&fan, wanted == SwitchState::On)
        .map(|()| wanted)
        .map_err(|e| format!("{e:#}"));
    let _ = tx.send(FanReport { id, outcome }).await;
}

// ---------------------------------------------------------------------------
// In-flight bookkeeping
// ---------------------------------------------------------------------------

struct InFlight {
    id: u64,
    handle: JoinHandle<()>,
    started: OffsetDateTime,
    deadline: OffsetDateTime,
}

struct Slot<T> {
    tx: mpsc::Sender<T>,
    rx: mpsc::Receiver<T>,
    in_flight: Option<InFlight>,
    next_id: u64,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(4);
        Self {
            tx,
            rx,
            in_flight: None,
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Remove the in-flight entry when `id` belongs to it.
    fn finish(&mut self, id: u64) -> Option<InFlight> {
        match &self.in_flight {
            Some(t) if t.id == id => self.in_flight.take(),
            _ => None,
        }
    }

    fn take_overdue(&mut self, now: OffsetDateTime) -> Option<InFlight> {
        match &self.in_flight {
            Some(t) if now > t.deadline => self.in_flight.take(),
            _ => None,
        }
    }

    async fn shutdown(&mut self) {
        if let Some(t) = self.in_flight.take() {
            t.handle.abort();
            let _ = t.handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    actuators: Actuators,
    pump_cfg: PumpConfig,
    busy_grace: Duration,
    outbox: Outbox,
    pump: Slot<PumpReport>,
    fan: Slot<FanReport>,
}

impl Dispatcher {
    pub fn new(actuators: Actuators, pump_cfg: PumpConfig, busy_grace_sec: u64, outbox: Outbox) -> Self {
        Self {
            actuators,
            pump_cfg,
            busy_grace: Duration::seconds(busy_grace_sec as i64),
            outbox,
            pump: Slot::new(),
            fan: Slot::new(),
        }
    }

    pub fn actuators(&self) -> &Actuators {
        &self.actuators
    }

    // -- Watering --------------------------------------------------------

    /// Start a watering task if every pump guard passes. `level` sizes the
    /// run and should be the filtered window mean. Returns whether a task
    /// was started.
    pub fn dispatch_watering(
        &mut self,
        store: &mut Store,
        sensor: &str,
        level: f64,
        flag: Option<Flag>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        match pump_guard(store, now, flag) {
            Ok(()) => {}
            Err(Blocked::NoAction) => return Ok(false),
            Err(reason) => {
                info!(actuator = "Pump", sensor, %reason, "watering skipped");
                return Ok(false);
            }
        }

        let run = pump_run_duration(level, store.thresholds.moisture.low, &self.pump_cfg);
        let deadline = now
            + Duration::try_from(run).context("pump run duration out of range")?
            + self.busy_grace;

        let id = self.pump.next_id();
        let handle = tokio::spawn(pump_task(
            id,
            self.actuators.pump.clone(),
            run,
            level,
            self.pump.tx.clone(),
        ));
        self.pump.in_flight = Some(InFlight {
            id,
            handle,
            started: now,
            deadline,
        });

        store.set_busy(Actuator::Pump, Busy::Busy);
        store.set_status(Actuator::Pump, ActuatorStatus::ON);
        self.outbox.status(Actuator::Pump, ActuatorStatus::ON);
        info!(
            actuator = "Pump",
            sensor,
            level,
            duration_sec = run.as_secs_f64(),
            "watering started"
        );
        Ok(true)
    }

    fn complete_watering(&mut self, store: &mut Store, report: PumpReport, now: OffsetDateTime) {
        let Some(task) = self.pump.finish(report.id) else {
            debug!(id = report.id, "stale pump report ignored");
            return;
        };

        store.set_busy(Actuator::Pump, Busy::Free);
        store.set_status(Actuator::Pump, ActuatorStatus::OFF);
        self.outbox.status(Actuator::Pump, ActuatorStatus::OFF);

        match report.error {
            None => {
                store.record_watering(now);
                info!(
                    actuator = "Pump",
                    level = report.level,
                    duration_sec = report.ran.as_secs_f64(),
                    soak_end = ?store.timing.soak_end_time,
                    "watering finished"
                );
                self.outbox.persist(PersistMsg::Watering {
                    ts_start: task.started.unix_timestamp(),
                    ts_end: now.unix_timestamp(),
                    level: report.level,
                    duration_sec: report.ran.as_secs_f64(),
                });
            }
            Some(e) => error!(actuator = "Pump", "watering task failed: {e}"),
        }
    }

    // -- Fan -----------------------------------------------------------------

    pub fn dispatch_fan(
        &mut self,
        store: &mut Store,
        temperature: Option<Flag>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let wanted = match fan_guard(store, temperature) {
            Ok(w) => w,
            Err(Blocked::NoAction) => return Ok(false),
            Err(reason) => {
                debug!(actuator = "Fan", %reason, "fan change skipped");
                return Ok(false);
            }
        };

        let id = self.fan.next_id();
        let handle = tokio::spawn(fan_task(id, self.actuators.fan.clone(), wanted, self.fan.tx.clone()));
        self.fan.in_flight = Some(InFlight {
            id,
            handle,
            started: now,
            deadline: now + self.busy_grace,
        });

        store.set_busy(Actuator::Fan, Busy::Busy);
        info!(actuator = "Fan", ?wanted, "fan change dispatched");
        Ok(true)
    }

    fn complete_fan(&mut self, store: &mut Store, report: FanReport) {
        if self.fan.finish(report.id).is_none() {
            debug!(id = report.id, "stale fan report ignored");
            return;
        }

        let state = match report.outcome {
            Ok(state) => state,
            Err(e) => {
                error!(actuator = "Fan", "fan task failed: {e}");
                SwitchState::from_on(switch_is_on(&self.actuators.fan))
            }
        };
        store.set_busy(Actuator::Fan, Busy::Free);
        store.set_status(Actuator::Fan, ActuatorStatus::Switch(state));
        self.outbox.status(Actuator::Fan, ActuatorStatus::Switch(state));
    }

    // -- Completion and timeout ----------------------------------------------

    /// Apply at most one pending report per actuator.
    pub fn drain_completions(&mut self, store: &mut Store, now: OffsetDateTime) {
        if let Ok(report) = self.pump.rx.try_recv() {
            self.complete_watering(store, report, now);
        }
        if let Ok(report) = self.fan.rx.try_recv() {
            self.complete_fan(store, report);
        }
    }

    /// Give up on tasks that ran past their deadline: abort, switch the
    /// relay off and release the busy guard.
    pub fn expire_overdue(&mut self, store: &mut Store, now: OffsetDateTime) {
        let overdue = [
            (Actuator::Pump, self.pump.take_overdue(now)),
            (Actuator::Fan, self.fan.take_overdue(now)),
        ];
        for (a, task) in overdue {
            let Some(task) = task else { continue };
            task.handle.abort();
            warn!(actuator = %a, started = %task.started, "task overdue, forcing off");

            let sw = if a == Actuator::Pump {
                &self.actuators.pump
            } else {
                &self.actuators.fan
            };
            if let Err(e) = set_switch(sw, false) {
                error!(actuator = %a, "forced off failed: {e:#}");
            }
            store.set_busy(a, Busy::Free);
            store.set_status(a, ActuatorStatus::OFF);
            self.outbox.status(a, ActuatorStatus::OFF);
        }
    }

    // -- Lighting ------------------------------------------------------------

    fn set_lighting(&mut self, store: &mut Store, slot: LightingSlot) -> Result<()> {
        if store.is_overridden(Actuator::RgbLed) {
            debug!(actuator = "RGB LED", "manual override active, schedule skipped");
        } else {
            set_color(&self.actuators.rgb, slot.rgb)?;
            let status = ActuatorStatus::Color(slot.rgb);
            store.set_status(Actuator::RgbLed, status);
            self.outbox.status(Actuator::RgbLed, status);
        }

        if store.is_overridden(Actuator::UvLed) {
            debug!(actuator = "UV LED", "manual override active, schedule skipped");
        } else {
            set_switch(&self.actuators.uv, slot.uv)?;
            let status = ActuatorStatus::Switch(SwitchState::from_on(slot.uv));
            store.set_status(Actuator::UvLed, status);
            self.outbox.status(Actuator::UvLed, status);
        }
        Ok(())
    }

    /// Apply the schedule entry for `hour`; an hour with no entry is dark.
    /// Held off while lighting is shed for heat.
    pub fn apply_schedule(&mut self, store: &mut Store, hour: u8) -> Result<()> {
        if store.heat_shed {
            info!(hour, "lighting shed for heat, schedule held");
            return Ok(());
        }
        let slot = lighting_for_hour(store, hour);
        info!(hour, uv = slot.uv, rgb = ?slot.rgb, "applying lighting schedule");
        self.set_lighting(store, slot)
    }

    pub fn shed_lighting(&mut self, store: &mut Store) -> Result<()> {
        if store.heat_shed {
            return Ok(());
        }
        store.heat_shed = true;
        warn!("temperature HIGH, lighting off");
        self.set_lighting(store, LightingSlot::OFF)
    }

    pub fn restore_lighting(&mut self, store: &mut Store, hour: u8) -> Result<()> {
        if !store.heat_shed {
            return Ok(());
        }
        store.heat_shed = false;
        info!("temperature back down, lighting restored");
        self.apply_schedule(store, hour)
    }

    /// Abort and join any in-flight task, then switch everything off.
    pub async fn shutdown(&mut self) {
        self.pump.shutdown().await;
        self.fan.shutdown().await;
        self.actuators.all_off();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
