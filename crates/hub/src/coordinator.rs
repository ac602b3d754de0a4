//! The coordinator loop. One task owns the [`Store`] and runs a fixed
//! sequence per tick:
//!
//! 1. apply queued operator commands
//! 2. fire the lighting schedule on an hour boundary
//! 3. take at most one reading per sensor, record it, evaluate its rule
//!    and dispatch
//! 4. collect task completions and expire overdue tasks
//!
//! Nothing in a tick awaits; channels are polled with `try_recv`.

use anyhow::Result;
use std::time::Duration as StdDuration;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ProfileLoader, SensorKind};
use crate::dispatch::Dispatcher;
use crate::manual::{self, Command};
use crate::outbox::{DisplayMsg, Outbox};
use crate::rules::{environment_rule, hour_changed, watering_rule};
use crate::store::{Actuator, ActuatorStatus, Busy, EnvRecord, Flag, Rgb, SensorValue, Store, StoreView};

/// Receiving end of one sensor's readings.
pub struct SensorChannel {
    pub name: String,
    pub kind: SensorKind,
    rx: mpsc::Receiver<SensorValue>,
    closed: bool,
}

impl SensorChannel {
    pub fn new(name: impl Into<String>, kind: SensorKind, rx: mpsc::Receiver<SensorValue>) -> Self {
        Self {
            name: name.into(),
            kind,
            rx,
            closed: false,
        }
    }

    fn poll(&mut self) -> Option<SensorValue> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                if !self.closed {
                    self.closed = true;
                    warn!(sensor = %self.name, "sensor channel closed");
                }
                None
            }
        }
    }
}

pub struct Coordinator<L> {
    store: Store,
    dispatcher: Dispatcher,
    sensors: Vec<SensorChannel>,
    commands: mpsc::Receiver<Command>,
    profiles: L,
    outbox: Outbox,
    view: watch::Sender<StoreView>,
    previous: Option<OffsetDateTime>,
}

impl<L: ProfileLoader> Coordinator<L> {
    pub fn new(
        store: Store,
        dispatcher: Dispatcher,
        sensors: Vec<SensorChannel>,
        commands: mpsc::Receiver<Command>,
        profiles: L,
        outbox: Outbox,
        view: watch::Sender<StoreView>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            sensors,
            commands,
            profiles,
            outbox,
            view,
            previous: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// One pass of the loop at time `now`.
    pub fn step(&mut self, now: OffsetDateTime) {
        self.apply_commands(now);
        self.check_hour(now);
        self.poll_sensors(now);
        self.dispatcher.drain_completions(&mut self.store, now);
        self.dispatcher.expire_overdue(&mut self.store, now);
        self.publish();
    }

    fn apply_commands(&mut self, now: OffsetDateTime) {
        let mut applied = false;
        while let Ok(cmd) = self.commands.try_recv() {
            debug!(?cmd, "command received");
            let result = manual::apply(
                cmd,
                &mut self.store,
                self.dispatcher.actuators(),
                &self.outbox,
                &self.profiles,
            );
            match result {
                Ok(()) => applied = true,
                Err(e) => error!("command failed: {e:#}"),
            }
        }
        if applied {
            self.outbox.snapshot(&self.store, now);
        }
    }

    fn check_hour(&mut self, now: OffsetDateTime) {
        let fired = hour_changed(now, self.previous);
        self.previous = Some(now);
        if fired {
            if let Err(e) = self.dispatcher.apply_schedule(&mut self.store, now.hour()) {
                error!("lighting dispatch failed: {e:#}");
            }
        }
    }

    fn poll_sensors(&mut self, now: OffsetDateTime) {
        let pending: Vec<(String, SensorKind, SensorValue)> = self
            .sensors
            .iter_mut()
            .filter_map(|ch| ch.poll().map(|v| (ch.name.clone(), ch.kind, v)))
            .collect();

        for (sensor, kind, value) in pending {
            self.handle_reading(&sensor, kind, value, now);
        }
    }

    fn handle_reading(&mut self, sensor: &str, kind: SensorKind, value: SensorValue, now: OffsetDateTime) {
        let expected = matches!(
            (kind, &value),
            (SensorKind::Soil, SensorValue::Moisture(_))
                | (SensorKind::Environment, SensorValue::Environment(_))
        );
        if !expected {
            error!(sensor, ?kind, ?value, "unexpected reading shape, dropped");
            return;
        }

        self.outbox.reading(sensor, &value, now);
        self.store.record_reading(sensor, value.clone(), now);
        self.outbox.snapshot(&self.store, now);

        match value {
            SensorValue::Moisture(level) => self.on_moisture(sensor, level, now),
            SensorValue::Environment(record) => self.on_environment(sensor, &record, now),
        }
    }

    fn on_moisture(&mut self, sensor: &str, level: f64, now: OffsetDateTime) {
        let range = self.store.thresholds.moisture;
        let decision = watering_rule(sensor, level, self.store.water_window(sensor), &range);
        debug!(
            sensor,
            measured = decision.measured,
            filtered = decision.filtered,
            flag = ?decision.flag,
            "moisture evaluated"
        );
        self.outbox.display(DisplayMsg::from(&decision));

        if let Err(e) =
            self.dispatcher
                .dispatch_watering(&mut self.store, sensor, decision.filtered, decision.flag, now)
        {
            error!(sensor, "watering dispatch failed: {e:#}");
        }
    }

    fn on_environment(&mut self, sensor: &str, record: &EnvRecord, now: OffsetDateTime) {
        let decision = environment_rule(sensor, record, &self.store.thresholds);
        debug!(sensor, fields = ?decision.fields, "environment evaluated");
        self.outbox.display(DisplayMsg::from(&decision));

        let temperature = decision.fields.temperature.flag;
        // any reading below HIGH releases a heat shed
        let lighting = match temperature {
            Some(Flag::High) => self.dispatcher.shed_lighting(&mut self.store),
            Some(Flag::Low) | None => self.dispatcher.restore_lighting(&mut self.store, now.hour()),
        };
        if let Err(e) = lighting {
            error!(sensor, "lighting change failed: {e:#}");
        }

        if let Err(e) = self.dispatcher.dispatch_fan(&mut self.store, temperature, now) {
            error!(sensor, "fan dispatch failed: {e:#}");
        }
    }

    fn publish(&self) {
        let view = self.store.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    /// Run until `shutdown` turns true (or its sender is dropped), then
    /// stop every task, switch everything off and persist the final state.
    pub async fn run(
        mut self,
        tick: StdDuration,
        clock: impl Fn() -> OffsetDateTime,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let now = clock();
        info!(
            tick_ms = tick.as_millis() as u64,
            profile = %self.store.profile,
            sensors = self.sensors.len(),
            "coordinator started"
        );
        // lights would otherwise stay dark until the first hour boundary
        if let Err(e) = self.dispatcher.apply_schedule(&mut self.store, now.hour()) {
            error!("initial lighting failed: {e:#}");
        }
        self.previous = Some(now);

        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.step(clock());
        }

        self.stop(clock()).await;
        Ok(())
    }

    async fn stop(&mut self, now: OffsetDateTime) {
        info!("coordinator shutting down");
        self.dispatcher.shutdown().await;

        for a in Actuator::ALL {
            let off = if a == Actuator::RgbLed {
                ActuatorStatus::Color(Rgb::OFF)
            } else {
                ActuatorStatus::OFF
            };
            self.store.set_status(a, off);
            self.store.set_busy(a, Busy::Free);
        }
        self.outbox.snapshot(&self.store, now);
        self.publish();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{switch_is_on, Actuators, ColorStrip};
    use crate::config::tests::basil;
    use crate::config::PumpConfig;
    use crate::db::PersistMsg;
    use crate::manual::tests::BasilOnly;
    use crate::manual::SwitchAction;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-03-14 09:00:00 UTC);

    struct Rig {
        coord: Coordinator<BasilOnly>,
        actuators: Actuators,
        soil: mpsc::Sender<SensorValue>,
        env: mpsc::Sender<SensorValue>,
        commands: mpsc::Sender<Command>,
        persisted: mpsc::Receiver<PersistMsg>,
        display: mpsc::UnboundedReceiver<DisplayMsg>,
        view: watch::Receiver<StoreView>,
    }

    fn rig() -> Rig {
        let (outbox, display, persisted) = Outbox::channels();
        let actuators = Actuators::mock();
        let pump = PumpConfig {
            min_flow_ml: 1.0,
            max_flow_ml: 2.0,
            flow_ml_per_sec: 1000.0,
        };
        let dispatcher = Dispatcher::new(actuators.clone(), pump, 30, outbox.clone());
        let store = Store::new(&basil(), 100, 10);

        let (soil, soil_rx) = mpsc::channel(8);
        let (env, env_rx) = mpsc::channel(8);
        let (commands, cmd_rx) = mpsc::channel(8);
        let (view_tx, view) = watch::channel(store.view());

        let sensors = vec![
            SensorChannel::new("soil_moisture_sensor_1", SensorKind::Soil, soil_rx),
            SensorChannel::new("environment_sensor", SensorKind::Environment, env_rx),
        ];
        let coord = Coordinator::new(store, dispatcher, sensors, cmd_rx, BasilOnly, outbox, view_tx);

        Rig {
            coord,
            actuators,
            soil,
            env,
            commands,
            persisted,
            display,
            view,
        }
    }

    fn env(temperature: f64) -> SensorValue {
        SensorValue::Environment(EnvRecord {
            temperature,
            humidity: 70.0,
            gas: 400_000.0,
            pressure: 1013.0,
            altitude: 10.0,
        })
    }

    async fn settle() {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn dry_soil_waters_once_then_soaks() {
        let mut r = rig();
        r.soil.send(SensorValue::Moisture(40.0)).await.unwrap();
        r.coord.step(T0);
        assert!(r.coord.store().is_busy(Actuator::Pump));

        // second dry reading while the task runs
        r.soil.send(SensorValue::Moisture(40.0)).await.unwrap();
        settle().await;
        let t1 = T0 + Duration::seconds(1);
        r.coord.step(t1);
        assert!(!r.coord.store().is_busy(Actuator::Pump));
        assert_eq!(r.coord.store().timing.last_watering, Some(t1));
        assert!(!switch_is_on(&r.actuators.pump));

        r.soil.send(SensorValue::Moisture(40.0)).await.unwrap();
        r.coord.step(t1 + Duration::minutes(30));
        assert!(!r.coord.store().is_busy(Actuator::Pump), "soak must hold");
    }

    #[tokio::test]
    async fn override_in_same_tick_wins_over_rule() {
        let mut r = rig();
        r.commands
            .send(Command::Switch {
                target: Actuator::Pump,
                action: SwitchAction::Off,
            })
            .await
            .unwrap();
        r.soil.send(SensorValue::Moisture(10.0)).await.unwrap();
        r.coord.step(T0);

        let st = r.coord.store();
        assert!(st.is_overridden(Actuator::Pump));
        assert!(!st.is_busy(Actuator::Pump));

        // END hands control back; next dry reading waters
        r.commands.send(Command::End).await.unwrap();
        r.soil.send(SensorValue::Moisture(10.0)).await.unwrap();
        r.coord.step(T0 + Duration::seconds(1));
        assert!(r.coord.store().is_busy(Actuator::Pump));
    }

    #[tokio::test]
    async fn wrong_shape_is_dropped() {
        let mut r = rig();
        r.soil.send(env(25.0)).await.unwrap();
        r.env.send(SensorValue::Moisture(50.0)).await.unwrap();
        r.coord.step(T0);
        assert!(r.coord.store().latest.is_empty());
        assert!(r.persisted.try_recv().is_err());
    }

    #[tokio::test]
    async fn reading_is_persisted_with_snapshot() {
        let mut r = rig();
        r.soil.send(SensorValue::Moisture(80.0)).await.unwrap();
        r.coord.step(T0);

        assert!(matches!(
            r.persisted.try_recv().unwrap(),
            PersistMsg::Reading { ref sensor, .. } if sensor == "soil_moisture_sensor_1"
        ));
        assert!(matches!(
            r.persisted.try_recv().unwrap(),
            PersistMsg::Snapshot { .. }
        ));
        assert!(matches!(
            r.display.try_recv().unwrap(),
            DisplayMsg::Moisture(_, v, None, _) if v == 80.0
        ));
    }

    #[tokio::test]
    async fn one_reading_per_sensor_per_tick() {
        let mut r = rig();
        r.soil.send(SensorValue::Moisture(80.0)).await.unwrap();
        r.soil.send(SensorValue::Moisture(81.0)).await.unwrap();
        r.coord.step(T0);
        assert_eq!(
            r.coord.store().latest("soil_moisture_sensor_1").unwrap().value,
            SensorValue::Moisture(80.0)
        );
        r.coord.step(T0 + Duration::milliseconds(200));
        assert_eq!(
            r.coord.store().latest("soil_moisture_sensor_1").unwrap().value,
            SensorValue::Moisture(81.0)
        );
    }

    #[tokio::test]
    async fn lighting_fires_on_hour_boundary_only() {
        let mut r = rig();
        r.coord.step(datetime!(2024-03-14 13:59:59 UTC));
        assert_eq!(
            r.coord.store().status(Actuator::UvLed),
            Some(ActuatorStatus::OFF)
        );

        r.coord.step(datetime!(2024-03-14 14:00:00 UTC));
        assert_eq!(r.coord.store().status(Actuator::UvLed), Some(ActuatorStatus::ON));
        assert_eq!(r.actuators.rgb.lock().unwrap().color(), Rgb(255, 255, 255));

        r.coord.step(datetime!(2024-03-14 14:00:01 UTC));
        assert!(switch_is_on(&r.actuators.uv));

        // operator holds UV off; the 09:00 slot wants it on
        r.commands
            .send(Command::Switch {
                target: Actuator::UvLed,
                action: SwitchAction::Off,
            })
            .await
            .unwrap();
        r.coord.step(datetime!(2024-03-14 14:00:02 UTC));
        r.coord.step(datetime!(2024-03-15 09:00:00 UTC));
        assert!(!switch_is_on(&r.actuators.uv));
        assert_eq!(r.actuators.rgb.lock().unwrap().color(), Rgb::OFF);
    }

    #[tokio::test]
    async fn hot_chamber_sheds_lighting_and_runs_fan() {
        let mut r = rig();
        r.coord.step(datetime!(2024-03-14 13:59:59 UTC));
        r.coord.step(datetime!(2024-03-14 14:00:00 UTC));
        assert!(switch_is_on(&r.actuators.uv));

        r.env.send(env(36.0)).await.unwrap();
        r.coord.step(datetime!(2024-03-14 14:00:01 UTC));
        assert!(r.coord.store().heat_shed);
        assert!(!switch_is_on(&r.actuators.uv));
        assert!(r.coord.store().is_busy(Actuator::Fan));

        settle().await;
        r.coord.step(datetime!(2024-03-14 14:00:02 UTC));
        assert_eq!(r.coord.store().status(Actuator::Fan), Some(ActuatorStatus::ON));

        r.env.send(env(19.0)).await.unwrap();
        r.coord.step(datetime!(2024-03-14 14:00:03 UTC));
        assert!(!r.coord.store().heat_shed);
        assert!(switch_is_on(&r.actuators.uv));
    }

    #[tokio::test]
    async fn mid_band_temperature_restores_lighting() {
        let mut r = rig();
        r.coord.step(datetime!(2024-03-14 13:59:59 UTC));
        r.coord.step(datetime!(2024-03-14 14:00:00 UTC));

        r.env.send(env(36.0)).await.unwrap();
        r.coord.step(datetime!(2024-03-14 14:00:01 UTC));
        assert!(!switch_is_on(&r.actuators.uv));

        // within the band, neither HIGH nor LOW
        r.env.send(env(25.0)).await.unwrap();
        r.coord.step(datetime!(2024-03-14 14:10:00 UTC));
        assert!(!r.coord.store().heat_shed);
        assert!(switch_is_on(&r.actuators.uv));
        assert_eq!(r.actuators.rgb.lock().unwrap().color(), Rgb(255, 255, 255));

        // the next boundary is applied, not held
        r.coord.step(datetime!(2024-03-14 14:59:59 UTC));
        r.coord.step(datetime!(2024-03-14 15:00:00 UTC));
        assert!(!switch_is_on(&r.actuators.uv));
    }

    #[tokio::test]
    async fn pump_run_is_sized_from_filtered_level() {
        let mut r = rig();
        r.commands
            .send(Command::Switch {
                target: Actuator::Pump,
                action: SwitchAction::Off,
            })
            .await
            .unwrap();
        for i in 0..4 {
            r.soil.send(SensorValue::Moisture(60.0)).await.unwrap();
            r.coord.step(T0 + Duration::seconds(i));
        }
        assert!(!r.coord.store().is_busy(Actuator::Pump));

        // one wild reading as control returns to the rules
        r.commands.send(Command::End).await.unwrap();
        r.soil.send(SensorValue::Moisture(5.0)).await.unwrap();
        r.coord.step(T0 + Duration::seconds(4));
        assert!(r.coord.store().is_busy(Actuator::Pump));

        settle().await;
        r.coord.step(T0 + Duration::seconds(5));
        let level = std::iter::from_fn(|| r.persisted.try_recv().ok()).find_map(|m| match m {
            PersistMsg::Watering { level, .. } => Some(level),
            _ => None,
        });
        assert_eq!(level, Some(60.0));
    }

    #[tokio::test]
    async fn reload_via_channel_merges_profile() {
        let mut r = rig();
        r.commands
            .send(Command::Switch {
                target: Actuator::Fan,
                action: SwitchAction::On,
            })
            .await
            .unwrap();
        r.commands.send(Command::Reload("mint".into())).await.unwrap();
        r.commands.send(Command::Reload("basil".into())).await.unwrap();
        r.coord.step(T0);

        let st = r.coord.store();
        assert_eq!(st.profile, "basil");
        assert!(st.is_overridden(Actuator::Fan));
    }

    #[tokio::test]
    async fn view_follows_store() {
        let mut r = rig();
        r.soil.send(SensorValue::Moisture(80.0)).await.unwrap();
        r.coord.step(T0);
        assert!(r.view.has_changed().unwrap());
        assert!(r.view.borrow_and_update().latest.contains_key("soil_moisture_sensor_1"));

        r.coord.step(T0 + Duration::milliseconds(200));
        assert!(!r.view.has_changed().unwrap());
    }

    #[tokio::test]
    async fn shutdown_stops_loop_and_switches_off() {
        let mut r = rig();
        let (tx, rx) = watch::channel(false);
        let actuators = r.actuators.clone();
        crate::actuator::set_switch(&actuators.fan, true).unwrap();

        let handle = tokio::spawn(r.coord.run(StdDuration::from_millis(10), || T0, rx));
        settle().await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(!switch_is_on(&actuators.fan));
        let mut last = None;
        while let Ok(msg) = r.persisted.try_recv() {
            last = Some(msg);
        }
        assert!(matches!(last, Some(PersistMsg::Snapshot { .. })));
        assert!(r.view.borrow().actuator_busy.values().all(|b| *b == Busy::Free));
    }
}
