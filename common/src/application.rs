//! The THR application: experiment sessions over MQTT, guarded by the same
//! identity failsafe as the bootloader.

use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{DeviceConfig, FailsafeConfig},
    experiment::{parse_command, parse_settings, ExperimentEngine, ExperimentEvent},
    failsafe::{execute_fallback, Actuator, Failsafe, FailsafeAction, FallbackReport},
    identity::{Delay, TagStore},
    partition::{FlashError, FlashPartitions, PartitionManager},
    sensor::{Sensor, SensorKind, SensorSettings, Temperature},
    topics::{data_topic, status_topic, InboundTopic},
    types::{IdentifyPayload, StatusPayload},
};

/// How often an idle thermometer is probed for presence.
pub const SENSOR_CHECK_INTERVAL_MS: u64 = 5_000;

/// DHCP join budget for the application: 20 polls of 500 ms.
pub const WIFI_JOIN_TIMEOUT_MS: u32 = 10_000;

/// Inputs from the transport and the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppInput {
    /// The broker session is (re)established.
    Connected,
    Message { topic: String, payload: Vec<u8> },
    /// The restart-to-bootloader line was pulled low.
    RestartTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppOutput {
    Publish { topic: String, payload: String },
    /// Leave the application slot. The session has already been discarded.
    Fallback,
}

/// Application state. Owned by a single thread; the transport feeds it
/// [`AppInput`]s and carries out the returned [`AppOutput`]s.
pub struct ThermometerApp<S, F, T, D> {
    sensor_id: String,
    sensor: S,
    engine: ExperimentEngine,
    failsafe: Failsafe<T, D>,
    partitions: PartitionManager<F>,
    failsafe_config: FailsafeConfig,
    sensor_present: bool,
    next_sensor_check_ms: u64,
    between_chunks: fn(u32),
    actuator: Option<Box<dyn Actuator>>,
}

impl<S, F, T, D> ThermometerApp<S, F, T, D>
where
    S: Sensor<Reading = Temperature>,
    F: FlashPartitions,
    T: TagStore,
    D: Delay,
{
    pub fn new(
        sensor_id: String,
        sensor: S,
        failsafe: Failsafe<T, D>,
        partitions: PartitionManager<F>,
        config: &DeviceConfig,
    ) -> Self {
        Self {
            sensor_id,
            sensor,
            engine: ExperimentEngine::new(&config.experiment),
            failsafe,
            partitions,
            failsafe_config: config.failsafe.clone(),
            sensor_present: true,
            next_sensor_check_ms: 0,
            between_chunks: |_| {},
            actuator: None,
        }
    }

    /// Hook run between erase blocks, usually a watchdog feed.
    pub fn set_chunk_hook(&mut self, hook: fn(u32)) {
        self.between_chunks = hook;
    }

    /// Parked, with a bounded wait, before a fallback wipes the
    /// application slot.
    pub fn set_actuator(&mut self, actuator: impl Actuator) {
        self.actuator = Some(Box::new(actuator));
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn engine(&self) -> &ExperimentEngine {
        &self.engine
    }

    pub fn sample_period_ms(&self) -> u32 {
        self.engine.sample_period_ms()
    }

    /// Pushes the configured resolution down to the driver and runs the
    /// identity gate.
    pub fn boot(&mut self, now_ms: u64) -> Result<FailsafeAction, FlashError> {
        let settings = SensorSettings {
            resolution: Some(self.engine.resolution_bits()),
            duration: None,
        };
        if let Err(err) = self.sensor.configure(&settings) {
            warn!("initial sensor configuration failed: {err}");
        }
        let hook = self.between_chunks;
        self.failsafe.boot(&mut self.partitions, now_ms, hook)
    }

    pub fn handle(&mut self, input: AppInput, now_ms: u64) -> Vec<AppOutput> {
        match input {
            AppInput::Connected => {
                info!("broker session up, announcing {}", self.sensor_id);
                self.apply(vec![ExperimentEvent::Identify])
            }
            AppInput::Message { topic, payload } => {
                self.handle_message(&topic, &payload, now_ms)
            }
            AppInput::RestartTrigger => {
                warn!("restart trigger asserted");
                self.leave()
            }
        }
    }

    fn handle_message(&mut self, topic: &str, payload: &[u8], now_ms: u64) -> Vec<AppOutput> {
        let events = match InboundTopic::classify(topic, &self.sensor_id) {
            Some(InboundTopic::Command) => match parse_command(payload) {
                Ok(command) => self.engine.handle_command(command, now_ms),
                Err(err) => {
                    warn!("ignoring command on {topic}: {err}");
                    return Vec::new();
                }
            },
            Some(InboundTopic::Config) => match parse_settings(payload) {
                Ok(settings) => self.engine.handle_config(settings),
                Err(err) => {
                    warn!("ignoring config on {topic}: {err}");
                    return Vec::new();
                }
            },
            None => {
                warn!("message on unexpected topic {topic}");
                return Vec::new();
            }
        };
        self.apply(events)
    }

    /// Takes one reading if an experiment is running. `clock` is read on
    /// both sides of the conversion so `pt` covers it.
    pub fn sample(&mut self, clock: impl Fn() -> u64) -> Vec<AppOutput> {
        if !self.engine.is_running() {
            return Vec::new();
        }
        let started = clock();
        match self.sensor.read() {
            Ok(reading) => {
                let now = clock();
                let process_ms = u32::try_from(now.saturating_sub(started)).unwrap_or(u32::MAX);
                self.sensor_present = true;
                let events = self.engine.record(reading, process_ms, now);
                self.apply(events)
            }
            Err(err) => {
                warn!("thermometer read failed: {err}");
                self.mark_missing()
            }
        }
    }

    /// Housekeeping: experiment duration, idle presence probe and the
    /// identity recheck.
    pub fn tick(&mut self, now_ms: u64) -> Vec<AppOutput> {
        let events = self.engine.tick(now_ms);
        let mut out = self.apply(events);

        if !self.engine.is_running() && now_ms >= self.next_sensor_check_ms {
            self.next_sensor_check_ms = now_ms + SENSOR_CHECK_INTERVAL_MS;
            match self.sensor.read() {
                Ok(_) => {
                    if !self.sensor_present {
                        info!("thermometer is back");
                    }
                    self.sensor_present = true;
                }
                Err(_) => out.extend(self.mark_missing()),
            }
        }

        let running = match self.partitions.running() {
            Ok(running) => running.slot,
            Err(err) => {
                warn!("recheck skipped: {err}");
                return out;
            }
        };
        if self.failsafe.poll(now_ms, running) == Some(FailsafeAction::FallbackToBootloader) {
            out.extend(self.leave());
        }
        out
    }

    fn mark_missing(&mut self) -> Vec<AppOutput> {
        if !self.sensor_present {
            return Vec::new();
        }
        self.sensor_present = false;
        let events = self.engine.sensor_lost();
        self.apply(events)
    }

    fn leave(&mut self) -> Vec<AppOutput> {
        self.engine.discard();
        vec![AppOutput::Fallback]
    }

    fn apply(&mut self, events: Vec<ExperimentEvent>) -> Vec<AppOutput> {
        let mut out = Vec::new();
        for event in events {
            match event {
                ExperimentEvent::Status { status, message } => {
                    let payload = StatusPayload {
                        status: status.to_string(),
                        sensor_id: self.sensor_id.clone(),
                        sensor_type: SensorKind::Thr,
                        message,
                    };
                    out.extend(self.publish(status_topic(&self.sensor_id), &payload));
                }
                ExperimentEvent::Data(data) => {
                    out.extend(self.publish(data_topic(&self.sensor_id), &data));
                }
                ExperimentEvent::Identify => {
                    let payload = IdentifyPayload::new(&self.sensor_id, self.sensor.kind());
                    out.extend(self.publish(status_topic(&self.sensor_id), &payload));
                }
                ExperimentEvent::Configure(settings) => {
                    if let Err(err) = self.sensor.configure(&settings) {
                        warn!("thermometer rejected {settings:?}: {err}");
                    }
                }
                ExperimentEvent::Fallback => out.extend(self.leave()),
            }
        }
        out
    }

    fn publish<P: Serialize>(&self, topic: String, payload: &P) -> Option<AppOutput> {
        match serde_json::to_string(payload) {
            Ok(payload) => Some(AppOutput::Publish { topic, payload }),
            Err(err) => {
                warn!("failed to encode payload for {topic}: {err}");
                None
            }
        }
    }

    /// Selects slot A and wipes this slot. The caller restarts afterwards.
    pub fn prepare_fallback(&mut self) -> FallbackReport {
        self.engine.discard();
        let hook = self.between_chunks;
        execute_fallback(
            &mut self.partitions,
            self.actuator.take(),
            &self.failsafe_config,
            hook,
        )
    }

    pub fn fall_back(&mut self) -> ! {
        if let Err(err) = self.prepare_fallback().result {
            warn!("fallback finished with error: {err}");
        }
        self.partitions.restart()
    }

    pub fn restart(&mut self) -> ! {
        self.partitions.restart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        failsafe::{ShutdownOutcome, TagPolicy},
        identity::IdentityGate,
        partition::{SlotId, ERASE_CHUNK_BYTES},
        sim::{RecordingDelay, SimActuator, SimEeprom, SimFlash, SimThermometer},
        topics::{command_topic, config_topic},
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    type TestApp = ThermometerApp<SimThermometer, SimFlash, SimEeprom, RecordingDelay>;

    const ID: &str = "2AB9F";

    fn app(eeprom: SimEeprom) -> TestApp {
        let config = DeviceConfig::default();
        let gate = IdentityGate::new(eeprom, RecordingDelay::default(), &config.identity);
        let failsafe = Failsafe::new(gate, TagPolicy::OneOf(vec!["THR"]), &config.failsafe);
        ThermometerApp::new(
            ID.to_string(),
            SimThermometer::new(21.5),
            failsafe,
            PartitionManager::new(SimFlash::new(SlotId::B, 2 * ERASE_CHUNK_BYTES)),
            &config,
        )
    }

    fn command(app: &mut TestApp, body: Value, now_ms: u64) -> Vec<AppOutput> {
        app.handle(
            AppInput::Message {
                topic: command_topic(ID),
                payload: body.to_string().into_bytes(),
            },
            now_ms,
        )
    }

    fn published(outputs: &[AppOutput]) -> Vec<(String, Value)> {
        outputs
            .iter()
            .filter_map(|output| match output {
                AppOutput::Publish { topic, payload } => {
                    Some((topic.clone(), serde_json::from_str(payload).unwrap()))
                }
                AppOutput::Fallback => None,
            })
            .collect()
    }

    #[test]
    fn connect_announces_the_thermometer() {
        let mut app = app(SimEeprom::with_tag(b"THR"));
        let out = published(&app.handle(AppInput::Connected, 0));

        assert_eq!(
            out,
            vec![(
                "sensors/2AB9F/status".to_string(),
                json!({"type": "sensor_identify", "sensor_id": ID, "sensor_type": "THR"})
            )]
        );
    }

    #[test]
    fn experiment_publishes_counted_readings_until_done() {
        let mut app = app(SimEeprom::with_tag(b"THR"));
        let started = published(&command(
            &mut app,
            json!({"command": "start_experiment", "count": 2}),
            1_000,
        ));
        assert_eq!(started[0].1["status"], "experiment_started");

        let first = published(&app.sample(|| 1_200));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, "sensors/2AB9F/data");
        assert_eq!(first[0].1["cnt"], 1);
        assert_eq!(first[0].1["ts"], 200);

        let second = published(&app.sample(|| 1_400));
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].1["status"], "experiment_completed");
        assert_eq!(second[1].1["message"], "Count reached");

        assert!(app.sample(|| 1_600).is_empty());
    }

    #[test]
    fn config_updates_resolution_and_sample_period() {
        let mut app = app(SimEeprom::with_tag(b"THR"));
        let out = app.handle(
            AppInput::Message {
                topic: config_topic(ID),
                payload: br#"{"resolution":12}"#.to_vec(),
            },
            0,
        );

        assert_eq!(published(&out)[0].1["status"], "config_updated");
        assert_eq!(app.sensor.resolution_bits(), 12);
        assert_eq!(app.sample_period_ms(), 750 + 100);
    }

    #[test]
    fn disconnect_command_discards_and_falls_back() {
        let mut app = app(SimEeprom::with_tag(b"THR"));
        command(&mut app, json!({"command": "start_experiment"}), 0);
        app.sample(|| 10);

        let out = command(&mut app, json!({"command": "disconnect_device"}), 20);

        assert_eq!(published(&out)[0].1["status"], "disconnecting");
        assert_eq!(out.last(), Some(&AppOutput::Fallback));
        assert!(!app.engine().is_running());
        assert_eq!(app.engine().status().readings, 0);
    }

    #[test]
    fn unplugged_thermometer_is_reported_once() {
        let mut app = app(SimEeprom::with_tag(b"THR"));
        app.sensor.connected = false;

        let first = published(&app.tick(0));
        assert_eq!(first[0].1["status"], "sensor_unplugged");
        assert!(published(&app.tick(SENSOR_CHECK_INTERVAL_MS)).is_empty());
    }

    #[test]
    fn missing_tag_on_recheck_triggers_fallback() {
        let mut app = app(SimEeprom::with_tag(b"THR"));
        assert_eq!(app.boot(0).unwrap(), FailsafeAction::Continue);
        command(&mut app, json!({"command": "start_experiment"}), 0);

        app.failsafe.gate_mut().store_mut().present = false;
        let out = app.tick(2_000);

        assert_eq!(out.last(), Some(&AppOutput::Fallback));
        assert!(!app.engine().is_running());
    }

    #[test]
    fn fallback_boots_slot_a_then_wipes_slot_b() {
        let mut app = app(SimEeprom::with_tag(b"THR"));
        let actuator = SimActuator::default();
        app.set_actuator(actuator.clone());

        let report = app.prepare_fallback();

        assert_eq!(report.shutdown, Some(ShutdownOutcome::Homed));
        assert_eq!(actuator.homed(), 1);
        assert_eq!(report.result, Ok(()));
        assert_eq!(app.partitions.flash().boot_slot().unwrap(), SlotId::A);
        assert!(app
            .partitions
            .flash()
            .image(SlotId::B)
            .iter()
            .all(|byte| *byte == 0xFF));
    }
}
