use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::ExperimentConfig,
    sensor::{
        conversion_time_ms, SensorSettings, Temperature, MAX_RESOLUTION_BITS, MIN_RESOLUTION_BITS,
    },
    types::DataPayload,
};

pub const STATUS_CONFIG_UPDATED: &str = "config_updated";
pub const STATUS_STARTED: &str = "experiment_started";
pub const STATUS_STOPPED: &str = "experiment_stopped";
pub const STATUS_COMPLETED: &str = "experiment_completed";
pub const STATUS_SENSOR_UNPLUGGED: &str = "sensor_unplugged";
pub const STATUS_DISCONNECTING: &str = "disconnecting";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExperimentError {
    #[error("malformed message: {0}")]
    BadJson(String),
}

/// Body of a `sensors/{id}/command` message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartExperiment {
        #[serde(default)]
        count: Option<u32>,
    },
    StopExperiment,
    DisconnectDevice,
    Status,
}

pub fn parse_command(payload: &[u8]) -> Result<Command, ExperimentError> {
    serde_json::from_slice(payload).map_err(|err| ExperimentError::BadJson(err.to_string()))
}

pub fn parse_settings(payload: &[u8]) -> Result<SensorSettings, ExperimentError> {
    serde_json::from_slice(payload).map_err(|err| ExperimentError::BadJson(err.to_string()))
}

/// What the application must do after feeding the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentEvent {
    Status {
        status: &'static str,
        message: Option<String>,
    },
    Data(DataPayload),
    Identify,
    /// Push the accepted settings down to the sensor driver.
    Configure(SensorSettings),
    /// Leave the application slot for the bootloader.
    Fallback,
}

impl ExperimentEvent {
    fn status(status: &'static str) -> Self {
        Self::Status {
            status,
            message: None,
        }
    }

    fn status_with(status: &'static str, message: &str) -> Self {
        Self::Status {
            status,
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExperimentStatus {
    pub running: bool,
    pub readings: u32,
    /// 0 runs until stopped or the duration elapses.
    pub target_count: u32,
    pub resolution: u8,
    pub duration_s: u32,
}

/// Measurement session state. Pure bookkeeping: the caller owns the sensor
/// and the transport.
#[derive(Debug, Clone)]
pub struct ExperimentEngine {
    config: ExperimentConfig,
    running: bool,
    started_ms: u64,
    target_count: u32,
    readings: u32,
}

impl ExperimentEngine {
    pub fn new(config: &ExperimentConfig) -> Self {
        let mut config = config.clone();
        config.sanitize();
        Self {
            config,
            running: false,
            started_ms: 0,
            target_count: 0,
            readings: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn status(&self) -> ExperimentStatus {
        ExperimentStatus {
            running: self.running,
            readings: self.readings,
            target_count: self.target_count,
            resolution: self.config.resolution_bits,
            duration_s: self.config.duration_s,
        }
    }

    pub fn resolution_bits(&self) -> u8 {
        self.config.resolution_bits
    }

    /// Conversion time at the current resolution plus the cool-down gap.
    pub fn sample_period_ms(&self) -> u32 {
        conversion_time_ms(self.config.resolution_bits) + self.config.sample_gap_ms
    }

    pub fn handle_command(&mut self, command: Command, now_ms: u64) -> Vec<ExperimentEvent> {
        match command {
            Command::StartExperiment { count } => {
                self.running = true;
                self.started_ms = now_ms;
                self.readings = 0;
                self.target_count = count.unwrap_or(self.config.default_count);
                info!("experiment started (count {})", self.target_count);
                vec![ExperimentEvent::status(STATUS_STARTED)]
            }
            Command::StopExperiment => {
                self.running = false;
                info!("experiment stopped after {} readings", self.readings);
                vec![ExperimentEvent::status(STATUS_STOPPED)]
            }
            Command::DisconnectDevice => {
                self.discard();
                vec![
                    ExperimentEvent::status(STATUS_DISCONNECTING),
                    ExperimentEvent::Fallback,
                ]
            }
            Command::Status => vec![ExperimentEvent::Identify],
        }
    }

    /// Applies the fields of a config message that are in range. Out of range
    /// resolutions are ignored, as the driver would reject them anyway.
    pub fn handle_config(&mut self, settings: SensorSettings) -> Vec<ExperimentEvent> {
        let mut accepted = SensorSettings::default();
        if let Some(bits) = settings.resolution {
            if (MIN_RESOLUTION_BITS..=MAX_RESOLUTION_BITS).contains(&bits) {
                self.config.resolution_bits = bits;
                accepted.resolution = Some(bits);
            } else {
                warn!("ignoring resolution {bits}");
            }
        }
        if let Some(duration) = settings.duration {
            self.config.duration_s = duration;
            accepted.duration = Some(duration);
        }

        let mut events = Vec::new();
        if accepted.resolution.is_some() {
            events.push(ExperimentEvent::Configure(accepted));
        }
        events.push(ExperimentEvent::status(STATUS_CONFIG_UPDATED));
        events
    }

    /// Records one reading taken `process_ms` after its conversion started.
    pub fn record(
        &mut self,
        reading: Temperature,
        process_ms: u32,
        now_ms: u64,
    ) -> Vec<ExperimentEvent> {
        if !self.running {
            return Vec::new();
        }
        self.readings += 1;
        let mut events = vec![ExperimentEvent::Data(DataPayload::new(
            reading,
            now_ms.saturating_sub(self.started_ms),
            self.readings,
            process_ms,
        ))];

        if self.target_count > 0 && self.readings >= self.target_count {
            self.running = false;
            info!("experiment completed: {} readings", self.readings);
            events.push(ExperimentEvent::status_with(STATUS_COMPLETED, "Count reached"));
        }
        events
    }

    /// Ends a running experiment once its duration has elapsed.
    pub fn tick(&mut self, now_ms: u64) -> Vec<ExperimentEvent> {
        let duration_ms = u64::from(self.config.duration_s) * 1_000;
        if self.running
            && duration_ms > 0
            && now_ms.saturating_sub(self.started_ms) >= duration_ms
        {
            self.running = false;
            info!("experiment completed: duration reached");
            return vec![ExperimentEvent::status_with(
                STATUS_COMPLETED,
                "Duration reached",
            )];
        }
        Vec::new()
    }

    pub fn sensor_lost(&mut self) -> Vec<ExperimentEvent> {
        warn!("thermometer stopped responding");
        vec![ExperimentEvent::status(STATUS_SENSOR_UNPLUGGED)]
    }

    /// Drops the session without publishing anything.
    pub fn discard(&mut self) {
        if self.running {
            warn!("discarding experiment after {} readings", self.readings);
        }
        self.running = false;
        self.readings = 0;
        self.target_count = 0;
    }
}
