use std::{sync::mpsc, thread, time::Duration};

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::FailsafeConfig,
    identity::{Delay, IdentityGate, IdentityResult, IdentityTag, TagStore},
    partition::{FallbackError, FlashError, FlashPartitions, PartitionManager, SlotId},
};

/// Which identity tags a firmware image can drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPolicy {
    /// Bootloader: any non-blank tag is good enough to stay up.
    AnyPresent,
    /// Application: only the listed sensor kinds.
    OneOf(Vec<&'static str>),
}

impl TagPolicy {
    pub fn recognizes(&self, tag: &IdentityTag) -> bool {
        match self {
            Self::AnyPresent => true,
            Self::OneOf(codes) => codes.iter().any(|code| tag.matches(code)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeAction {
    Continue,
    /// Slot A without a usable sensor: keep network services running.
    StayInBootloader,
    /// Slot B without a usable sensor: boot A, wipe B, restart.
    FallbackToBootloader,
}

/// The decision table. An unrecognised tag counts as absent.
pub fn decide(identity: &IdentityResult, running: SlotId, policy: &TagPolicy) -> FailsafeAction {
    let recognized = identity.tag().is_some_and(|tag| policy.recognizes(&tag));
    match (recognized, running) {
        (true, _) => FailsafeAction::Continue,
        (false, SlotId::A) => FailsafeAction::StayInBootloader,
        (false, SlotId::B) => FailsafeAction::FallbackToBootloader,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("actuator did not reach home: {0}")]
    Fault(String),
}

/// Hardware that must be parked before the application slot is wiped.
pub trait Actuator: Send + 'static {
    fn drive_home(&mut self) -> Result<(), ActuatorError>;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn drive_home(&mut self) -> Result<(), ActuatorError> {
        (**self).drive_home()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Homed,
    Failed(ActuatorError),
    TimedOut,
}

/// Drives the actuator home on a helper thread and waits at most
/// `timeout`. A stuck actuator is abandoned, never waited on.
pub fn safe_shutdown<A: Actuator>(mut actuator: A, timeout: Duration) -> ShutdownOutcome {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("safe-shutdown".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let _ = tx.send(actuator.drive_home());
        });
    if let Err(err) = spawned {
        warn!("safe shutdown thread failed to start: {err}");
        return ShutdownOutcome::Failed(ActuatorError::Fault(err.to_string()));
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => {
            info!("actuator homed");
            ShutdownOutcome::Homed
        }
        Ok(Err(err)) => {
            warn!("safe shutdown failed: {err}");
            ShutdownOutcome::Failed(err)
        }
        Err(_) => {
            warn!("safe shutdown timed out after {} ms", timeout.as_millis());
            ShutdownOutcome::TimedOut
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RecheckTimer {
    interval_ms: u64,
    next_ms: u64,
}

impl RecheckTimer {
    fn new(interval_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            next_ms: now_ms.saturating_add(interval_ms),
        }
    }

    fn due(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_ms {
            return false;
        }
        self.next_ms = now_ms.saturating_add(self.interval_ms);
        true
    }
}

/// Boot gate plus periodic recheck of the sensor head.
pub struct Failsafe<S, D> {
    gate: IdentityGate<S, D>,
    policy: TagPolicy,
    config: FailsafeConfig,
    identity: IdentityResult,
    timer: RecheckTimer,
}

impl<S: TagStore, D: Delay> Failsafe<S, D> {
    pub fn new(gate: IdentityGate<S, D>, policy: TagPolicy, config: &FailsafeConfig) -> Self {
        Self {
            gate,
            policy,
            config: config.clone(),
            identity: IdentityResult::Absent,
            timer: RecheckTimer::new(config.recheck_interval_ms, 0),
        }
    }

    pub fn identity(&self) -> IdentityResult {
        self.identity
    }

    pub fn policy(&self) -> &TagPolicy {
        &self.policy
    }

    pub fn gate_mut(&mut self) -> &mut IdentityGate<S, D> {
        &mut self.gate
    }

    /// Records a freshly repaired tag so the next recheck compares against it.
    pub fn note_repaired(&mut self, tag: IdentityTag) {
        self.identity = IdentityResult::Present(tag);
    }

    /// Boot-time gate. On slot A the inactive slot is erased so a clean OTA
    /// can follow, and a missing sensor gets a bounded reconnection wait.
    /// Only the running-slot lookup is fatal.
    pub fn boot<F: FlashPartitions>(
        &mut self,
        partitions: &mut PartitionManager<F>,
        now_ms: u64,
        mut between_chunks: impl FnMut(u32),
    ) -> Result<FailsafeAction, FlashError> {
        let running = partitions.running()?;
        info!("booted from {}", running.label);

        self.identity = self.gate.detect();
        let mut action = decide(&self.identity, running.slot, &self.policy);

        if running.slot == SlotId::A {
            match partitions.inactive() {
                Ok(inactive) => {
                    if let Err(err) = partitions.erase(&inactive, &mut between_chunks) {
                        warn!("boot-time erase of {} failed: {err}", inactive.label);
                    }
                }
                Err(err) => warn!("inactive partition lookup failed: {err}"),
            }

            if action == FailsafeAction::StayInBootloader {
                action = self.wait_for_sensor(running.slot, &mut between_chunks);
            }
        }

        self.timer = RecheckTimer::new(self.config.recheck_interval_ms, now_ms);
        match action {
            FailsafeAction::Continue => info!("sensor head present, continuing"),
            FailsafeAction::StayInBootloader => {
                warn!("no sensor head detected, staying in bootloader")
            }
            FailsafeAction::FallbackToBootloader => {
                warn!("sensor head missing or unsupported, falling back to bootloader")
            }
        }
        Ok(action)
    }

    fn wait_for_sensor(
        &mut self,
        running: SlotId,
        between_chunks: &mut impl FnMut(u32),
    ) -> FailsafeAction {
        let attempts = self.config.boot_wait_attempts;
        for attempt in 1..=attempts {
            info!("waiting for sensor head ({attempt}/{attempts})");
            self.gate.pause(self.config.boot_wait_interval_ms);
            between_chunks(0);
            self.identity = self.gate.detect();
            let action = decide(&self.identity, running, &self.policy);
            if action == FailsafeAction::Continue {
                return action;
            }
        }
        FailsafeAction::StayInBootloader
    }

    /// Rereads the tag when the recheck interval has elapsed. Returns the
    /// action for the fresh reading, or `None` when no check was due.
    pub fn poll(&mut self, now_ms: u64, running: SlotId) -> Option<FailsafeAction> {
        if !self.timer.due(now_ms) {
            return None;
        }

        let previous = self.identity;
        self.identity = self.gate.detect();
        if previous != self.identity {
            match (previous.tag(), self.identity.tag()) {
                (Some(old), None) => warn!("sensor head {old} removed"),
                (_, Some(new)) => info!("sensor head {new} detected"),
                (None, None) => {}
            }
        }
        Some(decide(&self.identity, running, &self.policy))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackReport {
    pub shutdown: Option<ShutdownOutcome>,
    pub result: Result<(), FallbackError>,
}

/// Parks the actuator (bounded), then selects slot A and wipes slot B. The
/// caller restarts afterwards regardless of the report.
pub fn execute_fallback<F: FlashPartitions, A: Actuator>(
    partitions: &mut PartitionManager<F>,
    actuator: Option<A>,
    config: &FailsafeConfig,
    between_chunks: impl FnMut(u32),
) -> FallbackReport {
    let shutdown = actuator.map(|actuator| {
        safe_shutdown(
            actuator,
            Duration::from_millis(config.safe_shutdown_timeout_ms),
        )
    });

    let result = partitions.prepare_fallback(between_chunks);
    if let Err(err) = &result {
        warn!("fallback incomplete: {err}");
    }
    FallbackReport { shutdown, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::IdentityConfig,
        partition::ERASE_CHUNK_BYTES,
        sim::{FlashOp, RecordingDelay, SimEeprom, SimFlash},
    };
    use pretty_assertions::assert_eq;

    fn tag(code: &str) -> IdentityTag {
        IdentityTag::parse(code).unwrap()
    }

    #[test]
    fn decision_table() {
        let thr = TagPolicy::OneOf(vec!["THR"]);
        let present = IdentityResult::Present(tag("THR"));
        let foreign = IdentityResult::Present(tag("ULT"));

        assert_eq!(decide(&present, SlotId::B, &thr), FailsafeAction::Continue);
        assert_eq!(decide(&present, SlotId::A, &thr), FailsafeAction::Continue);
        assert_eq!(
            decide(&foreign, SlotId::B, &thr),
            FailsafeAction::FallbackToBootloader
        );
        assert_eq!(
            decide(&IdentityResult::Absent, SlotId::A, &thr),
            FailsafeAction::StayInBootloader
        );
        assert_eq!(
            decide(&foreign, SlotId::A, &TagPolicy::AnyPresent),
            FailsafeAction::Continue
        );
    }

    #[test]
    fn recognised_tof_needs_no_action() {
        let mut eeprom = SimEeprom::with_tag(b"TOF");
        let mut delay = RecordingDelay::default();
        let mut partitions = PartitionManager::new(SimFlash::new(SlotId::B, ERASE_CHUNK_BYTES));
        let gate = IdentityGate::new(&mut eeprom, &mut delay, &IdentityConfig::default());
        let mut failsafe = Failsafe::new(
            gate,
            TagPolicy::OneOf(vec!["TOF"]),
            &FailsafeConfig::default(),
        );

        let action = failsafe.boot(&mut partitions, 0, |_| {}).unwrap();

        assert_eq!(action, FailsafeAction::Continue);
        assert_eq!(failsafe.identity(), IdentityResult::Present(tag("TOF")));
        assert!(partitions.flash().ops.is_empty());
    }

    #[test]
    fn empty_tag_on_application_slot_falls_back() {
        let mut eeprom = SimEeprom::with_tag(b"THR");
        eeprom.short_reads = 3;
        let mut delay = RecordingDelay::default();
        let mut partitions =
            PartitionManager::new(SimFlash::new(SlotId::B, 2 * ERASE_CHUNK_BYTES));

        let action = {
            let gate = IdentityGate::new(&mut eeprom, &mut delay, &IdentityConfig::default());
            let mut failsafe = Failsafe::new(
                gate,
                TagPolicy::OneOf(vec!["THR"]),
                &FailsafeConfig::default(),
            );
            failsafe.boot(&mut partitions, 0, |_| {}).unwrap()
        };
        assert_eq!(action, FailsafeAction::FallbackToBootloader);
        assert_eq!(eeprom.reads, 3);

        let report = execute_fallback(
            &mut partitions,
            None::<Box<dyn Actuator>>,
            &FailsafeConfig::default(),
            |_| {},
        );

        assert_eq!(report.result, Ok(()));
        let ops = &partitions.flash().ops;
        assert_eq!(ops[0], FlashOp::SetBoot(SlotId::A));
        assert_eq!(ops.len(), 3);
        assert_eq!(partitions.flash().boot_slot().unwrap(), SlotId::A);
    }

    #[test]
    fn absent_sensor_in_bootloader_waits_then_stays() {
        let mut eeprom = SimEeprom::unplugged();
        let mut delay = RecordingDelay::default();
        let mut partitions = PartitionManager::new(SimFlash::new(SlotId::A, ERASE_CHUNK_BYTES));

        let action = {
            let gate = IdentityGate::new(&mut eeprom, &mut delay, &IdentityConfig::default());
            let mut failsafe =
                Failsafe::new(gate, TagPolicy::AnyPresent, &FailsafeConfig::default());
            failsafe.boot(&mut partitions, 0, |_| {}).unwrap()
        };

        assert_eq!(action, FailsafeAction::StayInBootloader);
        assert_eq!(eeprom.probes, 4);
        assert_eq!(delay.calls, vec![5_000; 3]);
        assert_eq!(
            partitions.flash().ops,
            vec![FlashOp::Erase {
                slot: SlotId::B,
                offset: 0,
                len: ERASE_CHUNK_BYTES
            }]
        );
    }

    #[test]
    fn recheck_runs_on_interval_and_detects_removal() {
        let mut eeprom = SimEeprom::with_tag(b"THR");
        let mut delay = RecordingDelay::default();
        let mut partitions = PartitionManager::new(SimFlash::new(SlotId::B, ERASE_CHUNK_BYTES));
        let gate = IdentityGate::new(&mut eeprom, &mut delay, &IdentityConfig::default());
        let mut failsafe = Failsafe::new(
            gate,
            TagPolicy::OneOf(vec!["THR"]),
            &FailsafeConfig::default(),
        );

        assert_eq!(
            failsafe.boot(&mut partitions, 10_000, |_| {}).unwrap(),
            FailsafeAction::Continue
        );
        assert_eq!(failsafe.poll(11_000, SlotId::B), None);
        assert_eq!(
            failsafe.poll(12_000, SlotId::B),
            Some(FailsafeAction::Continue)
        );

        drop(failsafe);
        eeprom.present = false;

        let gate = IdentityGate::new(&mut eeprom, &mut delay, &IdentityConfig::default());
        let mut failsafe = Failsafe::new(
            gate,
            TagPolicy::OneOf(vec!["THR"]),
            &FailsafeConfig::default(),
        );
        failsafe.note_repaired(tag("THR"));
        assert_eq!(
            failsafe.poll(2_000, SlotId::B),
            Some(FailsafeAction::FallbackToBootloader)
        );
        assert_eq!(failsafe.identity(), IdentityResult::Absent);
    }

    struct StuckActuator;

    impl Actuator for StuckActuator {
        fn drive_home(&mut self) -> Result<(), ActuatorError> {
            thread::sleep(Duration::from_secs(5));
            Ok(())
        }
    }

    struct FaultyActuator;

    impl Actuator for FaultyActuator {
        fn drive_home(&mut self) -> Result<(), ActuatorError> {
            Err(ActuatorError::Fault("limit switch open".into()))
        }
    }

    #[test]
    fn stuck_actuator_never_blocks_fallback() {
        let mut partitions = PartitionManager::new(SimFlash::new(SlotId::B, ERASE_CHUNK_BYTES));
        let mut config = FailsafeConfig::default();
        config.safe_shutdown_timeout_ms = 50;

        let report = execute_fallback(&mut partitions, Some(StuckActuator), &config, |_| {});

        assert_eq!(report.shutdown, Some(ShutdownOutcome::TimedOut));
        assert_eq!(report.result, Ok(()));
        assert_eq!(partitions.flash().boot_slot().unwrap(), SlotId::A);
    }

    #[test]
    fn actuator_fault_is_reported_and_fallback_proceeds() {
        let mut partitions = PartitionManager::new(SimFlash::new(SlotId::B, ERASE_CHUNK_BYTES));

        let report = execute_fallback(
            &mut partitions,
            Some(FaultyActuator),
            &FailsafeConfig::default(),
            |_| {},
        );

        assert!(matches!(
            report.shutdown,
            Some(ShutdownOutcome::Failed(ActuatorError::Fault(_)))
        ));
        assert_eq!(report.result, Ok(()));
    }
}
