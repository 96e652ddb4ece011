use core::fmt;

use log::{info, warn};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::IdentityConfig;

pub const TAG_LEN: usize = 3;
pub const TAG_OFFSET: u8 = 0;

/// Three raw bytes read from offset 0 of the sensor head EEPROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityTag([u8; TAG_LEN]);

impl IdentityTag {
    /// Returns `None` for blank content: any NUL byte, erased cells or
    /// whitespace only.
    pub fn from_raw(raw: [u8; TAG_LEN]) -> Option<Self> {
        if raw.contains(&0)
            || raw.iter().all(|byte| *byte == 0xFF)
            || raw.iter().all(|byte| byte.is_ascii_whitespace())
        {
            return None;
        }
        Some(Self(raw))
    }

    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        let bytes = value.as_bytes();
        if bytes.len() != TAG_LEN || !bytes.iter().all(u8::is_ascii_graphic) {
            return Err(IdentityError::InvalidTag(value.to_string()));
        }
        let mut raw = [0_u8; TAG_LEN];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }

    pub fn matches(&self, code: &str) -> bool {
        self.0.as_slice() == code.as_bytes()
    }
}

impl fmt::Display for IdentityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl Serialize for IdentityTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityResult {
    Present(IdentityTag),
    Absent,
}

impl IdentityResult {
    pub fn tag(&self) -> Option<IdentityTag> {
        match self {
            Self::Present(tag) => Some(*tag),
            Self::Absent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("device did not acknowledge")]
    Nack,
    #[error("bus timeout")]
    Timeout,
    #[error("bus driver error {0}")]
    Driver(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid identity tag {0:?}: expected {TAG_LEN} printable ASCII characters")]
    InvalidTag(String),
    #[error("write-protect control failed: {0}")]
    WriteProtect(#[source] BusError),
    #[error("tag write failed: {0}")]
    Write(#[source] BusError),
    #[error("tag readback mismatch: wrote {expected}, read {found:?}")]
    Verify {
        expected: IdentityTag,
        found: IdentityResult,
    },
}

/// Byte-addressable store holding the identity tag (an I2C EEPROM on
/// hardware).
pub trait TagStore {
    /// Opens a transaction with the device. An error is a bus-level NACK.
    fn probe(&mut self) -> Result<(), BusError>;
    /// Returns how many bytes were actually delivered.
    fn read(&mut self, offset: u8, buf: &mut [u8]) -> Result<usize, BusError>;
    fn write(&mut self, offset: u8, data: &[u8]) -> Result<(), BusError>;
    /// `true` drives the write-protect line high.
    fn set_write_protect(&mut self, protected: bool) -> Result<(), BusError>;
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u32);
}

impl<T: TagStore + ?Sized> TagStore for &mut T {
    fn probe(&mut self) -> Result<(), BusError> {
        (**self).probe()
    }

    fn read(&mut self, offset: u8, buf: &mut [u8]) -> Result<usize, BusError> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: u8, data: &[u8]) -> Result<(), BusError> {
        (**self).write(offset, data)
    }

    fn set_write_protect(&mut self, protected: bool) -> Result<(), BusError> {
        (**self).set_write_protect(protected)
    }
}

impl<T: Delay + ?Sized> Delay for &mut T {
    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

pub struct IdentityGate<S, D> {
    store: S,
    delay: D,
    retries: u8,
    retry_delay_ms: u32,
    write_cycle_ms: u32,
}

impl<S: TagStore, D: Delay> IdentityGate<S, D> {
    pub fn new(store: S, delay: D, config: &IdentityConfig) -> Self {
        Self {
            store,
            delay,
            retries: config.retries.max(1),
            retry_delay_ms: config.retry_delay_ms,
            write_cycle_ms: config.write_cycle_ms,
        }
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Sleeps on the gate's own delay source.
    pub fn pause(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Reads the tag with bounded retries. A failed probe means the head is
    /// unplugged and ends detection at once; short or failed reads are
    /// retried.
    pub fn detect(&mut self) -> IdentityResult {
        for attempt in 1..=self.retries {
            if let Err(err) = self.store.probe() {
                warn!("identity store not responding ({err}); treating sensor as absent");
                return IdentityResult::Absent;
            }

            let mut raw = [0_u8; TAG_LEN];
            match self.store.read(TAG_OFFSET, &mut raw) {
                Ok(read) if read >= TAG_LEN => {
                    return match IdentityTag::from_raw(raw) {
                        Some(tag) => {
                            info!("identity tag read: {tag}");
                            IdentityResult::Present(tag)
                        }
                        None => {
                            warn!("identity tag is blank");
                            IdentityResult::Absent
                        }
                    };
                }
                Ok(read) => warn!(
                    "short identity read {read}/{TAG_LEN} bytes (attempt {attempt}/{})",
                    self.retries
                ),
                Err(err) => warn!(
                    "identity read failed: {err} (attempt {attempt}/{})",
                    self.retries
                ),
            }

            if attempt < self.retries {
                self.delay.delay_ms(self.retry_delay_ms);
            }
        }

        warn!("identity detection gave up after {} attempts", self.retries);
        IdentityResult::Absent
    }

    /// Re-images the tag with write protection lifted for the duration of
    /// the write, then confirms it by reading it back.
    pub fn repair(&mut self, tag: IdentityTag) -> Result<IdentityTag, IdentityError> {
        self.store
            .set_write_protect(false)
            .map_err(IdentityError::WriteProtect)?;

        let written = self.store.write(TAG_OFFSET, tag.as_bytes());
        if written.is_ok() {
            self.delay.delay_ms(self.write_cycle_ms);
        }
        let relocked = self.store.set_write_protect(true);

        written.map_err(IdentityError::Write)?;
        relocked.map_err(IdentityError::WriteProtect)?;

        match self.detect() {
            IdentityResult::Present(found) if found == tag => {
                info!("identity tag repaired to {tag}");
                Ok(tag)
            }
            found => Err(IdentityError::Verify {
                expected: tag,
                found,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingDelay, SimEeprom};
    use pretty_assertions::assert_eq;

    fn config() -> IdentityConfig {
        IdentityConfig::default()
    }

    #[test]
    fn recognised_tag_is_present() {
        let mut eeprom = SimEeprom::with_tag(b"TOF");
        let mut delay = RecordingDelay::default();

        let result = IdentityGate::new(&mut eeprom, &mut delay, &config()).detect();

        assert_eq!(result, IdentityResult::Present(IdentityTag::parse("TOF").unwrap()));
        assert!(result.tag().unwrap().matches("TOF"));
        assert!(delay.calls.is_empty());
    }

    #[test]
    fn probe_failure_returns_absent_after_one_attempt() {
        let mut eeprom = SimEeprom::unplugged();
        let mut delay = RecordingDelay::default();

        let result = IdentityGate::new(&mut eeprom, &mut delay, &config()).detect();

        assert_eq!(result, IdentityResult::Absent);
        assert_eq!(eeprom.probes, 1);
        assert_eq!(eeprom.reads, 0);
        assert!(delay.calls.is_empty());
    }

    #[test]
    fn short_reads_exhaust_retries() {
        let mut eeprom = SimEeprom::with_tag(b"TOF");
        eeprom.short_reads = 3;
        let mut delay = RecordingDelay::default();

        let result = IdentityGate::new(&mut eeprom, &mut delay, &config()).detect();

        assert_eq!(result, IdentityResult::Absent);
        assert_eq!(eeprom.reads, 3);
        assert_eq!(delay.calls, vec![1_000, 1_000]);
    }

    #[test]
    fn transient_short_read_recovers() {
        let mut eeprom = SimEeprom::with_tag(b"ULT");
        eeprom.short_reads = 1;
        let mut delay = RecordingDelay::default();

        let result = IdentityGate::new(&mut eeprom, &mut delay, &config()).detect();

        assert_eq!(result, IdentityResult::Present(IdentityTag::parse("ULT").unwrap()));
        assert_eq!(eeprom.reads, 2);
    }

    #[test]
    fn blank_tags_are_absent() {
        for raw in [
            [0, 0, 0],
            [0xFF, 0xFF, 0xFF],
            *b"   ",
            [0, b'O', b'F'],
            [b'T', 0, 0],
            [b'T', b'H', 0],
            [b'T', 0, b'R'],
        ] {
            assert_eq!(IdentityTag::from_raw(raw), None, "{raw:?}");
        }
        assert!(IdentityTag::from_raw(*b"XYZ").is_some());
    }

    #[test]
    fn unknown_tag_is_still_present() {
        let mut eeprom = SimEeprom::with_tag(&[b'Q', 0x81, b'Z']);
        let mut delay = RecordingDelay::default();

        let result = IdentityGate::new(&mut eeprom, &mut delay, &config()).detect();

        let tag = result.tag().unwrap();
        assert_eq!(tag.to_string(), "Q\\x81Z");
    }

    #[test]
    fn repair_toggles_write_protect_around_write() {
        let mut eeprom = SimEeprom::with_tag(&[0xFF; 3]);
        let mut delay = RecordingDelay::default();
        let tag = IdentityTag::parse("OSI").unwrap();

        let repaired = IdentityGate::new(&mut eeprom, &mut delay, &config())
            .repair(tag)
            .unwrap();

        assert_eq!(repaired, tag);
        assert_eq!(eeprom.write_protect_log, vec![false, true]);
        assert!(eeprom.write_protected);
        assert_eq!(&eeprom.data[..3], b"OSI");
        assert_eq!(delay.calls, vec![10]);
    }

    #[test]
    fn repair_relocks_after_failed_write() {
        let mut eeprom = SimEeprom::with_tag(b"TOF");
        eeprom.fail_writes = true;
        let mut delay = RecordingDelay::default();

        let err = IdentityGate::new(&mut eeprom, &mut delay, &config())
            .repair(IdentityTag::parse("THR").unwrap())
            .unwrap_err();

        assert_eq!(err, IdentityError::Write(BusError::Nack));
        assert!(eeprom.write_protected);
        assert_eq!(&eeprom.data[..3], b"TOF");
    }

    #[test]
    fn parse_rejects_wrong_length_and_spaces() {
        assert!(IdentityTag::parse("TO").is_err());
        assert!(IdentityTag::parse("TOFU").is_err());
        assert!(IdentityTag::parse("T F").is_err());
        assert!(IdentityTag::parse("THR").is_ok());
    }
}
