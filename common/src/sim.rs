//! In-memory and file-backed stand-ins for the hardware seams. The host
//! binaries run on these, and so do the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::credentials::{KeyValueStore, StoreError};
use crate::credentials::WifiCredentials;
use crate::failsafe::{Actuator, ActuatorError};
use crate::identity::{BusError, Delay, TagStore};
use crate::partition::{FlashError, FlashPartitions, SlotId, ESP_IMAGE_MAGIC};
use crate::sensor::{
    Sensor, SensorError, SensorKind, SensorSettings, Temperature, MAX_RESOLUTION_BITS,
    MIN_RESOLUTION_BITS,
};
use crate::wifi::{IpAssignment, WifiError, WifiLink};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    U16(u16),
    Str(String),
}

fn lock_err<T>(_: T) -> StoreError {
    StoreError::Backend("store lock poisoned".to_string())
}

/// Shared in-memory key/value store. Clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<(String, String), StoredValue>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let entries = self.entries.lock().map_err(lock_err)?;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(lock_err)?;
        entries.insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_str(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::Str(value)) => Ok(Some(value)),
            Some(StoredValue::U16(value)) => Ok(Some(value.to_string())),
            None => Ok(None),
        }
    }

    fn set_str(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(namespace, key, StoredValue::Str(value.to_string()))
    }

    fn get_u16(&self, namespace: &str, key: &str) -> Result<Option<u16>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::U16(value)) => Ok(Some(value)),
            Some(StoredValue::Str(raw)) => raw.parse().map(Some).map_err(|_| {
                StoreError::Backend(format!("{namespace}.{key} is not a u16"))
            }),
            None => Ok(None),
        }
    }

    fn set_u16(&self, namespace: &str, key: &str, value: u16) -> Result<(), StoreError> {
        self.put(namespace, key, StoredValue::U16(value))
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(lock_err)?;
        entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

type FileEntries = BTreeMap<String, BTreeMap<String, StoredValue>>;

/// Key/value store persisted as one JSON document, rewritten on every
/// mutation.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    entries: Arc<Mutex<FileEntries>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|err| StoreError::Backend(format!("{}: {err}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileEntries::new(),
            Err(err) => return Err(StoreError::Backend(format!("{}: {err}", path.display()))),
        };
        Ok(Self {
            path,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    fn persist(&self, entries: &FileEntries) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let raw = serde_json::to_vec_pretty(entries)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        fs::write(&self.path, raw).map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let entries = self.entries.lock().map_err(lock_err)?;
        Ok(entries
            .get(namespace)
            .and_then(|values| values.get(key))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(lock_err)?;
        entries
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.persist(&entries)
    }
}

impl KeyValueStore for FileStore {
    fn get_str(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::Str(value)) => Ok(Some(value)),
            Some(StoredValue::U16(value)) => Ok(Some(value.to_string())),
            None => Ok(None),
        }
    }

    fn set_str(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(namespace, key, StoredValue::Str(value.to_string()))
    }

    fn get_u16(&self, namespace: &str, key: &str) -> Result<Option<u16>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::U16(value)) => Ok(Some(value)),
            Some(StoredValue::Str(raw)) => raw.parse().map(Some).map_err(|_| {
                StoreError::Backend(format!("{namespace}.{key} is not a u16"))
            }),
            None => Ok(None),
        }
    }

    fn set_u16(&self, namespace: &str, key: &str, value: u16) -> Result<(), StoreError> {
        self.put(namespace, key, StoredValue::U16(value))
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(lock_err)?;
        let removed = entries
            .get_mut(namespace)
            .and_then(|values| values.remove(key))
            .is_some();
        if removed {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    Erase { slot: SlotId, offset: u32, len: u32 },
    Write { slot: SlotId, offset: u32, len: usize },
    Verify { slot: SlotId, len: u32 },
    SetBoot(SlotId),
}

#[derive(Debug, Serialize, Deserialize)]
struct OtaData {
    boot: SlotId,
}

/// Two application slots held in memory. With a backing directory the boot
/// selection and the slot images survive a simulated restart.
#[derive(Debug)]
pub struct SimFlash {
    running: SlotId,
    boot: SlotId,
    slot_size: u32,
    slots: [Vec<u8>; 2],
    backing: Option<PathBuf>,
    pub ops: Vec<FlashOp>,
    pub fail_erase_at: Option<u32>,
    /// Caps how many bytes a single write accepts.
    pub write_limit: Option<usize>,
}

fn slot_index(slot: SlotId) -> usize {
    match slot {
        SlotId::A => 0,
        SlotId::B => 1,
    }
}

impl SimFlash {
    pub fn new(running: SlotId, slot_size: u32) -> Self {
        Self {
            running,
            boot: running,
            slot_size,
            slots: [
                vec![0xFF; slot_size as usize],
                vec![0xFF; slot_size as usize],
            ],
            backing: None,
            ops: Vec::new(),
            fail_erase_at: None,
            write_limit: None,
        }
    }

    /// Loads the flash state kept under `dir`. The slot selected for boot
    /// becomes the running slot, as after a real reset.
    pub fn open(dir: impl AsRef<Path>, slot_size: u32) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let boot = fs::read(dir.join("otadata.json"))
            .ok()
            .and_then(|raw| serde_json::from_slice::<OtaData>(&raw).ok())
            .map_or(SlotId::A, |data| data.boot);

        let mut flash = Self::new(boot, slot_size);
        for slot in [SlotId::A, SlotId::B] {
            if let Ok(image) = fs::read(dir.join(format!("{}.bin", slot.label()))) {
                let len = image.len().min(slot_size as usize);
                flash.slots[slot_index(slot)][..len].copy_from_slice(&image[..len]);
            }
        }
        info!("simulated flash loaded, running {}", boot.label());
        flash.backing = Some(dir);
        flash
    }

    /// Behaves as if the device had just been reset into `slot`.
    pub fn boot_into(&mut self, slot: SlotId) {
        self.running = slot;
        self.boot = slot;
    }

    pub fn image(&self, slot: SlotId) -> &[u8] {
        &self.slots[slot_index(slot)]
    }

    fn check_range(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.slot_size => Ok(()),
            _ => Err(FlashError::OutOfRange {
                offset,
                len,
                size: self.slot_size,
            }),
        }
    }

    fn persist(&self) -> std::io::Result<()> {
        let Some(dir) = &self.backing else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let otadata = serde_json::to_vec(&OtaData { boot: self.boot })?;
        fs::write(dir.join("otadata.json"), otadata)?;
        for slot in [SlotId::A, SlotId::B] {
            let image = &self.slots[slot_index(slot)];
            let used = image
                .iter()
                .rposition(|byte| *byte != 0xFF)
                .map_or(0, |last| last + 1);
            fs::write(dir.join(format!("{}.bin", slot.label())), &image[..used])?;
        }
        Ok(())
    }
}

impl FlashPartitions for SimFlash {
    fn running_slot(&self) -> Result<SlotId, FlashError> {
        Ok(self.running)
    }

    fn slot_size(&self, _slot: SlotId) -> Result<u32, FlashError> {
        Ok(self.slot_size)
    }

    fn erase_range(&mut self, slot: SlotId, offset: u32, len: u32) -> Result<(), FlashError> {
        self.check_range(offset, len)?;
        if self.fail_erase_at == Some(offset) {
            return Err(FlashError::Driver(-1));
        }
        self.ops.push(FlashOp::Erase { slot, offset, len });
        self.slots[slot_index(slot)][offset as usize..(offset + len) as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, slot: SlotId, offset: u32, data: &[u8]) -> Result<usize, FlashError> {
        let accepted = self.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        let len = u32::try_from(accepted).map_err(|_| FlashError::OutOfRange {
            offset,
            len: u32::MAX,
            size: self.slot_size,
        })?;
        self.check_range(offset, len)?;
        self.ops.push(FlashOp::Write {
            slot,
            offset,
            len: accepted,
        });
        let start = offset as usize;
        self.slots[slot_index(slot)][start..start + accepted].copy_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn verify_image(&mut self, slot: SlotId, len: u32) -> Result<(), FlashError> {
        self.ops.push(FlashOp::Verify { slot, len });
        if len == 0 || len > self.slot_size || self.slots[slot_index(slot)][0] != ESP_IMAGE_MAGIC {
            return Err(FlashError::InvalidImage(slot.label()));
        }
        Ok(())
    }

    fn set_boot_slot(&mut self, slot: SlotId) -> Result<(), FlashError> {
        self.ops.push(FlashOp::SetBoot(slot));
        self.boot = slot;
        Ok(())
    }

    fn boot_slot(&self) -> Result<SlotId, FlashError> {
        Ok(self.boot)
    }

    fn restart(&mut self) -> ! {
        if let Err(err) = self.persist() {
            warn!("failed to persist simulated flash: {err}");
        }
        info!("simulated restart into {}", self.boot.label());
        std::process::exit(0)
    }
}

/// 256-byte EEPROM with a write-protect line. While protected, writes are
/// acknowledged and dropped like on the real part.
#[derive(Debug)]
pub struct SimEeprom {
    pub data: [u8; 256],
    pub present: bool,
    pub write_protected: bool,
    pub probes: u32,
    pub reads: u32,
    /// Number of upcoming reads that deliver a single byte.
    pub short_reads: u32,
    pub fail_writes: bool,
    pub write_protect_log: Vec<bool>,
    backing: Option<PathBuf>,
}

impl Default for SimEeprom {
    fn default() -> Self {
        Self {
            data: [0xFF; 256],
            present: true,
            write_protected: true,
            probes: 0,
            reads: 0,
            short_reads: 0,
            fail_writes: false,
            write_protect_log: Vec::new(),
            backing: None,
        }
    }
}

impl SimEeprom {
    pub fn with_tag(tag: &[u8]) -> Self {
        let mut eeprom = Self::default();
        let len = tag.len().min(eeprom.data.len());
        eeprom.data[..len].copy_from_slice(&tag[..len]);
        eeprom
    }

    pub fn unplugged() -> Self {
        Self {
            present: false,
            ..Self::default()
        }
    }

    /// EEPROM mirrored by a file. A missing file reads as an unplugged
    /// sensor head, so deleting it simulates pulling the sensor.
    pub fn backed_by(path: impl Into<PathBuf>) -> Self {
        Self {
            backing: Some(path.into()),
            ..Self::default()
        }
    }

    fn refresh(&mut self) {
        let Some(path) = &self.backing else {
            return;
        };
        match fs::read(path) {
            Ok(raw) => {
                self.present = true;
                self.data = [0xFF; 256];
                let len = raw.len().min(self.data.len());
                self.data[..len].copy_from_slice(&raw[..len]);
            }
            Err(_) => self.present = false,
        }
    }
}

impl TagStore for SimEeprom {
    fn probe(&mut self) -> Result<(), BusError> {
        self.refresh();
        self.probes += 1;
        if self.present {
            Ok(())
        } else {
            Err(BusError::Nack)
        }
    }

    fn read(&mut self, offset: u8, buf: &mut [u8]) -> Result<usize, BusError> {
        self.reads += 1;
        if !self.present {
            return Err(BusError::Nack);
        }
        let start = usize::from(offset);
        let available = self.data.len() - start;
        let mut len = buf.len().min(available);
        if self.short_reads > 0 {
            self.short_reads -= 1;
            len = len.min(1);
        }
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(len)
    }

    fn write(&mut self, offset: u8, data: &[u8]) -> Result<(), BusError> {
        if !self.present || self.fail_writes {
            return Err(BusError::Nack);
        }
        if self.write_protected {
            return Ok(());
        }
        let start = usize::from(offset);
        let len = data.len().min(self.data.len() - start);
        self.data[start..start + len].copy_from_slice(&data[..len]);
        if let Some(path) = &self.backing {
            let used = self
                .data
                .iter()
                .rposition(|byte| *byte != 0xFF)
                .map_or(0, |last| last + 1);
            fs::write(path, &self.data[..used]).map_err(|_| BusError::Driver(-1))?;
        }
        Ok(())
    }

    fn set_write_protect(&mut self, protected: bool) -> Result<(), BusError> {
        self.write_protect_log.push(protected);
        self.write_protected = protected;
        Ok(())
    }
}

/// Records requested waits without sleeping.
#[derive(Debug, Default)]
pub struct RecordingDelay {
    pub calls: Vec<u32>,
}

impl RecordingDelay {
    pub fn total_ms(&self) -> u64 {
        self.calls.iter().map(|ms| u64::from(*ms)).sum()
    }
}

impl Delay for RecordingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.calls.push(ms);
    }
}

/// Sleeps on the host clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

/// Output pin standing in for a motor enable line. Clones share the count.
#[derive(Debug, Clone, Default)]
pub struct SimActuator {
    homed: Arc<AtomicU32>,
}

impl SimActuator {
    pub fn homed(&self) -> u32 {
        self.homed.load(Ordering::SeqCst)
    }
}

impl Actuator for SimActuator {
    fn drive_home(&mut self) -> Result<(), ActuatorError> {
        info!("actuator enable driven low");
        self.homed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Access point that accepts one static address and/or DHCP. An accepted
/// association reports connected after `polls_to_connect` failed polls.
#[derive(Debug)]
pub struct SimWifi {
    pub static_ok: Option<Ipv4Addr>,
    pub dhcp_ok: bool,
    pub dhcp_address: Ipv4Addr,
    pub polls_to_connect: u32,
    pub begins: Vec<IpAssignment>,
    current: Option<IpAssignment>,
    accepted: bool,
    polls: u32,
    connected: bool,
}

impl Default for SimWifi {
    fn default() -> Self {
        Self {
            static_ok: None,
            dhcp_ok: false,
            dhcp_address: Ipv4Addr::new(192, 168, 137, 100),
            polls_to_connect: 2,
            begins: Vec::new(),
            current: None,
            accepted: false,
            polls: 0,
            connected: false,
        }
    }
}

impl WifiLink for SimWifi {
    fn begin(&mut self, credentials: &WifiCredentials, ip: &IpAssignment) -> Result<(), WifiError> {
        if credentials.ssid().is_empty() {
            return Err(WifiError::Config("empty ssid".to_string()));
        }
        self.begins.push(*ip);
        self.current = Some(*ip);
        self.accepted = match ip {
            IpAssignment::Static { ip, .. } => self.static_ok == Some(*ip),
            IpAssignment::Dhcp => self.dhcp_ok,
        };
        self.polls = 0;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        if !self.accepted {
            return false;
        }
        if self.polls >= self.polls_to_connect {
            self.connected = true;
            return true;
        }
        self.polls += 1;
        false
    }

    fn disconnect(&mut self) {
        self.current = None;
        self.accepted = false;
        self.connected = false;
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        if !self.connected {
            return None;
        }
        match self.current? {
            IpAssignment::Static { ip, .. } => Some(ip),
            IpAssignment::Dhcp => Some(self.dhcp_address),
        }
    }
}

/// DS18B20 stand-in: a slow triangle wave around `base_celsius`, quantised
/// to the configured resolution.
#[derive(Debug, Clone)]
pub struct SimThermometer {
    pub base_celsius: f32,
    pub connected: bool,
    resolution_bits: u8,
    step: u32,
}

impl SimThermometer {
    pub fn new(base_celsius: f32) -> Self {
        Self {
            base_celsius,
            connected: true,
            resolution_bits: 10,
            step: 0,
        }
    }

    pub fn resolution_bits(&self) -> u8 {
        self.resolution_bits
    }
}

impl Sensor for SimThermometer {
    type Reading = Temperature;

    fn kind(&self) -> SensorKind {
        SensorKind::Thr
    }

    fn read(&mut self) -> Result<Temperature, SensorError> {
        if !self.connected {
            return Err(SensorError::Disconnected);
        }
        self.step = self.step.wrapping_add(1);
        let phase = (self.step % 40) as f32;
        let offset = (if phase < 20.0 { phase } else { 40.0 - phase }) * 0.05;
        let lsb = 1.0 / f32::from(1_u16 << (self.resolution_bits - 8));
        let celsius = ((self.base_celsius + offset) / lsb).round() * lsb;
        Ok(Temperature { celsius })
    }

    fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError> {
        if let Some(bits) = settings.resolution {
            if !(MIN_RESOLUTION_BITS..=MAX_RESOLUTION_BITS).contains(&bits) {
                return Err(SensorError::InvalidSetting(format!("resolution {bits}")));
            }
            self.resolution_bits = bits;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn thermometer_quantises_to_resolution() {
        let mut thermometer = SimThermometer::new(21.3);
        thermometer
            .configure(&SensorSettings {
                resolution: Some(9),
                duration: None,
            })
            .unwrap();

        let reading = thermometer.read().unwrap();
        assert_eq!((reading.celsius * 2.0).fract(), 0.0);

        thermometer.connected = false;
        assert_eq!(thermometer.read(), Err(SensorError::Disconnected));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("labexpert-store-{}", std::process::id()));
        let path = dir.join("nvs.json");
        let _ = fs::remove_file(&path);

        let store = FileStore::open(&path).unwrap();
        store.set_str("mqtt", "broker", "192.168.137.1").unwrap();
        store.set_u16("mqtt", "port", 1883).unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_str("mqtt", "broker").unwrap().as_deref(),
            Some("192.168.137.1")
        );
        assert_eq!(reopened.get_u16("mqtt", "port").unwrap(), Some(1883));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn write_protected_eeprom_drops_writes() {
        let mut eeprom = SimEeprom::with_tag(b"TOF");

        eeprom.write(0, b"ULT").unwrap();

        assert_eq!(&eeprom.data[..3], b"TOF");
    }
}
