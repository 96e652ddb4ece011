//! ESP-IDF backends for the hardware seams. Shared by both firmware images.

use core::ffi::c_void;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        delay::{FreeRtos, TickType},
        gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver},
        i2c::{I2cConfig, I2cDriver, I2C0},
        modem::Modem,
        units::Hertz,
    },
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    netif::{EspNetif, NetifConfiguration, NetifStack},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::{self, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use crate::{
    config::IdentityConfig,
    credentials::{KeyValueStore, MacAddress, StoreError, WifiCredentials},
    failsafe::{Actuator, ActuatorError},
    identity::{BusError, Delay, TagStore},
    partition::{FlashError, FlashPartitions, SlotId, ESP_IMAGE_MAGIC},
    wifi::{IpAssignment, WifiError, WifiLink},
};

const NVS_STR_BUFFER: usize = 256;
const I2C_TIMEOUT_MS: u64 = 50;
const I2C_BAUDRATE_HZ: u32 = 100_000;
/// 24C02 page size. Longer writes wrap inside the page.
const EEPROM_PAGE: usize = 8;

/// Station MAC from eFuse.
pub fn station_mac() -> anyhow::Result<MacAddress> {
    let mut mac = [0_u8; 6];
    let rc = unsafe { sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_WIFI_STA) };
    if rc != sys::ESP_OK {
        return Err(anyhow::anyhow!("esp_read_mac failed with code {rc}"));
    }
    Ok(MacAddress::new(mac))
}

pub fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { sys::esp_task_wdt_init(&config) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow::anyhow!("esp_task_wdt_init failed with code {rc}"))
}

pub fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow::anyhow!("esp_task_wdt_add failed with code {rc}"))
}

/// Safe to call from tasks that never subscribed.
pub fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
}

pub fn restart() -> ! {
    unsafe { sys::esp_restart() };
    #[allow(unreachable_code)]
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

pub fn disable_wifi_power_save() {
    let rc = unsafe { sys::esp_wifi_set_ps(0) };
    if rc == sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RtosDelay;

impl Delay for RtosDelay {
    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }
}

#[derive(Clone)]
pub struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn with_namespace<T>(
        &self,
        namespace: &str,
        op: impl FnOnce(&mut EspNvs<NvsDefault>) -> Result<T, EspError>,
    ) -> Result<T, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".into()))?;
        let mut nvs = EspNvs::new(self.partition.clone(), namespace, true).map_err(backend)?;
        op(&mut nvs).map_err(backend)
    }
}

fn backend(err: EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl KeyValueStore for NvsStore {
    fn get_str(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.with_namespace(namespace, |nvs| {
            let mut buffer = vec![0_u8; NVS_STR_BUFFER];
            Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
        })
    }

    fn set_str(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_namespace(namespace, |nvs| nvs.set_str(key, value))
    }

    fn get_u16(&self, namespace: &str, key: &str) -> Result<Option<u16>, StoreError> {
        self.with_namespace(namespace, |nvs| nvs.get_u16(key))
    }

    fn set_u16(&self, namespace: &str, key: &str, value: u16) -> Result<(), StoreError> {
        self.with_namespace(namespace, |nvs| nvs.set_u16(key, value))
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.with_namespace(namespace, |nvs| nvs.remove(key).map(|_| ()))
    }
}

/// Identity EEPROM on I2C0 with its write-protect line.
pub struct EepromTagStore {
    i2c: I2cDriver<'static>,
    write_protect: PinDriver<'static, AnyOutputPin, Output>,
    address: u8,
    write_cycle_ms: u32,
}

impl EepromTagStore {
    pub fn new(i2c: I2C0, config: &IdentityConfig) -> anyhow::Result<Self> {
        let sda = unsafe { AnyIOPin::new(config.sda_pin) };
        let scl = unsafe { AnyIOPin::new(config.scl_pin) };
        let i2c = I2cDriver::new(
            i2c,
            sda,
            scl,
            &I2cConfig::new().baudrate(Hertz(I2C_BAUDRATE_HZ)),
        )?;
        let mut write_protect =
            unsafe { PinDriver::output(AnyOutputPin::new(config.write_protect_pin)) }?;
        write_protect.set_high()?;
        Ok(Self {
            i2c,
            write_protect,
            address: config.i2c_address,
            write_cycle_ms: config.write_cycle_ms,
        })
    }

    fn timeout() -> u32 {
        TickType::from(Duration::from_millis(I2C_TIMEOUT_MS)).into()
    }
}

fn bus_error(err: EspError) -> BusError {
    match err.code() {
        sys::ESP_FAIL => BusError::Nack,
        sys::ESP_ERR_TIMEOUT => BusError::Timeout,
        code => BusError::Driver(code),
    }
}

impl TagStore for EepromTagStore {
    fn probe(&mut self) -> Result<(), BusError> {
        self.i2c
            .write(self.address, &[0], Self::timeout())
            .map_err(bus_error)
    }

    fn read(&mut self, offset: u8, buf: &mut [u8]) -> Result<usize, BusError> {
        self.i2c
            .write_read(self.address, &[offset], buf, Self::timeout())
            .map_err(bus_error)?;
        Ok(buf.len())
    }

    fn write(&mut self, offset: u8, data: &[u8]) -> Result<(), BusError> {
        let mut offset = offset;
        for page in data.chunks(EEPROM_PAGE) {
            let mut frame = Vec::with_capacity(page.len() + 1);
            frame.push(offset);
            frame.extend_from_slice(page);
            self.i2c
                .write(self.address, &frame, Self::timeout())
                .map_err(bus_error)?;
            offset = offset.wrapping_add(page.len() as u8);
            FreeRtos::delay_ms(self.write_cycle_ms);
        }
        Ok(())
    }

    fn set_write_protect(&mut self, protected: bool) -> Result<(), BusError> {
        let result = if protected {
            self.write_protect.set_high()
        } else {
            self.write_protect.set_low()
        };
        result.map_err(|err| BusError::Driver(err.code()))
    }
}

/// Motor enable line. Driving it low lets the mechanism return to its rest
/// position.
pub struct GpioActuator {
    enable: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioActuator {
    pub fn new(pin: i32) -> anyhow::Result<Self> {
        let enable = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }?;
        Ok(Self { enable })
    }
}

impl Actuator for GpioActuator {
    fn drive_home(&mut self) -> Result<(), ActuatorError> {
        self.enable
            .set_low()
            .map_err(|err| ActuatorError::Fault(err.to_string()))
    }
}

/// The two OTA application slots, looked up in the partition table on each
/// call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EspFlash;

fn subtype(slot: SlotId) -> sys::esp_partition_subtype_t {
    match slot {
        SlotId::A => sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
        SlotId::B => sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1,
    }
}

fn slot_of(partition: *const sys::esp_partition_t) -> Option<SlotId> {
    if partition.is_null() {
        return None;
    }
    let found = unsafe { (*partition).subtype };
    [SlotId::A, SlotId::B]
        .into_iter()
        .find(|slot| subtype(*slot) == found)
}

fn check(rc: sys::esp_err_t) -> Result<(), FlashError> {
    if rc == sys::ESP_OK {
        Ok(())
    } else {
        Err(FlashError::Driver(rc))
    }
}

impl EspFlash {
    fn find(slot: SlotId) -> Result<*const sys::esp_partition_t, FlashError> {
        let partition = unsafe {
            sys::esp_partition_find_first(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                subtype(slot),
                core::ptr::null(),
            )
        };
        if partition.is_null() {
            Err(FlashError::PartitionNotFound(slot.label()))
        } else {
            Ok(partition)
        }
    }

    fn bounded(
        slot: SlotId,
        offset: u32,
        len: u32,
    ) -> Result<*const sys::esp_partition_t, FlashError> {
        let partition = Self::find(slot)?;
        let size = unsafe { (*partition).size };
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(FlashError::OutOfRange { offset, len, size });
        }
        Ok(partition)
    }
}

impl FlashPartitions for EspFlash {
    fn running_slot(&self) -> Result<SlotId, FlashError> {
        slot_of(unsafe { sys::esp_ota_get_running_partition() })
            .ok_or(FlashError::NoRunningPartition)
    }

    fn slot_size(&self, slot: SlotId) -> Result<u32, FlashError> {
        let partition = Self::find(slot)?;
        Ok(unsafe { (*partition).size })
    }

    fn erase_range(&mut self, slot: SlotId, offset: u32, len: u32) -> Result<(), FlashError> {
        let partition = Self::bounded(slot, offset, len)?;
        check(unsafe { sys::esp_partition_erase_range(partition, offset as usize, len as usize) })
    }

    fn write(&mut self, slot: SlotId, offset: u32, data: &[u8]) -> Result<usize, FlashError> {
        let len = u32::try_from(data.len()).map_err(|_| FlashError::OutOfRange {
            offset,
            len: u32::MAX,
            size: 0,
        })?;
        let partition = Self::bounded(slot, offset, len)?;
        check(unsafe {
            sys::esp_partition_write(
                partition,
                offset as usize,
                data.as_ptr() as *const c_void,
                data.len(),
            )
        })?;
        Ok(data.len())
    }

    /// Only the image magic is checked here; `esp_ota_set_boot_partition`
    /// validates the full image before accepting it.
    fn verify_image(&mut self, slot: SlotId, len: u32) -> Result<(), FlashError> {
        let partition = Self::find(slot)?;
        let size = unsafe { (*partition).size };
        if len == 0 || len > size {
            return Err(FlashError::InvalidImage(slot.label()));
        }
        let mut magic = [0_u8; 1];
        check(unsafe {
            sys::esp_partition_read(partition, 0, magic.as_mut_ptr() as *mut c_void, magic.len())
        })?;
        if magic[0] != ESP_IMAGE_MAGIC {
            return Err(FlashError::InvalidImage(slot.label()));
        }
        Ok(())
    }

    fn set_boot_slot(&mut self, slot: SlotId) -> Result<(), FlashError> {
        let partition = Self::find(slot)?;
        match unsafe { sys::esp_ota_set_boot_partition(partition) } {
            sys::ESP_OK => Ok(()),
            sys::ESP_ERR_OTA_VALIDATE_FAILED => Err(FlashError::InvalidImage(slot.label())),
            rc => Err(FlashError::Driver(rc)),
        }
    }

    fn boot_slot(&self) -> Result<SlotId, FlashError> {
        slot_of(unsafe { sys::esp_ota_get_boot_partition() })
            .ok_or(FlashError::PartitionNotFound("boot"))
    }

    fn restart(&mut self) -> ! {
        restart()
    }
}

/// Station-mode radio. Each `begin` rebuilds the station netif so the
/// static ladder can move between addresses.
pub struct EspWifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspWifiLink {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        Ok(Self {
            wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
        })
    }

    fn sta_netif(ip: &IpAssignment) -> Result<EspNetif, EspError> {
        match ip {
            IpAssignment::Dhcp => EspNetif::new(NetifStack::Sta),
            IpAssignment::Static {
                ip,
                gateway,
                subnet,
            } => {
                let mask = Mask::try_from(*subnet).unwrap_or(Mask(24));
                EspNetif::new_with_conf(&NetifConfiguration {
                    ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
                        IpClientSettings {
                            ip: *ip,
                            subnet: Subnet {
                                gateway: *gateway,
                                mask,
                            },
                            dns: Some(*gateway),
                            secondary_dns: None,
                        },
                    ))),
                    ..NetifConfiguration::wifi_default_client()
                })
            }
        }
    }
}

fn driver(err: EspError) -> WifiError {
    WifiError::Driver(err.code())
}

impl WifiLink for EspWifiLink {
    fn begin(&mut self, credentials: &WifiCredentials, ip: &IpAssignment) -> Result<(), WifiError> {
        if self.wifi.is_started().unwrap_or(false) {
            self.wifi.stop().map_err(driver)?;
        }
        let netif = Self::sta_netif(ip).map_err(driver)?;
        self.wifi.wifi_mut().swap_netif_sta(netif).map_err(driver)?;

        let auth_method = if credentials.password().is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid()
                    .try_into()
                    .map_err(|_| WifiError::Config("ssid too long".into()))?,
                password: credentials
                    .password()
                    .try_into()
                    .map_err(|_| WifiError::Config("password too long".into()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(driver)?;
        self.wifi.start().map_err(driver)?;
        // Association continues in the background; the caller polls.
        self.wifi.wifi_mut().connect().map_err(driver)
    }

    fn is_connected(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.wifi_mut().disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        let info = self.wifi.wifi().sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }
}
