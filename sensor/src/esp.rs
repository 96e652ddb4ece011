use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::mqtt::client::{EventPayload, QoS};
use esp_idf_hal::{
    delay::{Ets, FreeRtos},
    gpio::{AnyIOPin, AnyInputPin, IOPin, Input, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    timer::{EspTaskTimerService, EspTimer},
};
use log::{error, info, warn};
use one_wire_bus::{Address, OneWire};

use labexpert_common::{
    application::WIFI_JOIN_TIMEOUT_MS,
    esp::{
        add_current_task_to_watchdog, disable_wifi_power_save, feed_watchdog, init_watchdog,
        station_mac, EepromTagStore, EspFlash, EspWifiLink, GpioActuator, NvsStore, RtosDelay,
    },
    sampling::{sample_channel, SampleWaiter},
    sensor::SensorError,
    AppInput, AppOutput, BrokerStore, ConnectStrategy, DeviceConfig, Failsafe, FailsafeAction,
    IdentityGate, PartitionManager, Sensor, SensorKind, SensorSettings, TagPolicy, Temperature,
    ThermometerApp, WifiCredentialStore,
};

type EspApp = ThermometerApp<Ds18b20Probe, EspFlash, EepromTagStore, RtosDelay>;
type Bus = OneWire<PinDriver<'static, AnyIOPin, InputOutput>>;

const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const ONE_WIRE_GPIO: u8 = 23;
const MQTT_RECONNECT: Duration = Duration::from_secs(5);
const IDLE_WAIT: Duration = Duration::from_millis(50);
// alarm thresholds are unused; these are the power-on values
const ALARM_LOW: i8 = -55;
const ALARM_HIGH: i8 = 125;

/// The DS18B20 on the sensor head, first one found on the bus.
struct Ds18b20Probe {
    bus: Bus,
    address: Option<Address>,
    resolution: Resolution,
    delay: Ets,
}

impl Ds18b20Probe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut line = PinDriver::input_output_od(pin)?;
        line.set_pull(Pull::Up)?;
        line.set_high()?;
        let bus = OneWire::new(line)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            bus,
            address: None,
            resolution: Resolution::Bits10,
            delay: Ets,
        };
        probe.scan();
        Ok(probe)
    }

    fn scan(&mut self) {
        let mut found = 0_u32;
        self.address = None;
        for address in self.bus.devices(false, &mut self.delay) {
            match address {
                Ok(address) => {
                    found = found.saturating_add(1);
                    if self.address.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        self.address = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire scan failed: {err:?}");
                    break;
                }
            }
        }
        match self.address {
            Some(address) => info!("DS18B20 {address:?} on GPIO{ONE_WIRE_GPIO} ({found} device(s))"),
            None => warn!("no DS18B20 on GPIO{ONE_WIRE_GPIO} ({found} device(s))"),
        }
    }

    fn device(&mut self) -> Result<Ds18b20, SensorError> {
        if self.address.is_none() {
            self.scan();
        }
        let address = self.address.ok_or(SensorError::NotFound)?;
        Ds18b20::new::<core::convert::Infallible>(address).map_err(|err| {
            self.address = None;
            SensorError::Bus(format!("{err:?}"))
        })
    }

    fn lost(&mut self, what: &str, err: impl core::fmt::Debug) -> SensorError {
        warn!("DS18B20 {what} failed: {err:?}");
        self.address = None;
        SensorError::Disconnected
    }
}

fn resolution_from_bits(bits: u8) -> Option<Resolution> {
    match bits {
        9 => Some(Resolution::Bits9),
        10 => Some(Resolution::Bits10),
        11 => Some(Resolution::Bits11),
        12 => Some(Resolution::Bits12),
        _ => None,
    }
}

impl Sensor for Ds18b20Probe {
    type Reading = Temperature;

    fn kind(&self) -> SensorKind {
        SensorKind::Thr
    }

    fn read(&mut self) -> Result<Temperature, SensorError> {
        let device = self.device()?;
        if let Err(err) = ds18b20::start_simultaneous_temp_measurement(&mut self.bus, &mut self.delay)
        {
            return Err(self.lost("conversion start", err));
        }
        self.resolution.delay_for_measurement_time(&mut FreeRtos);
        match device.read_data(&mut self.bus, &mut self.delay) {
            Ok(data) => Ok(Temperature {
                celsius: data.temperature,
            }),
            Err(err) => Err(self.lost("scratchpad read", err)),
        }
    }

    fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError> {
        let Some(bits) = settings.resolution else {
            return Ok(());
        };
        let resolution = resolution_from_bits(bits)
            .ok_or_else(|| SensorError::InvalidSetting(format!("resolution {bits}")))?;
        self.resolution = resolution;

        // applied again after the next successful scan otherwise
        let Ok(device) = self.device() else {
            return Ok(());
        };
        device
            .set_config(ALARM_LOW, ALARM_HIGH, resolution, &mut self.bus, &mut self.delay)
            .map_err(|err| self.lost("config write", err))?;
        info!("DS18B20 resolution set to {bits} bits");
        Ok(())
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore::new(nvs_partition.clone());

    let mut config = DeviceConfig::default();
    config.sanitize();

    let Peripherals {
        modem, i2c0, pins, ..
    } = Peripherals::take()?;
    let mac = station_mac()?;

    let gate = IdentityGate::new(
        EepromTagStore::new(i2c0, &config.identity).context("identity eeprom init failed")?,
        RtosDelay,
        &config.identity,
    );
    let failsafe = Failsafe::new(gate, TagPolicy::OneOf(vec!["THR"]), &config.failsafe);
    let probe =
        Ds18b20Probe::new(pins.gpio23.downgrade()).context("failed to initialize DS18B20")?;
    let mut app = ThermometerApp::new(
        mac.device_id(),
        probe,
        failsafe,
        PartitionManager::new(EspFlash),
        &config,
    );
    app.set_chunk_hook(|_| feed_watchdog());
    if let Some(pin) = config.failsafe.actuator_pin() {
        app.set_actuator(GpioActuator::new(pin).context("actuator pin init failed")?);
    }
    info!("thermometer {} starting", app.sensor_id());

    match app.boot(monotonic_ms()) {
        Ok(FailsafeAction::Continue) => {}
        Ok(action) => {
            warn!("boot decision {action:?}, leaving the application");
            app.fall_back()
        }
        Err(err) => {
            error!("cannot identify the running partition: {err}");
            app.restart()
        }
    }

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let Some(credentials) = WifiCredentialStore::new(store.clone()).load() else {
        warn!("no wifi credentials stored");
        app.fall_back()
    };
    let Some(broker) = BrokerStore::new(store).load() else {
        warn!("no mqtt broker assigned");
        app.fall_back()
    };

    let mut link = EspWifiLink::new(modem, sys_loop, nvs_partition)?;
    let strategy = ConnectStrategy::from_config(&config.network);
    if !strategy.probe_dhcp(&mut link, &mut RtosDelay, &credentials, WIFI_JOIN_TIMEOUT_MS) {
        warn!("wifi join to `{}` failed", credentials.ssid());
        app.fall_back()
    }
    disable_wifi_power_save();

    let client_id = format!("ESP32_{}", app.sensor_id());
    let url = format!("mqtt://{}:{}", broker.broker_host, broker.port);
    let conf = MqttClientConfiguration {
        client_id: Some(&client_id),
        reconnect_timeout: Some(MQTT_RECONNECT),
        ..Default::default()
    };
    let (mqtt, connection) = EspMqttClient::new(&url, &conf)?;
    info!("mqtt broker {url}");

    let (inputs, inbox) = mpsc::channel();
    spawn_mqtt_poll(connection, inputs)?;

    let (trigger, waiter) = sample_channel();
    let timers = EspTaskTimerService::new()?;
    let timer = timers.timer(move || trigger.fire(monotonic_us()))?;
    let restart_trigger = restart_trigger_pin(config.failsafe.restart_trigger_pin)?;

    run_app(app, mqtt, inbox, waiter, timer, restart_trigger)
}

fn restart_trigger_pin(pin: i32) -> anyhow::Result<PinDriver<'static, AnyInputPin, Input>> {
    // SAFETY: the pin number comes from config and is not claimed elsewhere
    let mut driver = unsafe { PinDriver::input(AnyInputPin::new(pin)) }?;
    driver.set_pull(Pull::Up)?;
    Ok(driver)
}

fn spawn_mqtt_poll(
    mut connection: EspMqttConnection,
    inputs: Sender<AppInput>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || {
            while let Ok(event) = connection.next() {
                let input = match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        AppInput::Connected
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        ..
                    } => AppInput::Message {
                        topic: topic.to_string(),
                        payload: data.to_vec(),
                    },
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected, retrying in {}s", MQTT_RECONNECT.as_secs());
                        continue;
                    }
                    _ => continue,
                };
                if inputs.send(input).is_err() {
                    break;
                }
            }
            warn!("mqtt connection closed");
        })
        .context("failed to spawn mqtt thread")?;
    Ok(())
}

/// Main-task loop: the only owner of the application state.
fn run_app(
    mut app: EspApp,
    mut mqtt: EspMqttClient<'static>,
    inbox: Receiver<AppInput>,
    waiter: SampleWaiter,
    timer: EspTimer<'static>,
    restart_trigger: PinDriver<'static, AnyInputPin, Input>,
) -> anyhow::Result<()> {
    let mut period_ms = app.sample_period_ms();
    timer.every(Duration::from_millis(period_ms.into()))?;
    let subscriptions = [
        labexpert_common::command_topic(app.sensor_id()),
        labexpert_common::config_topic(app.sensor_id()),
    ];

    loop {
        feed_watchdog();
        let mut outputs = Vec::new();
        if waiter.wait(IDLE_WAIT).is_some() {
            outputs.extend(app.sample(monotonic_ms));
        }

        while let Ok(input) = inbox.try_recv() {
            if input == AppInput::Connected {
                for topic in &subscriptions {
                    if let Err(err) = mqtt.subscribe(topic, QoS::AtLeastOnce) {
                        warn!("subscribe to {topic} failed: {err:?}");
                    }
                }
            }
            outputs.extend(app.handle(input, monotonic_ms()));
        }
        if restart_trigger.is_low() {
            outputs.extend(app.handle(AppInput::RestartTrigger, monotonic_ms()));
        }
        outputs.extend(app.tick(monotonic_ms()));

        for output in outputs {
            match output {
                AppOutput::Publish { topic, payload } => {
                    if let Err(err) =
                        mqtt.enqueue(&topic, QoS::AtMostOnce, false, payload.as_bytes())
                    {
                        warn!("publish to {topic} dropped: {err:?}");
                    }
                }
                AppOutput::Fallback => {
                    if let Err(err) = timer.cancel() {
                        warn!("failed to stop sample timer: {err:?}");
                    }
                    info!("{} sample triggers overran", waiter.overruns());
                    app.fall_back()
                }
            }
        }

        let wanted = app.sample_period_ms();
        if wanted != period_ms {
            period_ms = wanted;
            timer.cancel()?;
            timer.every(Duration::from_millis(period_ms.into()))?;
            info!("sample period now {period_ms} ms");
        }
    }
}

fn started() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn monotonic_ms() -> u64 {
    started().elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

fn monotonic_us() -> u64 {
    started().elapsed().as_micros().try_into().unwrap_or(u64::MAX)
}
