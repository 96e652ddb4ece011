use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc as std_mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{error, info, warn};

use labexpert_common::{
    application::WIFI_JOIN_TIMEOUT_MS,
    sampling::{sample_channel, SampleTrigger, SampleWaiter},
    sim::{FileStore, SimActuator, SimEeprom, SimFlash, SimThermometer, SimWifi, ThreadDelay},
    AppInput, AppOutput, BrokerAssignment, BrokerStore, ConnectStrategy, DeviceConfig, Failsafe,
    FailsafeAction, IdentityGate, MacAddress, PartitionManager, SlotId, TagPolicy,
    ThermometerApp, WifiCredentialStore,
};

type HostApp = ThermometerApp<SimThermometer, SimFlash, SimEeprom, ThreadDelay>;

/// Same layout as the bootloader host build, so both share one data dir.
const SLOT_SIZE: u32 = 0x1E_0000;
const HOST_MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xA2, 0xAB, 0x9F];
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const TRIGGER_POLL: Duration = Duration::from_millis(100);
const IDLE_WAIT: Duration = Duration::from_millis(50);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("LABEXPERT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.labexpert"));

    let mut config = load_config(&data_dir.join("config.json"))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load config: {err:#}");
            DeviceConfig::default()
        });
    config.sanitize();

    let mac = std::env::var("LABEXPERT_MAC")
        .ok()
        .and_then(|value| value.parse::<MacAddress>().ok())
        .unwrap_or(MacAddress::new(HOST_MAC));
    let slot = std::env::var("LABEXPERT_SLOT")
        .ok()
        .and_then(|value| SlotId::from_label(&value))
        .unwrap_or(SlotId::B);
    let base_celsius = std::env::var("LABEXPERT_BASE_CELSIUS")
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(21.5);

    let store = FileStore::open(data_dir.join("nvs.json")).context("failed to open nvs store")?;
    let mut flash = SimFlash::open(&data_dir, SLOT_SIZE);
    flash.boot_into(slot);
    let gate = IdentityGate::new(
        SimEeprom::backed_by(data_dir.join("eeprom.bin")),
        ThreadDelay,
        &config.identity,
    );
    let failsafe = Failsafe::new(gate, TagPolicy::OneOf(vec!["THR"]), &config.failsafe);
    let mut app = ThermometerApp::new(
        mac.device_id(),
        SimThermometer::new(base_celsius),
        failsafe,
        PartitionManager::new(flash),
        &config,
    );
    if let Some(pin) = config.failsafe.actuator_pin() {
        info!("simulating actuator on gpio {pin}");
        app.set_actuator(SimActuator::default());
    }
    info!("thermometer {} starting", app.sensor_id());

    let (app, broker) = tokio::task::spawn_blocking(move || boot(app, store, &config))
        .await
        .context("boot task panicked")?;

    let (inputs, inbox) = std_mpsc::channel();
    let mut options = MqttOptions::new(
        format!("ESP32_{}", app.sensor_id()),
        broker.broker_host.clone(),
        broker.port,
    );
    options.set_keep_alive(Duration::from_secs(15));
    let (client, eventloop) = AsyncClient::new(options, 32);
    info!("mqtt broker {}:{}", broker.broker_host, broker.port);

    tokio::spawn(drive_mqtt(
        client.clone(),
        eventloop,
        app.sensor_id().to_string(),
        inputs.clone(),
    ));
    tokio::spawn(watch_restart_trigger(
        data_dir.join("restart.trigger"),
        inputs,
    ));

    let (trigger, waiter) = sample_channel();
    let period = Arc::new(AtomicU32::new(app.sample_period_ms()));
    spawn_ticker(trigger, period.clone())?;

    tokio::task::spawn_blocking(move || run_app(app, inbox, waiter, period, client))
        .await
        .context("application task panicked")?;
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<DeviceConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => DeviceConfig::from_json(&raw)
            .with_context(|| format!("invalid config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
        Err(err) => Err(err.into()),
    }
}

/// Identity gate, then the credentials the bootloader left behind. Anything
/// missing sends the device back to slot A.
fn boot(mut app: HostApp, store: FileStore, config: &DeviceConfig) -> (HostApp, BrokerAssignment) {
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

    let Some(credentials) = WifiCredentialStore::new(store.clone()).load() else {
        warn!("no wifi credentials stored");
        app.fall_back()
    };
    let Some(broker) = broker_override().or_else(|| BrokerStore::new(store).load()) else {
        warn!("no mqtt broker assigned");
        app.fall_back()
    };

    let mut link = SimWifi::default();
    link.dhcp_ok = true;
    let strategy = ConnectStrategy::from_config(&config.network);
    if !strategy.probe_dhcp(&mut link, &mut ThreadDelay, &credentials, WIFI_JOIN_TIMEOUT_MS) {
        warn!("wifi join to `{}` failed", credentials.ssid());
        app.fall_back()
    }
    (app, broker)
}

/// `LABEXPERT_BROKER=host:port` skips the stored assignment.
fn broker_override() -> Option<BrokerAssignment> {
    let value = std::env::var("LABEXPERT_BROKER").ok()?;
    let (host, port) = value.rsplit_once(':')?;
    Some(BrokerAssignment {
        broker_host: host.to_string(),
        port: port.parse().ok()?,
        backend_mac: None,
    })
}

async fn drive_mqtt(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    sensor_id: String,
    inputs: std_mpsc::Sender<AppInput>,
) {
    let subscriptions = [
        labexpert_common::command_topic(&sensor_id),
        labexpert_common::config_topic(&sensor_id),
    ];
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                for topic in &subscriptions {
                    if let Err(err) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                        warn!("subscribe to {topic} failed: {err}");
                    }
                }
                if inputs.send(AppInput::Connected).is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let input = AppInput::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if inputs.send(input).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt connection error: {err}");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Creating the file plays the part of pulling the trigger pin low.
async fn watch_restart_trigger(path: PathBuf, inputs: std_mpsc::Sender<AppInput>) {
    let mut interval = tokio::time::interval(TRIGGER_POLL);
    loop {
        interval.tick().await;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("failed to clear {}: {err}", path.display());
            }
            if inputs.send(AppInput::RestartTrigger).is_err() {
                return;
            }
        }
    }
}

/// Stands in for the hardware timer interrupt.
fn spawn_ticker(trigger: SampleTrigger, period: Arc<AtomicU32>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("sample-timer".into())
        .spawn(move || loop {
            let period_ms = period.load(Ordering::Relaxed).max(1);
            thread::sleep(Duration::from_millis(period_ms.into()));
            trigger.fire(monotonic_us());
        })
        .context("failed to spawn sample timer")?;
    Ok(())
}

fn run_app(
    mut app: HostApp,
    inbox: std_mpsc::Receiver<AppInput>,
    waiter: SampleWaiter,
    period: Arc<AtomicU32>,
    client: AsyncClient,
) {
    loop {
        let mut outputs = Vec::new();
        if waiter.wait(IDLE_WAIT).is_some() {
            outputs.extend(app.sample(monotonic_ms));
        }
        while let Ok(input) = inbox.try_recv() {
            outputs.extend(app.handle(input, monotonic_ms()));
        }
        outputs.extend(app.tick(monotonic_ms()));
        period.store(app.sample_period_ms(), Ordering::Relaxed);

        for output in outputs {
            match output {
                AppOutput::Publish { topic, payload } => {
                    if let Err(err) =
                        client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload)
                    {
                        warn!("publish to {topic} dropped: {err}");
                    }
                }
                AppOutput::Fallback => {
                    let overruns = waiter.overruns();
                    if overruns > 0 {
                        info!("{overruns} sample triggers overran");
                    }
                    app.fall_back()
                }
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn broker_override_splits_host_and_port() {
        std::env::set_var("LABEXPERT_BROKER", "192.168.1.20:1884");
        let broker = broker_override();
        std::env::remove_var("LABEXPERT_BROKER");

        assert_eq!(
            broker,
            Some(BrokerAssignment {
                broker_host: "192.168.1.20".to_string(),
                port: 1884,
                backend_mac: None,
            })
        );
    }
}
