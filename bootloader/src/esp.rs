use std::{
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
};
use esp32_nimble::{
    utilities::{mutex::Mutex as BleMutex, BleUuid},
    BLEAdvertisementData, BLECharacteristic, BLEDevice, NimbleProperties,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyInputPin, Input, PinDriver},
        prelude::Peripherals,
    },
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
};
use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};

use labexpert_common::{
    config::{NetworkConfig, ProvisioningConfig},
    discovery::{response_port, MAX_PACKET_LEN},
    esp::{
        add_current_task_to_watchdog, disable_wifi_power_save, feed_watchdog, init_watchdog,
        station_mac, EepromTagStore, EspFlash, EspWifiLink, GpioActuator, NvsStore, RtosDelay,
    },
    ota::{parse_request, BeginRequest, EndRequest, WriteRequest},
    partition::PartitionDescriptor,
    provisioning::{
        Characteristic, ProvisioningAction, ProvisioningSession, ResetButton, StatusMessage,
        DEVICE_NAME_PREFIX, SERVICE_UUID16,
    },
    types::RepairRequest,
    upload::{self, UploadEvent},
    ConnectStrategy, Delay, DeviceCommand, DeviceConfig, DeviceContext, DeviceReply, Failsafe,
    FailsafeAction, IdentityGate, MacAddress, OtaError, PartitionManager, PushReply, TagPolicy,
    WifiCredentialStore, WifiLink,
};

type EspDevice = DeviceContext<EspFlash, NvsStore, EepromTagStore, RtosDelay>;
type DeviceRequest = (DeviceCommand, Sender<DeviceReply>);
type HttpRequest<'a, 'b> = Request<&'a mut EspHttpConnection<'b>>;

const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const UPLOAD_CHUNK_SIZE: usize = 4096;
const REQUEST_QUEUE_DEPTH: usize = 8;

#[derive(Clone)]
struct DeviceHandle {
    requests: SyncSender<DeviceRequest>,
}

impl DeviceHandle {
    fn call(&self, command: DeviceCommand) -> anyhow::Result<DeviceReply> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.requests
            .send((command, reply_tx))
            .map_err(|_| anyhow!("device task has stopped"))?;
        reply_rx.recv().context("device task dropped the request")
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

    let Peripherals { modem, i2c0, .. } = Peripherals::take()?;
    let mac = station_mac()?;

    let gate = IdentityGate::new(
        EepromTagStore::new(i2c0, &config.identity).context("identity eeprom init failed")?,
        RtosDelay,
        &config.identity,
    );
    let failsafe = Failsafe::new(gate, TagPolicy::AnyPresent, &config.failsafe);
    let mut device = DeviceContext::new(
        config.clone(),
        PartitionManager::new(EspFlash),
        failsafe,
        store.clone(),
        mac,
    );
    device.set_chunk_hook(|_| feed_watchdog());
    if let Some(pin) = config.failsafe.actuator_pin() {
        device.set_actuator(GpioActuator::new(pin).context("actuator pin init failed")?);
    }
    info!(
        "bootloader {} starting as device {}",
        config.network.firmware_version,
        device.device_id()
    );

    match device.boot(monotonic_ms()) {
        Ok(FailsafeAction::FallbackToBootloader) => device.fall_back(),
        Ok(action) => info!("boot decision: {action:?}"),
        Err(err) => {
            error!("cannot identify the running partition: {err}");
            device.restart()
        }
    }

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let mut link = EspWifiLink::new(modem, sys_loop, nvs_partition)?;

    let Some(credentials) = device.credentials() else {
        return provision(device, store, mac, &mut link, &config);
    };

    let strategy = ConnectStrategy::from_config(&config.network);
    let ip = strategy
        .connect(&mut link, &mut RtosDelay, &credentials, feed_watchdog)
        .and_then(|_| link.local_ip());
    match ip {
        Some(ip) => {
            info!("network up at {ip}");
            disable_wifi_power_save();
        }
        None => warn!("wifi connection failed, serving locally only"),
    }
    device.set_ip(ip);

    let (requests, inbox) = mpsc::sync_channel(REQUEST_QUEUE_DEPTH);
    let handle = DeviceHandle { requests };

    let _server = create_http_server(handle.clone(), &config)?;
    spawn_discovery(
        handle.clone(),
        config.network.discovery_port,
        config.network.response_port,
    )?;
    let button = reset_button_pin(config.provisioning.reset_button_pin)?;
    spawn_reset_button(handle, button, config.provisioning.clone())?;

    // Keep the radio alive for the program lifetime.
    let _link = link;
    run_device(
        device,
        inbox,
        Duration::from_millis(config.failsafe.recheck_interval_ms),
        Duration::from_millis(config.ota.restart_delay_ms.into()),
    );
    Err(anyhow!("device request channel closed"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    Nothing,
    Restart,
    Fallback,
}

fn follow_up(reply: &DeviceReply) -> FollowUp {
    match reply {
        DeviceReply::Push { restart: true, .. }
        | DeviceReply::UploadDone(Ok(_))
        | DeviceReply::FactoryReset(_) => FollowUp::Restart,
        DeviceReply::Failsafe(Some(FailsafeAction::FallbackToBootloader)) => FollowUp::Fallback,
        _ => FollowUp::Nothing,
    }
}

/// Owns the device on the main task, which is the one the watchdog
/// watches. The sensor recheck runs on schedule even while requests keep
/// arriving.
fn run_device(
    mut device: EspDevice,
    inbox: Receiver<DeviceRequest>,
    recheck_every: Duration,
    restart_delay: Duration,
) {
    let mut next_recheck = Instant::now() + recheck_every;
    loop {
        feed_watchdog();
        if Instant::now() >= next_recheck {
            next_recheck = Instant::now() + recheck_every;
            let reply = device.handle(DeviceCommand::Recheck, monotonic_ms());
            apply(&mut device, follow_up(&reply), restart_delay);
        }

        let wait = next_recheck.saturating_duration_since(Instant::now());
        let (command, reply_tx) = match inbox.recv_timeout(wait) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("device channel closed");
                return;
            }
        };

        let reply = device.handle(command, monotonic_ms());
        let next = follow_up(&reply);
        if reply_tx.send(reply).is_err() {
            debug!("requester went away before the reply");
        }
        apply(&mut device, next, restart_delay);
    }
}

fn apply(device: &mut EspDevice, next: FollowUp, restart_delay: Duration) {
    match next {
        FollowUp::Nothing => {}
        FollowUp::Restart => {
            thread::sleep(restart_delay);
            device.restart()
        }
        FollowUp::Fallback => device.fall_back(),
    }
}

fn reset_button_pin(pin: i32) -> anyhow::Result<PinDriver<'static, AnyInputPin, Input>> {
    // GPIO34 is input only and relies on the external pull-up.
    Ok(unsafe { PinDriver::input(AnyInputPin::new(pin)) }?)
}

fn spawn_reset_button(
    device: DeviceHandle,
    pin: PinDriver<'static, AnyInputPin, Input>,
    config: ProvisioningConfig,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("reset-button".to_string())
        .stack_size(4096)
        .spawn(move || {
            let mut button = ResetButton::new(&config);
            let period = Duration::from_millis(config.reset_sample_ms.into());
            loop {
                if button.sample(pin.is_low(), monotonic_ms()) {
                    if let Err(err) = device.call(DeviceCommand::FactoryReset) {
                        warn!("factory reset request failed: {err:#}");
                    }
                }
                thread::sleep(period);
            }
        })
        .context("failed to spawn reset button thread")?;
    Ok(())
}

fn spawn_discovery(device: DeviceHandle, port: u16, reply_port: Option<u16>) -> anyhow::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .with_context(|| format!("failed to bind discovery socket on udp/{port}"))?;
    socket.set_broadcast(true)?;
    info!("discovery listening on udp/{port}");

    thread::Builder::new()
        .name("discovery".to_string())
        .stack_size(8192)
        .spawn(move || {
            let mut buf = [0_u8; MAX_PACKET_LEN];
            loop {
                let (len, source) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("discovery receive error: {err}");
                        thread::sleep(Duration::from_secs(2));
                        continue;
                    }
                };

                let response = match device.call(DeviceCommand::Discovery(buf[..len].to_vec())) {
                    Ok(DeviceReply::Discovery(Some(response))) => response,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("discovery request dropped: {err:#}");
                        continue;
                    }
                };

                let target = SocketAddr::new(source.ip(), response_port(source.port(), reply_port));
                match serde_json::to_vec(&response) {
                    Ok(payload) => {
                        if let Err(err) = socket.send_to(&payload, target) {
                            warn!("discovery reply to {target} failed: {err}");
                        }
                    }
                    Err(err) => warn!("failed to encode discovery reply: {err}"),
                }
            }
        })
        .context("failed to spawn discovery thread")?;
    Ok(())
}

enum BleWrite {
    Value(Characteristic, Vec<u8>),
}

/// Advertises the provisioning service and runs the session on this task
/// until it schedules a restart. Network services stay down meanwhile.
fn provision(
    mut device: EspDevice,
    store: NvsStore,
    mac: MacAddress,
    link: &mut EspWifiLink,
    config: &DeviceConfig,
) -> anyhow::Result<()> {
    let name = mac.ble_device_name(DEVICE_NAME_PREFIX);
    info!("no wifi credentials stored, advertising `{name}` for provisioning");

    let (writes_tx, writes) = mpsc::channel::<BleWrite>();
    let status = start_ble_service(&name, writes_tx)?;
    let notify = |message: &StatusMessage| {
        info!("provisioning status: {message}");
        status.lock().set_value(message.to_string().as_bytes()).notify();
    };

    let mut session = ProvisioningSession::new(
        WifiCredentialStore::new(store),
        &config.provisioning,
        monotonic_ms(),
    );
    let pin = reset_button_pin(config.provisioning.reset_button_pin)?;
    let mut button = ResetButton::new(&config.provisioning);
    let period = Duration::from_millis(config.provisioning.reset_sample_ms.into());

    loop {
        feed_watchdog();
        match writes.recv_timeout(period) {
            Ok(BleWrite::Value(characteristic, value)) => {
                let actions = session.on_write(characteristic, &value, monotonic_ms());
                if let Some(after_ms) =
                    run_provisioning_actions(&mut session, actions, link, &config.network, &notify)
                {
                    thread::sleep(Duration::from_millis(after_ms.into()));
                    device.restart();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("ble write channel closed"));
            }
        }

        let now = monotonic_ms();
        if button.sample(pin.is_low(), now) {
            if let DeviceReply::FactoryReset(Err(err)) =
                device.handle(DeviceCommand::FactoryReset, now)
            {
                warn!("factory reset failed: {err}");
            }
            device.restart();
        }
        if let Some(message) = session.tick(now) {
            notify(&message);
        }
    }
}

/// Returns the restart delay once the session has scheduled one.
fn run_provisioning_actions(
    session: &mut ProvisioningSession<NvsStore>,
    actions: Vec<ProvisioningAction>,
    link: &mut EspWifiLink,
    network: &NetworkConfig,
    notify: &impl Fn(&StatusMessage),
) -> Option<u32> {
    let mut queue = VecDeque::from(actions);
    while let Some(action) = queue.pop_front() {
        match action {
            ProvisioningAction::Notify(message) => notify(&message),
            ProvisioningAction::TestConnection(credentials) => {
                let connected = ConnectStrategy::from_config(network).probe_dhcp(
                    link,
                    &mut WatchdogDelay,
                    &credentials,
                    network.provisioning_connect_timeout_ms,
                );
                link.disconnect();
                queue.extend(session.finish_commit(connected));
            }
            ProvisioningAction::Restart { after_ms } => return Some(after_ms),
        }
    }
    None
}

/// Feeds the watchdog while the connection test polls.
struct WatchdogDelay;

impl Delay for WatchdogDelay {
    fn delay_ms(&mut self, ms: u32) {
        feed_watchdog();
        RtosDelay.delay_ms(ms);
    }
}

fn start_ble_service(
    name: &str,
    writes: Sender<BleWrite>,
) -> anyhow::Result<Arc<BleMutex<BLECharacteristic>>> {
    let ble_device = BLEDevice::take();
    BLEDevice::set_device_name(name).map_err(|err| anyhow!("ble name rejected: {err:?}"))?;

    let server = ble_device.get_server();
    server.on_connect(|_, desc| info!("ble client connected: {:?}", desc.address()));
    server.on_disconnect(|_, reason| info!("ble client disconnected: {reason:?}"));
    server.advertise_on_disconnect(true);

    let service = server.create_service(BleUuid::from_uuid16(SERVICE_UUID16));
    let mut status = None;
    for characteristic in Characteristic::ALL {
        let properties = match characteristic {
            Characteristic::Status => NimbleProperties::READ | NimbleProperties::NOTIFY,
            _ => NimbleProperties::WRITE,
        };
        let handle = service
            .lock()
            .create_characteristic(BleUuid::from_uuid16(characteristic.uuid16()), properties);
        if characteristic == Characteristic::Status {
            status = Some(handle);
            continue;
        }
        let writes = writes.clone();
        handle.lock().on_write(move |args| {
            let value = args.recv_data().to_vec();
            if writes.send(BleWrite::Value(characteristic, value)).is_err() {
                warn!("provisioning session is gone, dropping ble write");
            }
        });
    }
    let status = status.ok_or_else(|| anyhow!("status characteristic missing"))?;

    let advertising = ble_device.get_advertising();
    advertising
        .lock()
        .set_data(
            BLEAdvertisementData::new()
                .name(name)
                .add_service_uuid(BleUuid::from_uuid16(SERVICE_UUID16)),
        )
        .map_err(|err| anyhow!("ble advertising data rejected: {err:?}"))?;
    advertising
        .lock()
        .start()
        .map_err(|err| anyhow!("ble advertising failed: {err:?}"))?;
    Ok(status)
}

fn create_http_server(
    device: DeviceHandle,
    config: &DeviceConfig,
) -> anyhow::Result<EspHttpServer<'static>> {
    let mut server = EspHttpServer::new(&HttpConfiguration {
        http_port: config.network.http_port,
        stack_size: 16 * 1024,
        ..Default::default()
    })?;
    let max_push_body = config.ota.max_push_body;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        match handle.call(DeviceCommand::Snapshot)? {
            DeviceReply::Snapshot(snapshot) => {
                req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                    .write_all(snapshot.to_html().as_bytes())?;
                Ok(())
            }
            other => write_unexpected(req, other),
        }
    })?;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/info", Method::Get, move |req| {
        match handle.call(DeviceCommand::Info)? {
            DeviceReply::Info(info) => write_json(req, 200, &info),
            other => write_unexpected(req, other),
        }
    })?;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/id", Method::Get, move |req| {
        match handle.call(DeviceCommand::Id)? {
            DeviceReply::Id(id) => write_json(req, 200, &id),
            other => write_unexpected(req, other),
        }
    })?;

    server.fn_handler::<anyhow::Error, _>("/ping", Method::Get, |req| {
        req.into_ok_response()?.write_all(b"pong")?;
        Ok(())
    })?;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |req| {
        match handle.call(DeviceCommand::Snapshot)? {
            DeviceReply::Snapshot(snapshot) => write_json(req, 200, &snapshot),
            other => write_unexpected(req, other),
        }
    })?;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/update", Method::Post, move |mut req| {
        let mut started = false;
        let (status, body) = match stream_upload(&handle, &mut req, &mut started) {
            Ok(partition) => {
                info!("image staged in {}, restarting", partition.label);
                (200, "OK")
            }
            Err(err) => {
                warn!("firmware upload failed: {err:#}");
                if started {
                    if let Err(err) = handle.call(DeviceCommand::UploadAbort) {
                        warn!("failed to abort upload: {err:#}");
                    }
                }
                (500, "FAIL")
            }
        };
        req.into_response(status, None, &[("Content-Type", "text/plain")])?
            .write_all(body.as_bytes())?;
        Ok(())
    })?;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/ota/begin", Method::Post, move |mut req| {
        let command = push_body::<BeginRequest>(&mut req, max_push_body)
            .map(|request| DeviceCommand::OtaBegin { size: request.size });
        push(&handle, req, command)
    })?;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/ota/write", Method::Post, move |mut req| {
        let command =
            push_body::<WriteRequest>(&mut req, max_push_body).map(DeviceCommand::OtaWrite);
        push(&handle, req, command)
    })?;

    let handle = device.clone();
    server.fn_handler::<anyhow::Error, _>("/ota/end", Method::Post, move |mut req| {
        let command = push_body::<EndRequest>(&mut req, max_push_body).map(DeviceCommand::OtaEnd);
        push(&handle, req, command)
    })?;

    let handle = device;
    server.fn_handler::<anyhow::Error, _>("/identity/repair", Method::Post, move |mut req| {
        let body = match read_request_body(&mut req, max_push_body) {
            Ok(body) => body,
            Err(err) => return write_error(req, 400, &err.to_string()),
        };
        let request: RepairRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return write_error(req, 400, &format!("invalid request: {err}")),
        };
        match handle.call(DeviceCommand::RepairIdentity(request))? {
            DeviceReply::Repair(reply) => {
                let status = match reply.error.as_deref() {
                    None => 200,
                    Some("unauthorized" | "repair_disabled") => 403,
                    Some("invalid_tag") => 400,
                    Some(_) => 500,
                };
                write_json(req, status, &reply)
            }
            other => write_unexpected(req, other),
        }
    })?;

    info!("ota server listening on port {}", config.network.http_port);
    Ok(server)
}

fn stream_upload(
    device: &DeviceHandle,
    req: &mut HttpRequest<'_, '_>,
    started: &mut bool,
) -> anyhow::Result<PartitionDescriptor> {
    let content_type = req
        .header("Content-Type")
        .ok_or_else(|| anyhow!("upload has no content type"))?
        .to_string();

    upload::stream_first_part::<anyhow::Error, _, _>(
        &content_type,
        UPLOAD_CHUNK_SIZE,
        |buf: &mut [u8]| Ok(req.read(buf)?),
        |event| match event {
            UploadEvent::Start { filename, size } => {
                info!(
                    "upload of `{}` started ({})",
                    filename.as_deref().unwrap_or("firmware.bin"),
                    size.map_or_else(
                        || "size from stream".to_string(),
                        |size| format!("{size} bytes")
                    )
                );
                expect_upload(device.call(DeviceCommand::UploadStart { size })?)?;
                *started = true;
                Ok(())
            }
            UploadEvent::Data(chunk) => {
                expect_upload(device.call(DeviceCommand::UploadChunk(chunk))?)
            }
        },
    )?;

    match device.call(DeviceCommand::UploadFinish)? {
        DeviceReply::UploadDone(result) => Ok(result?),
        other => Err(anyhow!("unexpected device reply: {other:?}")),
    }
}

fn expect_upload(reply: DeviceReply) -> anyhow::Result<()> {
    match reply {
        DeviceReply::Upload(result) => Ok(result?),
        other => Err(anyhow!("unexpected device reply: {other:?}")),
    }
}

fn push_body<T: DeserializeOwned>(
    req: &mut HttpRequest<'_, '_>,
    max_push_body: usize,
) -> Result<T, OtaError> {
    let body =
        read_request_body(req, max_push_body).map_err(|err| OtaError::BadJson(err.to_string()))?;
    parse_request(&body)
}

fn push(
    device: &DeviceHandle,
    req: HttpRequest<'_, '_>,
    command: Result<DeviceCommand, OtaError>,
) -> anyhow::Result<()> {
    let reply = match command {
        Ok(command) => match device.call(command)? {
            DeviceReply::Push { reply, .. } => reply,
            other => return write_unexpected(req, other),
        },
        Err(err) => PushReply::failed(&err),
    };
    write_json(req, reply.http_status(), &reply)
}

fn read_request_body(req: &mut HttpRequest<'_, '_>, limit: usize) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > limit {
        return Err(anyhow!("body exceeds {limit} bytes"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, status: u16, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status: u16, message: &str) -> anyhow::Result<()> {
    write_json(req, status, &serde_json::json!({ "error": message }))
}

fn write_unexpected(req: HttpRequest<'_, '_>, reply: DeviceReply) -> anyhow::Result<()> {
    warn!("unexpected device reply: {reply:?}");
    write_error(req, 500, "unexpected device reply")
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
