use std::{
    collections::VecDeque,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, UdpSocket},
    sync::{mpsc, oneshot},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use labexpert_common::{
    config::{NetworkConfig, ProvisioningConfig},
    discovery::{response_port, MAX_PACKET_LEN},
    ota::{parse_request, BeginRequest, EndRequest, WriteRequest},
    partition::PartitionDescriptor,
    provisioning::{
        Characteristic, ProvisioningAction, ProvisioningSession, ResetButton, DEVICE_NAME_PREFIX,
    },
    sim::{FileStore, SimActuator, SimEeprom, SimFlash, SimWifi, ThreadDelay},
    types::RepairRequest,
    ConnectStrategy, DeviceCommand, DeviceConfig, DeviceContext, DeviceReply, Failsafe,
    FailsafeAction, IdentityGate, IpAssignment, MacAddress, OtaError, PartitionManager, PushReply,
    SlotId, TagPolicy, WifiCredentialStore, WifiCredentials, WifiLink,
};

type HostDevice = DeviceContext<SimFlash, FileStore, SimEeprom, ThreadDelay>;
type DeviceRequest = (DeviceCommand, oneshot::Sender<DeviceReply>);

/// Matches a 4 MB part with two 1.875 MB application slots.
const SLOT_SIZE: u32 = 0x1E_0000;
const UPLOAD_OVERHEAD: usize = 64 * 1024;
const HOST_MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xA2, 0xAB, 0x9F];

#[derive(Clone)]
struct DeviceHandle {
    requests: mpsc::Sender<DeviceRequest>,
}

impl DeviceHandle {
    async fn call(&self, command: DeviceCommand) -> anyhow::Result<DeviceReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send((command, reply_tx))
            .await
            .map_err(|_| anyhow!("device task has stopped"))?;
        reply_rx.await.context("device task dropped the request")
    }
}

#[derive(Clone)]
struct AppState {
    device: DeviceHandle,
    max_push_body: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

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
    apply_env_overrides(&mut config);
    config.sanitize();

    let mac = std::env::var("LABEXPERT_MAC")
        .ok()
        .and_then(|value| value.parse::<MacAddress>().ok())
        .unwrap_or(MacAddress::new(HOST_MAC));
    let slot = std::env::var("LABEXPERT_SLOT")
        .ok()
        .and_then(|value| SlotId::from_label(&value))
        .unwrap_or(SlotId::A);

    let store = FileStore::open(data_dir.join("nvs.json")).context("failed to open nvs store")?;
    let mut flash = SimFlash::open(&data_dir, SLOT_SIZE);
    flash.boot_into(slot);
    let gate = IdentityGate::new(
        SimEeprom::backed_by(data_dir.join("eeprom.bin")),
        ThreadDelay,
        &config.identity,
    );
    let failsafe = Failsafe::new(gate, TagPolicy::AnyPresent, &config.failsafe);
    let mut device = DeviceContext::new(
        config.clone(),
        PartitionManager::new(flash),
        failsafe,
        store.clone(),
        mac,
    );
    if let Some(pin) = config.failsafe.actuator_pin() {
        info!("simulating actuator on gpio {pin}");
        device.set_actuator(SimActuator::default());
    }
    info!(
        "bootloader {} starting as device {}",
        config.network.firmware_version,
        device.device_id()
    );

    let mut device = tokio::task::spawn_blocking(move || boot(device))
        .await
        .context("boot task panicked")?;

    let Some(credentials) = device.credentials() else {
        return provision(device, store, mac, &config).await;
    };

    let network = config.network.clone();
    let ip = tokio::task::spawn_blocking(move || connect_wifi(&network, &credentials))
        .await
        .context("wifi task panicked")?;
    match ip {
        Some(ip) => info!("network up at {ip}"),
        None => warn!("wifi connection failed, serving locally only"),
    }
    device.set_ip(ip);

    let (requests, inbox) = mpsc::channel(16);
    let handle = DeviceHandle { requests };
    let restart_delay = Duration::from_millis(config.ota.restart_delay_ms.into());
    tokio::task::spawn_blocking(move || run_device(device, inbox, restart_delay));

    spawn_recheck_loop(
        handle.clone(),
        Duration::from_millis(config.failsafe.recheck_interval_ms),
    );
    spawn_discovery(
        handle.clone(),
        config.network.discovery_port,
        config.network.response_port,
    )
    .await?;
    spawn_reset_button(handle.clone(), config.provisioning.clone());

    let app_state = AppState {
        device: handle,
        max_push_body: config.ota.max_push_body,
    };
    let app = Router::new()
        .route("/", get(handle_index))
        .route("/info", get(handle_info))
        .route("/id", get(handle_id))
        .route("/ping", get(handle_ping))
        .route("/status", get(handle_status))
        .route(
            "/update",
            post(handle_update).layer(DefaultBodyLimit::max(SLOT_SIZE as usize + UPLOAD_OVERHEAD)),
        )
        .route("/ota/begin", post(handle_ota_begin))
        .route("/ota/write", post(handle_ota_write))
        .route("/ota/end", post(handle_ota_end))
        .route("/identity/repair", post(handle_identity_repair))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind ota server at {addr}"))?;

    info!("ota server listening on http://{addr}");
    axum::serve(listener, app).await?;
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

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

fn apply_env_overrides(config: &mut DeviceConfig) {
    if let Some(port) = env_u16("LABEXPERT_HTTP_PORT") {
        config.network.http_port = port;
    }
    if let Some(port) = env_u16("LABEXPERT_DISCOVERY_PORT") {
        config.network.discovery_port = port;
    }
    if let Some(port) = env_u16("LABEXPERT_RESPONSE_PORT") {
        config.network.response_port = Some(port);
    }
    if let Ok(token) = std::env::var("LABEXPERT_REPAIR_TOKEN") {
        config.repair_token = token;
    }
}

fn boot(mut device: HostDevice) -> HostDevice {
    match device.boot(monotonic_ms()) {
        Ok(FailsafeAction::FallbackToBootloader) => device.fall_back(),
        Ok(action) => {
            info!("boot decision: {action:?}");
            device
        }
        Err(err) => {
            error!("cannot identify the running partition: {err}");
            device.restart()
        }
    }
}

fn connect_wifi(network: &NetworkConfig, credentials: &WifiCredentials) -> Option<Ipv4Addr> {
    let strategy = ConnectStrategy::from_config(network);
    let first_static = strategy.candidates().into_iter().find_map(|candidate| match candidate {
        IpAssignment::Static { ip, .. } => Some(ip),
        IpAssignment::Dhcp => None,
    });
    let mut link = SimWifi::default();
    link.static_ok = first_static;
    link.dhcp_ok = true;
    strategy.connect(&mut link, &mut ThreadDelay, credentials, || {})?;
    link.local_ip()
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

/// Owns the device for the rest of the process. Restarts happen here, after
/// the reply has been handed back so the client still sees it.
fn run_device(
    mut device: HostDevice,
    mut inbox: mpsc::Receiver<DeviceRequest>,
    restart_delay: Duration,
) {
    while let Some((command, reply_tx)) = inbox.blocking_recv() {
        let reply = device.handle(command, monotonic_ms());
        let next = follow_up(&reply);
        if reply_tx.send(reply).is_err() {
            debug!("requester went away before the reply");
        }
        match next {
            FollowUp::Nothing => {}
            FollowUp::Restart => {
                thread::sleep(restart_delay);
                device.restart()
            }
            FollowUp::Fallback => device.fall_back(),
        }
    }
    warn!("device channel closed");
}

fn spawn_recheck_loop(device: DeviceHandle, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(err) = device.call(DeviceCommand::Recheck).await {
                warn!("sensor recheck failed: {err:#}");
            }
        }
    });
}

async fn spawn_discovery(
    device: DeviceHandle,
    port: u16,
    reply_port: Option<u16>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("failed to bind discovery socket on udp/{port}"))?;
    socket.set_broadcast(true)?;
    info!("discovery listening on udp/{port}");

    tokio::spawn(async move {
        let mut buf = [0_u8; MAX_PACKET_LEN];
        loop {
            let (len, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!("discovery receive error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            let response = match device.call(DeviceCommand::Discovery(buf[..len].to_vec())).await {
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
                    if let Err(err) = socket.send_to(&payload, target).await {
                        warn!("discovery reply to {target} failed: {err}");
                    }
                }
                Err(err) => warn!("failed to encode discovery reply: {err}"),
            }
        }
    });
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleInput {
    Write(Characteristic, Vec<u8>),
    Button(bool),
    Help,
}

/// Host stand-in for the GATT writes and the reset button.
fn parse_console_line(line: &str) -> Option<ConsoleInput> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (verb, value) = line.split_once(' ').unwrap_or((line, ""));
    let write = |characteristic| Some(ConsoleInput::Write(characteristic, value.as_bytes().to_vec()));
    match verb {
        "ssid" => write(Characteristic::Ssid),
        "pass" => write(Characteristic::Password),
        "hostmac" => write(Characteristic::HostMac),
        "commit" => Some(ConsoleInput::Write(Characteristic::Commit, Vec::new())),
        "press" => Some(ConsoleInput::Button(true)),
        "release" => Some(ConsoleInput::Button(false)),
        "help" => Some(ConsoleInput::Help),
        _ => None,
    }
}

fn print_console_help() {
    info!("console: ssid <name> | pass <password> | hostmac <aa:bb:..> | commit | press | release");
}

/// Runs until the session asks for a restart. Network services stay down
/// while no credentials are stored.
async fn provision(
    mut device: HostDevice,
    store: FileStore,
    mac: MacAddress,
    config: &DeviceConfig,
) -> anyhow::Result<()> {
    info!(
        "no wifi credentials stored, advertising `{}` for provisioning",
        mac.ble_device_name(DEVICE_NAME_PREFIX)
    );
    print_console_help();

    let mut session = ProvisioningSession::new(
        WifiCredentialStore::new(store),
        &config.provisioning,
        monotonic_ms(),
    );
    let mut button = ResetButton::new(&config.provisioning);
    let mut pressed = false;
    let mut console_open = true;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sample = tokio::time::interval(Duration::from_millis(
        config.provisioning.reset_sample_ms.into(),
    ));

    loop {
        tokio::select! {
            line = lines.next_line(), if console_open => {
                let Some(line) = line.context("failed to read console")? else {
                    console_open = false;
                    continue;
                };
                match parse_console_line(&line) {
                    Some(ConsoleInput::Write(characteristic, value)) => {
                        let actions = session.on_write(characteristic, &value, monotonic_ms());
                        if let Some(after_ms) =
                            run_provisioning_actions(&mut session, actions, &config.network).await?
                        {
                            tokio::time::sleep(Duration::from_millis(after_ms.into())).await;
                            device.restart();
                        }
                    }
                    Some(ConsoleInput::Button(state)) => pressed = state,
                    Some(ConsoleInput::Help) => print_console_help(),
                    None => warn!("unknown console input `{line}`"),
                }
            }
            _ = sample.tick() => {
                let now = monotonic_ms();
                if button.sample(pressed, now) {
                    if let DeviceReply::FactoryReset(Err(err)) =
                        device.handle(DeviceCommand::FactoryReset, now)
                    {
                        warn!("factory reset failed: {err}");
                    }
                    device.restart();
                }
                if let Some(status) = session.tick(now) {
                    info!("provisioning status: {status}");
                }
            }
        }
    }
}

/// Returns the restart delay once the session has scheduled one.
async fn run_provisioning_actions(
    session: &mut ProvisioningSession<FileStore>,
    actions: Vec<ProvisioningAction>,
    network: &NetworkConfig,
) -> anyhow::Result<Option<u32>> {
    let mut queue = VecDeque::from(actions);
    while let Some(action) = queue.pop_front() {
        match action {
            ProvisioningAction::Notify(status) => info!("provisioning status: {status}"),
            ProvisioningAction::TestConnection(credentials) => {
                let network = network.clone();
                let connected = tokio::task::spawn_blocking(move || {
                    let strategy = ConnectStrategy::from_config(&network);
                    let mut link = SimWifi::default();
                    link.dhcp_ok = true;
                    strategy.probe_dhcp(
                        &mut link,
                        &mut ThreadDelay,
                        &credentials,
                        network.provisioning_connect_timeout_ms,
                    )
                })
                .await
                .context("connection test panicked")?;
                queue.extend(session.finish_commit(connected));
            }
            ProvisioningAction::Restart { after_ms } => return Ok(Some(after_ms)),
        }
    }
    Ok(None)
}

/// Reset button for the connected mode. Only `press` and `release` mean
/// anything once provisioning is closed.
fn spawn_reset_button(device: DeviceHandle, config: ProvisioningConfig) {
    tokio::spawn(async move {
        let mut button = ResetButton::new(&config);
        let mut pressed = false;
        let mut console_open = true;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut sample =
            tokio::time::interval(Duration::from_millis(config.reset_sample_ms.into()));

        loop {
            tokio::select! {
                line = lines.next_line(), if console_open => match line {
                    Ok(Some(line)) => match parse_console_line(&line) {
                        Some(ConsoleInput::Button(state)) => pressed = state,
                        Some(ConsoleInput::Write(..)) => {
                            warn!("credentials are already stored; hold the reset button to re-provision")
                        }
                        Some(ConsoleInput::Help) => print_console_help(),
                        None => warn!("unknown console input `{line}`"),
                    },
                    Ok(None) => console_open = false,
                    Err(err) => {
                        warn!("console read failed: {err}");
                        console_open = false;
                    }
                },
                _ = sample.tick() => {
                    if button.sample(pressed, monotonic_ms()) {
                        if let Err(err) = device.call(DeviceCommand::FactoryReset).await {
                            warn!("factory reset request failed: {err:#}");
                        }
                    }
                }
            }
        }
    });
}

async fn query(state: &AppState, command: DeviceCommand) -> Result<DeviceReply, Response> {
    state.device.call(command).await.map_err(|err| {
        warn!("device request failed: {err:#}");
        error_response(StatusCode::SERVICE_UNAVAILABLE, "device unavailable")
    })
}

fn unexpected(reply: DeviceReply) -> Response {
    warn!("unexpected device reply: {reply:?}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "unexpected device reply")
}

async fn handle_index(State(state): State<AppState>) -> Response {
    match query(&state, DeviceCommand::Snapshot).await {
        Ok(DeviceReply::Snapshot(snapshot)) => Html(snapshot.to_html()).into_response(),
        Ok(other) => unexpected(other),
        Err(response) => response,
    }
}

async fn handle_info(State(state): State<AppState>) -> Response {
    match query(&state, DeviceCommand::Info).await {
        Ok(DeviceReply::Info(info)) => Json(info).into_response(),
        Ok(other) => unexpected(other),
        Err(response) => response,
    }
}

async fn handle_id(State(state): State<AppState>) -> Response {
    match query(&state, DeviceCommand::Id).await {
        Ok(DeviceReply::Id(id)) => Json(id).into_response(),
        Ok(other) => unexpected(other),
        Err(response) => response,
    }
}

async fn handle_ping() -> &'static str {
    "pong"
}

async fn handle_status(State(state): State<AppState>) -> Response {
    match query(&state, DeviceCommand::Snapshot).await {
        Ok(DeviceReply::Snapshot(snapshot)) => Json(snapshot).into_response(),
        Ok(other) => unexpected(other),
        Err(response) => response,
    }
}

async fn handle_update(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut started = false;
    match stream_upload(&state.device, &mut multipart, &mut started).await {
        Ok(partition) => {
            info!("image staged in {}, restarting", partition.label);
            (StatusCode::OK, "OK").into_response()
        }
        Err(err) => {
            warn!("firmware upload failed: {err:#}");
            if started {
                if let Err(err) = state.device.call(DeviceCommand::UploadAbort).await {
                    warn!("failed to abort upload: {err:#}");
                }
            }
            (StatusCode::INTERNAL_SERVER_ERROR, "FAIL").into_response()
        }
    }
}

async fn stream_upload(
    device: &DeviceHandle,
    multipart: &mut Multipart,
    started: &mut bool,
) -> anyhow::Result<PartitionDescriptor> {
    let mut field = multipart
        .next_field()
        .await
        .context("malformed multipart body")?
        .context("upload carries no file part")?;
    let size = field
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok());
    info!(
        "upload of `{}` started ({})",
        field.file_name().unwrap_or("firmware.bin"),
        size.map_or_else(|| "size from stream".to_string(), |size| format!("{size} bytes"))
    );

    expect_upload(device.call(DeviceCommand::UploadStart { size }).await?)?;
    *started = true;
    while let Some(chunk) = field.chunk().await.context("upload interrupted")? {
        expect_upload(device.call(DeviceCommand::UploadChunk(chunk.to_vec())).await?)?;
    }

    match device.call(DeviceCommand::UploadFinish).await? {
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

fn push_body<T: DeserializeOwned>(state: &AppState, body: &[u8]) -> Result<T, OtaError> {
    if body.len() > state.max_push_body {
        return Err(OtaError::BadJson(format!(
            "body exceeds {} bytes",
            state.max_push_body
        )));
    }
    parse_request(body)
}

async fn push(state: &AppState, command: Result<DeviceCommand, OtaError>) -> Response {
    let reply = match command {
        Ok(command) => match query(state, command).await {
            Ok(DeviceReply::Push { reply, .. }) => reply,
            Ok(other) => return unexpected(other),
            Err(response) => return response,
        },
        Err(err) => PushReply::failed(&err),
    };
    let status =
        StatusCode::from_u16(reply.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply)).into_response()
}

async fn handle_ota_begin(State(state): State<AppState>, body: Bytes) -> Response {
    let command = push_body::<BeginRequest>(&state, &body)
        .map(|request| DeviceCommand::OtaBegin { size: request.size });
    push(&state, command).await
}

async fn handle_ota_write(State(state): State<AppState>, body: Bytes) -> Response {
    let command = push_body::<WriteRequest>(&state, &body).map(DeviceCommand::OtaWrite);
    push(&state, command).await
}

async fn handle_ota_end(State(state): State<AppState>, body: Bytes) -> Response {
    let command = push_body::<EndRequest>(&state, &body).map(DeviceCommand::OtaEnd);
    push(&state, command).await
}

async fn handle_identity_repair(
    State(state): State<AppState>,
    Json(request): Json<RepairRequest>,
) -> Response {
    match query(&state, DeviceCommand::RepairIdentity(request)).await {
        Ok(DeviceReply::Repair(reply)) => {
            let status = match reply.error.as_deref() {
                None => StatusCode::OK,
                Some("unauthorized" | "repair_disabled") => StatusCode::FORBIDDEN,
                Some("invalid_tag") => StatusCode::BAD_REQUEST,
                Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(reply)).into_response()
        }
        Ok(other) => unexpected(other),
        Err(response) => response,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn console_lines_map_to_characteristics() {
        assert_eq!(
            parse_console_line("ssid Lab Net"),
            Some(ConsoleInput::Write(Characteristic::Ssid, b"Lab Net".to_vec()))
        );
        assert_eq!(
            parse_console_line("hostmac AA:BB:CC:DD:EE:FF\r"),
            Some(ConsoleInput::Write(
                Characteristic::HostMac,
                b"AA:BB:CC:DD:EE:FF".to_vec()
            ))
        );
        assert_eq!(
            parse_console_line("commit"),
            Some(ConsoleInput::Write(Characteristic::Commit, Vec::new()))
        );
        assert_eq!(parse_console_line("press"), Some(ConsoleInput::Button(true)));
        assert_eq!(parse_console_line("reboot"), None);
    }

    #[test]
    fn committed_images_and_fallbacks_end_the_process() {
        assert_eq!(
            follow_up(&DeviceReply::Push {
                reply: PushReply::ok(),
                restart: true
            }),
            FollowUp::Restart
        );
        assert_eq!(
            follow_up(&DeviceReply::Failsafe(Some(
                FailsafeAction::FallbackToBootloader
            ))),
            FollowUp::Fallback
        );
        assert_eq!(
            follow_up(&DeviceReply::Failsafe(Some(FailsafeAction::Continue))),
            FollowUp::Nothing
        );
        assert_eq!(
            follow_up(&DeviceReply::Upload(Err(OtaError::NotInProgress))),
            FollowUp::Nothing
        );
    }
}
