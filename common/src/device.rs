use std::net::Ipv4Addr;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::{
    config::DeviceConfig,
    credentials::{
        CredentialError, KeyValueStore, MacAddress, WifiCredentialStore, WifiCredentials,
    },
    discovery::{
        Advertisement, BrokerAssignment, DiscoveryError, DiscoveryResponder, DiscoveryResponse,
    },
    failsafe::{execute_fallback, Actuator, Failsafe, FailsafeAction, FallbackReport},
    identity::{Delay, IdentityResult, IdentityTag, TagStore},
    ota::{EndRequest, OtaError, OtaSession, OtaTransport, PushReply, WriteRequest},
    partition::{FlashError, FlashPartitions, PartitionDescriptor, PartitionManager, SlotId},
    provisioning::factory_reset,
    types::{DeviceSnapshot, IdPayload, InfoPayload, RepairReply, RepairRequest, UNKNOWN_SENSOR},
};

/// Requests funnelled to the task that owns the device state.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    Info,
    Id,
    Snapshot,
    OtaBegin { size: u32 },
    OtaWrite(WriteRequest),
    OtaEnd(EndRequest),
    OtaAbort,
    UploadStart { size: Option<u32> },
    UploadChunk(Vec<u8>),
    UploadFinish,
    UploadAbort,
    Discovery(Vec<u8>),
    RepairIdentity(RepairRequest),
    Recheck,
    /// Long press on the reset button. The owner restarts afterwards.
    FactoryReset,
}

#[derive(Debug, Clone)]
pub enum DeviceReply {
    Info(InfoPayload),
    Id(IdPayload),
    Snapshot(Box<DeviceSnapshot>),
    /// Push-protocol reply. `restart` is set once an image is committed.
    Push { reply: PushReply, restart: bool },
    Upload(Result<(), OtaError>),
    /// Multipart upload finished; restart on success.
    UploadDone(Result<PartitionDescriptor, OtaError>),
    Discovery(Option<DiscoveryResponse>),
    Repair(RepairReply),
    Failsafe(Option<FailsafeAction>),
    FactoryReset(Result<(), CredentialError>),
}

/// Everything the bootloader mutates at runtime. Only the owning task
/// touches it; transports talk to it through [`DeviceCommand`].
pub struct DeviceContext<F, S, T, D> {
    config: DeviceConfig,
    partitions: PartitionManager<F>,
    failsafe: Failsafe<T, D>,
    ota: OtaSession,
    discovery: DiscoveryResponder<S>,
    wifi: WifiCredentialStore<S>,
    mac: MacAddress,
    ip: Option<Ipv4Addr>,
    action: FailsafeAction,
    between_chunks: fn(u32),
    actuator: Option<Box<dyn Actuator>>,
}

impl<F, S, T, D> DeviceContext<F, S, T, D>
where
    F: FlashPartitions,
    S: KeyValueStore + Clone,
    T: TagStore,
    D: Delay,
{
    pub fn new(
        config: DeviceConfig,
        partitions: PartitionManager<F>,
        failsafe: Failsafe<T, D>,
        store: S,
        mac: MacAddress,
    ) -> Self {
        Self {
            config,
            partitions,
            failsafe,
            ota: OtaSession::new(),
            discovery: DiscoveryResponder::new(store.clone()),
            wifi: WifiCredentialStore::new(store),
            mac,
            ip: None,
            action: FailsafeAction::StayInBootloader,
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

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn device_id(&self) -> String {
        self.mac.device_id()
    }

    pub fn action(&self) -> FailsafeAction {
        self.action
    }

    pub fn credentials(&self) -> Option<WifiCredentials> {
        self.wifi.load()
    }

    pub fn set_ip(&mut self, ip: Option<Ipv4Addr>) {
        self.ip = ip;
    }

    pub fn broker(&self) -> Option<&BrokerAssignment> {
        self.discovery.accepted()
    }

    pub fn boot(&mut self, now_ms: u64) -> Result<FailsafeAction, FlashError> {
        let hook = self.between_chunks;
        self.action = self.failsafe.boot(&mut self.partitions, now_ms, hook)?;
        Ok(self.action)
    }

    pub fn handle(&mut self, command: DeviceCommand, now_ms: u64) -> DeviceReply {
        match command {
            DeviceCommand::Info => DeviceReply::Info(InfoPayload {
                sensor_type: self.sensor_type(),
                sensor_id: self.device_id(),
            }),
            DeviceCommand::Id => DeviceReply::Id(IdPayload {
                id: self.sensor_type(),
            }),
            DeviceCommand::Snapshot => DeviceReply::Snapshot(Box::new(self.snapshot(now_ms))),
            DeviceCommand::OtaBegin { size } => {
                let hook = self.between_chunks;
                let result = self.ota.begin(&mut self.partitions, size, hook);
                push_reply(&result, false)
            }
            DeviceCommand::OtaWrite(request) => {
                let result = self
                    .ota
                    .check_owner(OtaTransport::Push)
                    .and_then(|()| request.decode())
                    .and_then(|chunk| {
                        self.ota
                            .write(&mut self.partitions, request.offset, &chunk, request.size)
                    });
                push_reply(&result, false)
            }
            DeviceCommand::OtaEnd(request) => {
                let result = self.ota.check_owner(OtaTransport::Push).and_then(|()| {
                    self.ota
                        .end(&mut self.partitions, request.sha256.as_deref())
                });
                push_reply(&result, result.is_ok())
            }
            DeviceCommand::OtaAbort => {
                let result = self.abort_owned(OtaTransport::Push);
                push_reply(&result, false)
            }
            DeviceCommand::UploadStart { size } => {
                let hook = self.between_chunks;
                DeviceReply::Upload(self.ota.begin_upload(&mut self.partitions, size, hook))
            }
            DeviceCommand::UploadChunk(chunk) => {
                let result = self.ota.check_owner(OtaTransport::Upload).and_then(|()| {
                    let offset = self.ota.progress().bytes_written;
                    self.ota
                        .write(&mut self.partitions, offset, &chunk, chunk.len())
                        .map(|_| ())
                });
                DeviceReply::Upload(result)
            }
            DeviceCommand::UploadFinish => {
                let result = self
                    .ota
                    .check_owner(OtaTransport::Upload)
                    .and_then(|()| self.ota.end(&mut self.partitions, None));
                DeviceReply::UploadDone(result)
            }
            DeviceCommand::UploadAbort => {
                DeviceReply::Upload(self.abort_owned(OtaTransport::Upload))
            }
            DeviceCommand::Discovery(packet) => DeviceReply::Discovery(self.discover(&packet)),
            DeviceCommand::RepairIdentity(request) => DeviceReply::Repair(self.repair(request)),
            DeviceCommand::Recheck => {
                let running = match self.partitions.running() {
                    Ok(running) => running.slot,
                    Err(err) => {
                        warn!("recheck skipped: {err}");
                        return DeviceReply::Failsafe(None);
                    }
                };
                let action = self.failsafe.poll(now_ms, running);
                if let Some(action) = action {
                    self.action = action;
                }
                DeviceReply::Failsafe(action)
            }
            DeviceCommand::FactoryReset => DeviceReply::FactoryReset(factory_reset(&self.wifi)),
        }
    }

    fn abort_owned(&mut self, transport: OtaTransport) -> Result<(), OtaError> {
        self.ota.check_owner(transport)?;
        self.ota.abort();
        Ok(())
    }

    fn sensor_type(&self) -> String {
        match self.failsafe.identity() {
            IdentityResult::Present(tag) => tag.to_string(),
            IdentityResult::Absent => UNKNOWN_SENSOR.to_string(),
        }
    }

    fn snapshot(&self, now_ms: u64) -> DeviceSnapshot {
        let running = self.partitions.running().map(|p| p.slot);
        DeviceSnapshot {
            device_id: self.device_id(),
            firmware_version: self.config.network.firmware_version.clone(),
            running_slot: running.unwrap_or(SlotId::A),
            boot_slot: self.partitions.boot().ok().map(|p| p.slot),
            identity: self.failsafe.identity().tag(),
            failsafe: self.action,
            ip_address: self.ip.map(|ip| ip.to_string()),
            wifi_ssid: self.wifi.load().map(|creds| creds.ssid().to_string()),
            broker: self.discovery.accepted().cloned(),
            ota: self.ota.progress(),
            uptime_ms: now_ms,
        }
    }

    fn advertisement(&self) -> Advertisement {
        let identity = self.failsafe.identity();
        Advertisement {
            device_id: self.device_id(),
            ip_address: self.ip.unwrap_or(Ipv4Addr::UNSPECIFIED).to_string(),
            firmware_version: self.config.network.firmware_version.clone(),
            sensor_type: self.sensor_type(),
            available: identity.tag().is_some() && !self.ota.is_open(),
        }
    }

    fn discover(&mut self, packet: &[u8]) -> Option<DiscoveryResponse> {
        let advertisement = self.advertisement();
        match self.discovery.handle(packet, &advertisement) {
            Ok(handled) => {
                debug!("discovery handled: {:?}", handled.broker);
                Some(handled.response)
            }
            Err(DiscoveryError::NotDiscovery) => None,
            Err(err) => {
                warn!("discovery request dropped: {err}");
                None
            }
        }
    }

    fn repair(&mut self, request: RepairRequest) -> RepairReply {
        let failed = |error: &str| RepairReply {
            success: false,
            tag: None,
            error: Some(error.to_string()),
        };

        if self.config.repair_token.is_empty() {
            return failed("repair_disabled");
        }
        if !tokens_match(&request.token, &self.config.repair_token) {
            warn!("identity repair rejected: bad token");
            return failed("unauthorized");
        }
        let tag = match IdentityTag::parse(request.tag.trim()) {
            Ok(tag) => tag,
            Err(_) => return failed("invalid_tag"),
        };

        match self.failsafe.gate_mut().repair(tag) {
            Ok(tag) => {
                self.failsafe.note_repaired(tag);
                if self.action == FailsafeAction::StayInBootloader {
                    self.action = FailsafeAction::Continue;
                }
                info!("identity repaired to {tag}");
                RepairReply {
                    success: true,
                    tag: Some(tag.to_string()),
                    error: None,
                }
            }
            Err(err) => {
                warn!("identity repair failed: {err}");
                failed("repair_failed")
            }
        }
    }

    /// Selects slot A, wipes slot B and restarts. Only meaningful while
    /// running from the application slot.
    pub fn fall_back(&mut self) -> ! {
        if let Err(err) = self.prepare_fallback().result {
            warn!("fallback finished with error: {err}");
        }
        self.partitions.restart()
    }

    /// Everything [`DeviceContext::fall_back`] does short of restarting.
    pub fn prepare_fallback(&mut self) -> FallbackReport {
        self.ota.abort();
        let hook = self.between_chunks;
        execute_fallback(
            &mut self.partitions,
            self.actuator.take(),
            &self.config.failsafe,
            hook,
        )
    }

    pub fn restart(&mut self) -> ! {
        self.partitions.restart()
    }
}

/// Compares digests so the time taken does not depend on where the tokens
/// first differ.
fn tokens_match(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given
        .iter()
        .zip(expected.iter())
        .fold(0_u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

fn push_reply<T>(result: &Result<T, OtaError>, restart: bool) -> DeviceReply {
    DeviceReply::Push {
        reply: PushReply::from(result),
        restart,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        failsafe::{ShutdownOutcome, TagPolicy},
        identity::IdentityGate,
        ota::ChunkEncoding,
        partition::ESP_IMAGE_MAGIC,
        sim::{MemoryStore, RecordingDelay, SimActuator, SimEeprom, SimFlash},
    };
    use pretty_assertions::assert_eq;

    type TestContext = DeviceContext<SimFlash, MemoryStore, SimEeprom, RecordingDelay>;

    fn context(eeprom: SimEeprom, config: DeviceConfig) -> TestContext {
        let gate = IdentityGate::new(eeprom, RecordingDelay::default(), &config.identity);
        let failsafe = Failsafe::new(gate, TagPolicy::AnyPresent, &config.failsafe);
        let mut ctx = DeviceContext::new(
            config,
            PartitionManager::new(SimFlash::new(SlotId::A, 64 * 1024)),
            failsafe,
            MemoryStore::default(),
            "24:6F:28:A2:AB:9F".parse().unwrap(),
        );
        ctx.set_ip(Some(Ipv4Addr::new(192, 168, 137, 15)));
        ctx
    }

    fn push(reply: DeviceReply) -> (PushReply, bool) {
        match reply {
            DeviceReply::Push { reply, restart } => (reply, restart),
            other => panic!("expected push reply, got {other:?}"),
        }
    }

    fn chunk(offset: u32, bytes: &[u8]) -> DeviceCommand {
        DeviceCommand::OtaWrite(WriteRequest {
            offset,
            size: bytes.len(),
            data: hex::encode(bytes),
            encoding: ChunkEncoding::Hex,
        })
    }

    #[test]
    fn push_protocol_stages_and_commits_image() {
        let mut ctx = context(SimEeprom::with_tag(b"TOF"), DeviceConfig::default());
        assert_eq!(ctx.boot(0).unwrap(), FailsafeAction::Continue);

        let mut image = vec![0x5A_u8; 1024];
        image[0] = ESP_IMAGE_MAGIC;

        let (reply, _) = push(ctx.handle(DeviceCommand::OtaBegin { size: 1024 }, 10));
        assert_eq!(reply, PushReply::ok());
        assert_eq!(push(ctx.handle(chunk(0, &image[..512]), 11)).0, PushReply::ok());
        assert_eq!(push(ctx.handle(chunk(512, &image[512..]), 12)).0, PushReply::ok());
        let (reply, restart) = push(ctx.handle(DeviceCommand::OtaEnd(EndRequest::default()), 13));

        assert_eq!(reply, PushReply::ok());
        assert!(restart);
        assert_eq!(ctx.partitions.flash().boot_slot().unwrap(), SlotId::B);
        assert_eq!(&ctx.partitions.flash().image(SlotId::B)[..1024], image.as_slice());
    }

    #[test]
    fn out_of_order_push_is_rejected() {
        let mut ctx = context(SimEeprom::with_tag(b"TOF"), DeviceConfig::default());

        let (reply, _) = push(ctx.handle(chunk(0, &[1, 2, 3]), 0));
        assert_eq!(reply.error, Some("not_in_progress"));

        ctx.handle(DeviceCommand::OtaBegin { size: 8 }, 0);
        let (reply, _) = push(ctx.handle(chunk(4, &[1, 2, 3, 4]), 0));
        assert_eq!(reply.error, Some("offset_mismatch"));
        assert!(ctx.ota.is_open());
    }

    #[test]
    fn streaming_upload_uses_stream_length() {
        let mut ctx = context(SimEeprom::with_tag(b"THR"), DeviceConfig::default());
        let mut image = vec![0_u8; 300];
        image[0] = ESP_IMAGE_MAGIC;

        assert!(matches!(
            ctx.handle(DeviceCommand::UploadStart { size: None }, 0),
            DeviceReply::Upload(Ok(()))
        ));
        for part in image.chunks(128) {
            assert!(matches!(
                ctx.handle(DeviceCommand::UploadChunk(part.to_vec()), 0),
                DeviceReply::Upload(Ok(()))
            ));
        }
        match ctx.handle(DeviceCommand::UploadFinish, 0) {
            DeviceReply::UploadDone(Ok(partition)) => assert_eq!(partition.slot, SlotId::B),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn push_requests_cannot_touch_an_upload_in_flight() {
        let mut ctx = context(SimEeprom::with_tag(b"THR"), DeviceConfig::default());
        let mut fragment = vec![0x11_u8; 128];
        fragment[0] = ESP_IMAGE_MAGIC;

        ctx.handle(DeviceCommand::UploadStart { size: None }, 0);
        ctx.handle(DeviceCommand::UploadChunk(fragment.clone()), 0);

        let (reply, restart) = push(ctx.handle(DeviceCommand::OtaEnd(EndRequest::default()), 1));
        assert!(!reply.success);
        assert_eq!(reply.error, Some("not_in_progress"));
        assert!(!restart);
        let (reply, _) = push(ctx.handle(chunk(128, &fragment), 2));
        assert_eq!(reply.error, Some("not_in_progress"));
        let (reply, _) = push(ctx.handle(DeviceCommand::OtaAbort, 3));
        assert_eq!(reply.error, Some("not_in_progress"));
        let (reply, _) = push(ctx.handle(DeviceCommand::OtaBegin { size: 128 }, 4));
        assert_eq!(reply.error, Some("already_in_progress"));

        assert_eq!(ctx.partitions.flash().boot_slot().unwrap(), SlotId::A);
        assert_eq!(ctx.ota.progress().bytes_written, 128);
    }

    #[test]
    fn upload_commands_cannot_touch_a_push_session() {
        let mut ctx = context(SimEeprom::with_tag(b"THR"), DeviceConfig::default());
        push(ctx.handle(DeviceCommand::OtaBegin { size: 256 }, 0));

        assert!(matches!(
            ctx.handle(DeviceCommand::UploadChunk(vec![ESP_IMAGE_MAGIC; 256]), 1),
            DeviceReply::Upload(Err(OtaError::NotInProgress))
        ));
        assert!(matches!(
            ctx.handle(DeviceCommand::UploadFinish, 2),
            DeviceReply::UploadDone(Err(OtaError::NotInProgress))
        ));
        assert!(matches!(
            ctx.handle(DeviceCommand::UploadAbort, 3),
            DeviceReply::Upload(Err(OtaError::NotInProgress))
        ));
        assert!(ctx.ota.is_open());
    }

    #[test]
    fn fallback_parks_the_actuator_before_wiping() {
        let mut ctx = context(SimEeprom::with_tag(b"THR"), DeviceConfig::default());
        ctx.partitions = PartitionManager::new(SimFlash::new(SlotId::B, 64 * 1024));
        let actuator = SimActuator::default();
        ctx.set_actuator(actuator.clone());
        push(ctx.handle(DeviceCommand::OtaBegin { size: 64 }, 0));

        let report = ctx.prepare_fallback();

        assert_eq!(report.shutdown, Some(ShutdownOutcome::Homed));
        assert_eq!(report.result, Ok(()));
        assert_eq!(actuator.homed(), 1);
        assert!(!ctx.ota.is_open());
        assert_eq!(ctx.partitions.flash().boot_slot().unwrap(), SlotId::A);
    }

    #[test]
    fn info_and_id_follow_identity() {
        let mut ctx = context(SimEeprom::with_tag(b"ULT"), DeviceConfig::default());
        ctx.boot(0).unwrap();

        match ctx.handle(DeviceCommand::Info, 0) {
            DeviceReply::Info(info) => {
                assert_eq!(info.sensor_type, "ULT");
                assert_eq!(info.sensor_id, "2AB9F");
            }
            other => panic!("unexpected reply {other:?}"),
        }
        match ctx.handle(DeviceCommand::Id, 0) {
            DeviceReply::Id(id) => assert_eq!(id.id, "ULT"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn discovery_reply_advertises_device() {
        let mut ctx = context(SimEeprom::with_tag(b"TOF"), DeviceConfig::default());
        ctx.boot(0).unwrap();

        let reply = match ctx.handle(DeviceCommand::Discovery(b"LABEXPERT_DISCOVERY".to_vec()), 0)
        {
            DeviceReply::Discovery(Some(reply)) => reply,
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(reply.device_id, "2AB9F");
        assert_eq!(reply.ip_address, "192.168.137.15");
        assert_eq!(reply.firmware_version, "OTA_BOOTLOADER");
        assert_eq!(reply.availability, 1);

        assert!(matches!(
            ctx.handle(DeviceCommand::Discovery(b"hello".to_vec()), 0),
            DeviceReply::Discovery(None)
        ));
    }

    #[test]
    fn repair_requires_token() {
        let mut config = DeviceConfig::default();
        config.repair_token = "s3cret".into();
        let mut ctx = context(SimEeprom::default(), config);
        assert_eq!(ctx.boot(0).unwrap(), FailsafeAction::StayInBootloader);

        let request = |token: &str| {
            DeviceCommand::RepairIdentity(RepairRequest {
                tag: "THR".into(),
                token: token.into(),
            })
        };

        match ctx.handle(request("guess"), 0) {
            DeviceReply::Repair(reply) => assert_eq!(reply.error.as_deref(), Some("unauthorized")),
            other => panic!("unexpected reply {other:?}"),
        }
        match ctx.handle(request("s3cret"), 0) {
            DeviceReply::Repair(reply) => assert_eq!(reply.tag.as_deref(), Some("THR")),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(ctx.action(), FailsafeAction::Continue);
    }

    #[test]
    fn token_check_needs_the_whole_token() {
        assert!(tokens_match("s3cret", "s3cret"));
        for given in ["", "s3cre", "s3cret ", "S3CRET", "s3cret\0"] {
            assert!(!tokens_match(given, "s3cret"), "{given:?}");
        }
    }

    #[test]
    fn factory_reset_forgets_network() {
        let mut ctx = context(SimEeprom::with_tag(b"TOF"), DeviceConfig::default());
        ctx.wifi
            .save(&WifiCredentials::new("LabNet", "12345678").unwrap(), None)
            .unwrap();
        assert!(ctx.credentials().is_some());

        assert!(matches!(
            ctx.handle(DeviceCommand::FactoryReset, 0),
            DeviceReply::FactoryReset(Ok(()))
        ));
        assert_eq!(ctx.credentials(), None);
    }

    #[test]
    fn repair_is_disabled_without_token() {
        let mut ctx = context(SimEeprom::default(), DeviceConfig::default());

        match ctx.handle(
            DeviceCommand::RepairIdentity(RepairRequest {
                tag: "THR".into(),
                token: String::new(),
            }),
            0,
        ) {
            DeviceReply::Repair(reply) => {
                assert_eq!(reply.error.as_deref(), Some("repair_disabled"))
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
