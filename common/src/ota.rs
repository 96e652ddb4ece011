use base64::Engine as _;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::partition::{
    EraseError, FlashError, FlashPartitions, PartitionDescriptor, PartitionManager, SlotId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    Idle,
    InProgress,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("an update session is already open")]
    AlreadyInProgress,
    #[error("image size {size} is outside 1..={capacity}")]
    InvalidSize { size: u32, capacity: u32 },
    #[error("no update session is open")]
    NotInProgress,
    #[error("chunk is {actual} bytes but {declared} were declared")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("chunk offset {got} does not continue at {expected}")]
    OffsetMismatch { expected: u32, got: u32 },
    #[error("chunk would grow the image to {would_reach} of {expected_size} bytes")]
    Overflow { expected_size: u32, would_reach: u64 },
    #[error("flash accepted {written} of {len} bytes")]
    FlashWrite { written: usize, len: usize },
    #[error("image incomplete: {written} of {expected} bytes")]
    Incomplete { written: u32, expected: u32 },
    #[error("image sha256 does not match")]
    DigestMismatch,
    #[error("image verification failed: {0}")]
    VerifyFailed(#[source] FlashError),
    #[error("could not prepare target partition: {0}")]
    EraseFailed(#[source] EraseError),
    #[error("partition table error: {0}")]
    Partition(#[from] FlashError),
    #[error("malformed request: {0}")]
    BadJson(String),
    #[error("chunk data is not valid hex")]
    BadHex,
    #[error("chunk data is not valid base64")]
    BadBase64,
}

impl OtaError {
    /// Stable error code carried in push-protocol replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInProgress => "already_in_progress",
            Self::InvalidSize { .. } => "invalid_size",
            Self::NotInProgress => "not_in_progress",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::Overflow { .. } => "overflow",
            Self::FlashWrite { .. } => "flash_write",
            Self::Incomplete { .. } => "incomplete",
            Self::DigestMismatch => "digest_mismatch",
            Self::VerifyFailed(_) => "verify_failed",
            Self::EraseFailed(_) => "erase_failed",
            Self::Partition(_) => "partition_error",
            Self::BadJson(_) => "bad_json",
            Self::BadHex => "bad_hex",
            Self::BadBase64 => "bad_base64",
        }
    }

    /// Device-side failures, as opposed to a malformed or out-of-order
    /// request.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            Self::FlashWrite { .. }
                | Self::VerifyFailed(_)
                | Self::EraseFailed(_)
                | Self::Partition(_)
        )
    }
}

/// Which transport opened a session. Only that transport may feed, finish
/// or abort it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaTransport {
    /// JSON begin/write/end requests.
    Push,
    /// Multipart `/update` body.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OtaProgress {
    pub state: OtaState,
    pub expected_size: u32,
    pub bytes_written: u32,
}

/// One firmware transfer into the inactive slot. Chunk-level rejections
/// leave the session open; integrity failures abort it.
pub struct OtaSession {
    state: OtaState,
    target: Option<SlotId>,
    transport: OtaTransport,
    expected_size: u32,
    bytes_written: u32,
    open_ended: bool,
    hasher: Sha256,
}

impl Default for OtaSession {
    fn default() -> Self {
        Self {
            state: OtaState::Idle,
            target: None,
            transport: OtaTransport::Push,
            expected_size: 0,
            bytes_written: 0,
            open_ended: false,
            hasher: Sha256::new(),
        }
    }
}

impl OtaSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == OtaState::InProgress
    }

    /// Transport that owns the open session, if any.
    pub fn transport(&self) -> Option<OtaTransport> {
        self.is_open().then_some(self.transport)
    }

    /// `Ok` when nothing is open or `transport` owns the open session.
    pub fn check_owner(&self, transport: OtaTransport) -> Result<(), OtaError> {
        match self.transport() {
            Some(owner) if owner != transport => Err(OtaError::NotInProgress),
            _ => Ok(()),
        }
    }

    pub fn progress(&self) -> OtaProgress {
        OtaProgress {
            state: self.state,
            expected_size: self.expected_size,
            bytes_written: self.bytes_written,
        }
    }

    /// Opens a session for an image of exactly `expected_size` bytes. The
    /// inactive slot is erased before the session opens.
    pub fn begin<F: FlashPartitions>(
        &mut self,
        partitions: &mut PartitionManager<F>,
        expected_size: u32,
        between_chunks: impl FnMut(u32),
    ) -> Result<(), OtaError> {
        self.open(partitions, OtaTransport::Push, Some(expected_size), between_chunks)
    }

    /// Upload counterpart of [`OtaSession::begin`]. A `None` size opens a
    /// session whose length is only known once the stream ends, bounded by
    /// the slot capacity.
    pub fn begin_upload<F: FlashPartitions>(
        &mut self,
        partitions: &mut PartitionManager<F>,
        expected_size: Option<u32>,
        between_chunks: impl FnMut(u32),
    ) -> Result<(), OtaError> {
        self.open(partitions, OtaTransport::Upload, expected_size, between_chunks)
    }

    fn open<F: FlashPartitions>(
        &mut self,
        partitions: &mut PartitionManager<F>,
        transport: OtaTransport,
        expected_size: Option<u32>,
        between_chunks: impl FnMut(u32),
    ) -> Result<(), OtaError> {
        if self.is_open() {
            return Err(OtaError::AlreadyInProgress);
        }

        let target = partitions.inactive()?;
        let size = expected_size.unwrap_or(target.size);
        if size == 0 || size > target.size {
            return Err(OtaError::InvalidSize {
                size,
                capacity: target.size,
            });
        }

        if let Err(err) = partitions.erase(&target, between_chunks) {
            warn!("ota begin: {err}");
            self.reset(OtaState::Aborted);
            return Err(OtaError::EraseFailed(err));
        }

        self.reset(OtaState::InProgress);
        self.target = Some(target.slot);
        self.transport = transport;
        self.expected_size = size;
        self.open_ended = expected_size.is_none();
        if self.open_ended {
            info!("ota session open: streaming up to {size} bytes into {}", target.label);
        } else {
            info!("ota session open: {size} bytes into {}", target.label);
        }
        Ok(())
    }

    /// Appends `chunk` at `offset`, which must equal the bytes written so
    /// far. Returns the new total.
    pub fn write<F: FlashPartitions>(
        &mut self,
        partitions: &mut PartitionManager<F>,
        offset: u32,
        chunk: &[u8],
        declared_size: usize,
    ) -> Result<u32, OtaError> {
        let Some(target) = self.target.filter(|_| self.is_open()) else {
            return Err(OtaError::NotInProgress);
        };
        if chunk.len() != declared_size {
            return Err(OtaError::SizeMismatch {
                declared: declared_size,
                actual: chunk.len(),
            });
        }
        if offset != self.bytes_written {
            return Err(OtaError::OffsetMismatch {
                expected: self.bytes_written,
                got: offset,
            });
        }

        let would_reach = u64::from(self.bytes_written) + chunk.len() as u64;
        if would_reach > u64::from(self.expected_size) {
            warn!("ota write overflows the declared image, aborting");
            self.reset(OtaState::Aborted);
            return Err(OtaError::Overflow {
                expected_size: self.expected_size,
                would_reach,
            });
        }

        let written = match partitions.flash_mut().write(target, offset, chunk) {
            Ok(written) => written,
            Err(err) => {
                warn!("ota flash write failed: {err}");
                0
            }
        };
        if written != chunk.len() {
            self.reset(OtaState::Aborted);
            return Err(OtaError::FlashWrite {
                written,
                len: chunk.len(),
            });
        }

        self.hasher.update(chunk);
        // would_reach <= expected_size, so it fits in u32
        self.bytes_written = would_reach as u32;
        Ok(self.bytes_written)
    }

    /// Verifies the staged image and selects it for the next boot. Any
    /// failure aborts the session and leaves the boot slot alone.
    pub fn end<F: FlashPartitions>(
        &mut self,
        partitions: &mut PartitionManager<F>,
        expected_sha256: Option<&str>,
    ) -> Result<PartitionDescriptor, OtaError> {
        let Some(target) = self.target.filter(|_| self.is_open()) else {
            return Err(OtaError::NotInProgress);
        };

        let result = self.finish(partitions, target, expected_sha256);
        match &result {
            Ok(partition) => {
                info!(
                    "ota committed: {} bytes, next boot {}",
                    self.bytes_written, partition.label
                );
                self.state = OtaState::Committed;
            }
            Err(err) => {
                warn!("ota end failed: {err}");
                self.reset(OtaState::Aborted);
            }
        }
        result
    }

    fn finish<F: FlashPartitions>(
        &mut self,
        partitions: &mut PartitionManager<F>,
        target: SlotId,
        expected_sha256: Option<&str>,
    ) -> Result<PartitionDescriptor, OtaError> {
        if self.open_ended && self.bytes_written > 0 {
            self.expected_size = self.bytes_written;
        }
        if self.bytes_written == 0 || self.bytes_written != self.expected_size {
            return Err(OtaError::Incomplete {
                written: self.bytes_written,
                expected: self.expected_size,
            });
        }

        let digest = std::mem::take(&mut self.hasher).finalize();
        if let Some(expected) = expected_sha256.map(str::trim).filter(|s| !s.is_empty()) {
            let expected = hex::decode(expected).map_err(|_| OtaError::BadHex)?;
            if expected.as_slice() != digest.as_slice() {
                return Err(OtaError::DigestMismatch);
            }
        }

        partitions
            .flash_mut()
            .verify_image(target, self.bytes_written)
            .map_err(OtaError::VerifyFailed)?;

        let partition = partitions.inactive()?;
        if partition.slot != target {
            return Err(OtaError::VerifyFailed(FlashError::InvalidImage(
                target.label(),
            )));
        }
        partitions
            .set_boot_partition(&partition)
            .map_err(OtaError::VerifyFailed)?;
        Ok(partition)
    }

    pub fn abort(&mut self) {
        if self.is_open() {
            warn!(
                "ota session aborted at {}/{} bytes",
                self.bytes_written, self.expected_size
            );
        }
        self.reset(OtaState::Aborted);
    }

    fn reset(&mut self, state: OtaState) {
        self.state = state;
        self.target = None;
        self.transport = OtaTransport::Push;
        self.expected_size = 0;
        self.bytes_written = 0;
        self.open_ended = false;
        self.hasher = Sha256::new();
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeginRequest {
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkEncoding {
    #[default]
    Hex,
    Base64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub offset: u32,
    pub size: usize,
    pub data: String,
    #[serde(default)]
    pub encoding: ChunkEncoding,
}

impl WriteRequest {
    pub fn decode(&self) -> Result<Vec<u8>, OtaError> {
        let data = self.data.trim();
        match self.encoding {
            ChunkEncoding::Hex => hex::decode(data).map_err(|_| OtaError::BadHex),
            ChunkEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|_| OtaError::BadBase64),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndRequest {
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Parses a push-protocol body. An empty body is accepted for requests
/// whose fields all have defaults.
pub fn parse_request<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, OtaError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|err| OtaError::BadJson(err.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip)]
    pub device_fault: bool,
}

impl PushReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            device_fault: false,
        }
    }

    pub fn failed(err: &OtaError) -> Self {
        Self {
            success: false,
            error: Some(err.code()),
            device_fault: err.is_device_fault(),
        }
    }

    /// 400 for request errors, 500 when the device itself failed.
    pub fn http_status(&self) -> u16 {
        match (self.success, self.device_fault) {
            (true, _) => 200,
            (false, false) => 400,
            (false, true) => 500,
        }
    }
}

impl<T> From<&Result<T, OtaError>> for PushReply {
    fn from(result: &Result<T, OtaError>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(err) => Self::failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::ERASE_CHUNK_BYTES;
    use crate::sim::{FlashOp, SimFlash};
    use pretty_assertions::assert_eq;

    fn manager() -> PartitionManager<SimFlash> {
        PartitionManager::new(SimFlash::new(SlotId::A, ERASE_CHUNK_BYTES))
    }

    fn image(len: usize) -> Vec<u8> {
        let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        image[0] = crate::partition::ESP_IMAGE_MAGIC;
        image
    }

    #[test]
    fn two_chunk_image_commits_to_inactive_slot() {
        let mut partitions = manager();
        let mut session = OtaSession::new();
        let image = image(1024);

        session.begin(&mut partitions, 1024, |_| {}).unwrap();
        assert_eq!(session.write(&mut partitions, 0, &image[..512], 512), Ok(512));
        assert_eq!(session.write(&mut partitions, 512, &image[512..], 512), Ok(1024));
        let committed = session.end(&mut partitions, None).unwrap();

        assert_eq!(committed.slot, SlotId::B);
        assert_eq!(session.state(), OtaState::Committed);
        assert_eq!(partitions.flash().boot_slot().unwrap(), SlotId::B);
        assert_eq!(&partitions.flash().image(SlotId::B)[..1024], image.as_slice());
    }

    #[test]
    fn begin_erases_before_opening() {
        let mut partitions = manager();
        let mut session = OtaSession::new();

        session.begin(&mut partitions, 100, |_| {}).unwrap();

        assert_eq!(
            partitions.flash().ops,
            vec![FlashOp::Erase {
                slot: SlotId::B,
                offset: 0,
                len: ERASE_CHUNK_BYTES
            }]
        );
        assert_eq!(
            session.begin(&mut partitions, 100, |_| {}),
            Err(OtaError::AlreadyInProgress)
        );
    }

    #[test]
    fn write_and_end_without_session_change_nothing() {
        let mut partitions = manager();
        let mut session = OtaSession::new();

        assert_eq!(
            session.write(&mut partitions, 0, &[1, 2], 2),
            Err(OtaError::NotInProgress)
        );
        assert_eq!(
            session.end(&mut partitions, None).unwrap_err(),
            OtaError::NotInProgress
        );
        assert!(partitions.flash().ops.is_empty());
        assert_eq!(partitions.flash().boot_slot().unwrap(), SlotId::A);
    }

    #[test]
    fn size_mismatch_does_not_advance() {
        let mut partitions = manager();
        let mut session = OtaSession::new();
        session.begin(&mut partitions, 16, |_| {}).unwrap();

        let err = session.write(&mut partitions, 0, &[0xE9; 8], 7).unwrap_err();

        assert_eq!(
            err,
            OtaError::SizeMismatch {
                declared: 7,
                actual: 8
            }
        );
        assert_eq!(err.code(), "size_mismatch");
        assert_eq!(session.progress().bytes_written, 0);
        assert!(session.is_open());
    }

    #[test]
    fn out_of_order_offset_is_rejected_but_session_survives() {
        let mut partitions = manager();
        let mut session = OtaSession::new();
        session.begin(&mut partitions, 16, |_| {}).unwrap();
        session.write(&mut partitions, 0, &[0xE9; 8], 8).unwrap();

        assert_eq!(
            session.write(&mut partitions, 0, &[0; 8], 8),
            Err(OtaError::OffsetMismatch {
                expected: 8,
                got: 0
            })
        );
        assert_eq!(session.write(&mut partitions, 8, &[0; 8], 8), Ok(16));
    }

    #[test]
    fn overflow_aborts() {
        let mut partitions = manager();
        let mut session = OtaSession::new();
        session.begin(&mut partitions, 4, |_| {}).unwrap();

        let err = session.write(&mut partitions, 0, &[0xE9; 8], 8).unwrap_err();

        assert_eq!(err.code(), "overflow");
        assert_eq!(session.state(), OtaState::Aborted);
    }

    #[test]
    fn partial_flash_write_aborts() {
        let mut partitions = manager();
        partitions.flash_mut().write_limit = Some(3);
        let mut session = OtaSession::new();
        session.begin(&mut partitions, 8, |_| {}).unwrap();

        assert_eq!(
            session.write(&mut partitions, 0, &[0xE9; 8], 8),
            Err(OtaError::FlashWrite { written: 3, len: 8 })
        );
        assert_eq!(session.state(), OtaState::Aborted);
    }

    #[test]
    fn end_checks_completeness_and_digest() {
        let mut partitions = manager();
        let mut session = OtaSession::new();
        let image = image(64);

        session.begin(&mut partitions, 64, |_| {}).unwrap();
        session.write(&mut partitions, 0, &image[..32], 32).unwrap();
        assert_eq!(
            session.end(&mut partitions, None).unwrap_err(),
            OtaError::Incomplete {
                written: 32,
                expected: 64
            }
        );
        assert_eq!(session.state(), OtaState::Aborted);

        session.begin(&mut partitions, 64, |_| {}).unwrap();
        session.write(&mut partitions, 0, &image, 64).unwrap();
        let wrong = hex::encode([0_u8; 32]);
        assert_eq!(
            session.end(&mut partitions, Some(&wrong)).unwrap_err(),
            OtaError::DigestMismatch
        );
        assert_eq!(partitions.flash().boot_slot().unwrap(), SlotId::A);

        session.begin(&mut partitions, 64, |_| {}).unwrap();
        session.write(&mut partitions, 0, &image, 64).unwrap();
        let right = hex::encode(Sha256::digest(&image));
        assert!(session.end(&mut partitions, Some(&right)).is_ok());
    }

    #[test]
    fn image_without_magic_fails_verification() {
        let mut partitions = manager();
        let mut session = OtaSession::new();

        session.begin(&mut partitions, 4, |_| {}).unwrap();
        session.write(&mut partitions, 0, &[0, 1, 2, 3], 4).unwrap();
        let err = session.end(&mut partitions, None).unwrap_err();

        assert_eq!(err.code(), "verify_failed");
        assert_eq!(partitions.flash().boot_slot().unwrap(), SlotId::A);
    }

    #[test]
    fn begin_rejects_zero_and_oversized_images() {
        let mut partitions = manager();
        let mut session = OtaSession::new();

        assert_eq!(
            session.begin(&mut partitions, 0, |_| {}).unwrap_err().code(),
            "invalid_size"
        );
        assert_eq!(
            session
                .begin(&mut partitions, ERASE_CHUNK_BYTES + 1, |_| {})
                .unwrap_err()
                .code(),
            "invalid_size"
        );
        assert_eq!(session.state(), OtaState::Idle);
    }

    #[test]
    fn erase_failure_aborts_begin() {
        let mut partitions = manager();
        partitions.flash_mut().fail_erase_at = Some(0);
        let mut session = OtaSession::new();

        let err = session.begin(&mut partitions, 16, |_| {}).unwrap_err();

        assert_eq!(err.code(), "erase_failed");
        assert_eq!(session.state(), OtaState::Aborted);
    }

    #[test]
    fn streaming_session_takes_size_from_stream() {
        let mut partitions = manager();
        let mut session = OtaSession::new();
        let image = image(300);

        session.begin_upload(&mut partitions, None, |_| {}).unwrap();
        session.write(&mut partitions, 0, &image, 300).unwrap();
        session.end(&mut partitions, None).unwrap();

        assert_eq!(session.progress().expected_size, 300);
        assert_eq!(partitions.flash().boot_slot().unwrap(), SlotId::B);
    }

    #[test]
    fn session_remembers_its_transport() {
        let mut partitions = manager();
        let mut session = OtaSession::new();
        assert_eq!(session.check_owner(OtaTransport::Push), Ok(()));

        session.begin_upload(&mut partitions, None, |_| {}).unwrap();
        assert_eq!(session.transport(), Some(OtaTransport::Upload));
        assert_eq!(session.check_owner(OtaTransport::Upload), Ok(()));
        assert_eq!(
            session.check_owner(OtaTransport::Push),
            Err(OtaError::NotInProgress)
        );

        session.abort();
        assert_eq!(session.transport(), None);
        assert_eq!(session.check_owner(OtaTransport::Push), Ok(()));
    }

    #[test]
    fn push_requests_decode_both_encodings() {
        let hex: WriteRequest =
            parse_request(br#"{"offset":0,"size":3,"data":"e9AB01"}"#).unwrap();
        assert_eq!(hex.decode().unwrap(), vec![0xE9, 0xAB, 0x01]);

        let b64: WriteRequest =
            parse_request(br#"{"offset":0,"size":3,"data":"6asB","encoding":"base64"}"#)
                .unwrap();
        assert_eq!(b64.decode().unwrap(), vec![0xE9, 0xAB, 0x01]);

        let bad: WriteRequest = parse_request(br#"{"size":1,"data":"zz"}"#).unwrap();
        assert_eq!(bad.decode(), Err(OtaError::BadHex));

        let end: EndRequest = parse_request(b"").unwrap();
        assert_eq!(end.sha256, None);

        let err = parse_request::<BeginRequest>(b"{size:").unwrap_err();
        assert_eq!(err.code(), "bad_json");
    }

    #[test]
    fn replies_carry_error_codes() {
        let reply = PushReply::from(&Err::<(), _>(OtaError::NotInProgress));
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"success":false,"error":"not_in_progress"}"#
        );
        assert_eq!(
            serde_json::to_string(&PushReply::ok()).unwrap(),
            r#"{"success":true}"#
        );
        assert_eq!(reply.http_status(), 400);
        assert_eq!(
            PushReply::from(&Err::<(), _>(OtaError::FlashWrite { written: 1, len: 4 })).http_status(),
            500
        );
    }
}
