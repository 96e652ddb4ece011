use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Erase granularity. The cooperative hook runs between blocks.
pub const ERASE_CHUNK_BYTES: u32 = 64 * 1024;

/// First byte of every valid ESP application image.
pub const ESP_IMAGE_MAGIC: u8 = 0xE9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotId {
    /// `ota_0`, home of the OTA bootloader image.
    A,
    /// `ota_1`, home of the sensor application image.
    B,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::A => "ota_0",
            Self::B => "ota_1",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "ota_0" | "A" | "a" => Some(Self::A),
            "ota_1" | "B" | "b" => Some(Self::B),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    pub slot: SlotId,
    pub label: &'static str,
    pub size: u32,
    pub is_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("running partition could not be identified")]
    NoRunningPartition,
    #[error("partition {0} not found in partition table")]
    PartitionNotFound(&'static str),
    #[error("range {offset:#x}+{len:#x} is outside a {size:#x} byte partition")]
    OutOfRange { offset: u32, len: u32, size: u32 },
    #[error("no valid application image in {0}")]
    InvalidImage(&'static str),
    #[error("flash driver error {0}")]
    Driver(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EraseError {
    #[error("refusing to erase running partition {0}")]
    RunningPartition(&'static str),
    #[error("erase of {label} stopped at offset {offset:#x}: {source}")]
    Partial {
        label: &'static str,
        offset: u32,
        #[source]
        source: FlashError,
    },
}

/// Hardware seam over the two application slots and the boot selector.
pub trait FlashPartitions {
    fn running_slot(&self) -> Result<SlotId, FlashError>;
    fn slot_size(&self, slot: SlotId) -> Result<u32, FlashError>;
    fn erase_range(&mut self, slot: SlotId, offset: u32, len: u32) -> Result<(), FlashError>;
    /// Returns how many bytes the flash layer accepted.
    fn write(&mut self, slot: SlotId, offset: u32, data: &[u8]) -> Result<usize, FlashError>;
    fn verify_image(&mut self, slot: SlotId, len: u32) -> Result<(), FlashError>;
    fn set_boot_slot(&mut self, slot: SlotId) -> Result<(), FlashError>;
    fn boot_slot(&self) -> Result<SlotId, FlashError>;
    fn restart(&mut self) -> !;
}

pub struct PartitionManager<F> {
    flash: F,
}

impl<F: FlashPartitions> PartitionManager<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn running(&self) -> Result<PartitionDescriptor, FlashError> {
        let slot = self.flash.running_slot()?;
        self.describe(slot, slot)
    }

    pub fn inactive(&self) -> Result<PartitionDescriptor, FlashError> {
        let running = self.flash.running_slot()?;
        self.describe(running.other(), running)
    }

    pub fn boot(&self) -> Result<PartitionDescriptor, FlashError> {
        let running = self.flash.running_slot()?;
        let boot = self.flash.boot_slot()?;
        self.describe(boot, running)
    }

    fn describe(&self, slot: SlotId, running: SlotId) -> Result<PartitionDescriptor, FlashError> {
        Ok(PartitionDescriptor {
            slot,
            label: slot.label(),
            size: self.flash.slot_size(slot)?,
            is_running: slot == running,
        })
    }

    /// Erases `partition` chunk by chunk, calling `between_chunks` after
    /// each one so the caller can feed a watchdog or yield.
    pub fn erase(
        &mut self,
        partition: &PartitionDescriptor,
        mut between_chunks: impl FnMut(u32),
    ) -> Result<(), EraseError> {
        let running = self
            .flash
            .running_slot()
            .map_err(|source| EraseError::Partial {
                label: partition.label,
                offset: 0,
                source,
            })?;
        if partition.slot == running {
            return Err(EraseError::RunningPartition(partition.label));
        }

        info!(
            "erasing partition {} ({} bytes)",
            partition.label, partition.size
        );
        self.erase_chunks(partition.slot, partition.size, &mut between_chunks)?;
        info!("partition {} erased", partition.label);
        Ok(())
    }

    fn erase_chunks(
        &mut self,
        slot: SlotId,
        size: u32,
        between_chunks: &mut impl FnMut(u32),
    ) -> Result<(), EraseError> {
        let mut offset = 0_u32;
        while offset < size {
            let len = ERASE_CHUNK_BYTES.min(size - offset);
            if let Err(source) = self.flash.erase_range(slot, offset, len) {
                warn!(
                    "erase of {} failed at offset {offset:#x}: {source}",
                    slot.label()
                );
                return Err(EraseError::Partial {
                    label: slot.label(),
                    offset,
                    source,
                });
            }
            offset += len;
            between_chunks(offset);
        }
        Ok(())
    }

    pub fn set_boot_partition(&mut self, partition: &PartitionDescriptor) -> Result<(), FlashError> {
        self.flash.set_boot_slot(partition.slot)?;
        info!("next boot partition set to {}", partition.label);
        Ok(())
    }

    /// Leaves the application slot for good: next boot goes to slot A, then
    /// the running slot B is wiped so it cannot be booted again.
    /// Boot selection is always written before the erase starts. Callers
    /// restart afterwards whatever the erase result.
    pub fn prepare_fallback(
        &mut self,
        mut between_chunks: impl FnMut(u32),
    ) -> Result<(), FallbackError> {
        let running = self.flash.running_slot()?;
        if running == SlotId::A {
            return Err(FallbackError::AlreadyInBootloader);
        }

        self.flash.set_boot_slot(SlotId::A)?;
        info!("fallback: next boot set to {}", SlotId::A.label());

        let size = self.flash.slot_size(running)?;
        self.erase_chunks(running, size, &mut between_chunks)
            .map_err(FallbackError::Erase)?;

        info!("fallback: {} erased", running.label());
        Ok(())
    }

    pub fn restart(&mut self) -> ! {
        info!("restarting device");
        self.flash.restart()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FallbackError {
    #[error("already running from the bootloader slot")]
    AlreadyInBootloader,
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Erase(EraseError),
}
