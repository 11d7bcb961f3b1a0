use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{descriptor::ImageDescriptor, digest::FirmwareDigest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartitionRole {
    Factory,
    OtaSlot(u8),
}

impl PartitionRole {
    pub fn is_factory(self) -> bool {
        matches!(self, Self::Factory)
    }
}

/// Bootloader-visible state of an OTA slot. Factory partitions carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageValidationState {
    New,
    PendingVerify,
    Valid,
    Invalid,
}

impl ImageValidationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PendingVerify => "PENDING_VERIFY",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub label: String,
    pub role: PartitionRole,
    pub address: u32,
    pub size: u32,
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition `{label}` is unreadable: {detail}")]
    Unreadable { label: String, detail: String },
    #[error("partition `{0}` holds no valid image descriptor: {1}")]
    Descriptor(String, crate::descriptor::DescriptorError),
    #[error("no inactive OTA slot available")]
    NoUpdateSlot,
    #[error("image exceeds partition `{label}` capacity of {capacity} bytes")]
    ImageTooLarge { label: String, capacity: u32 },
    #[error("{operation} failed: {detail}")]
    Platform {
        operation: &'static str,
        detail: String,
    },
}

impl PartitionError {
    pub fn platform(operation: &'static str, detail: impl core::fmt::Display) -> Self {
        Self::Platform {
            operation,
            detail: detail.to_string(),
        }
    }
}

/// Partition table and OTA bookkeeping exposed by the platform bootloader.
///
/// The rollback countdown and crash-loop detection live behind this trait;
/// the firmware only observes slot states and asks for the two transitions
/// it owns: confirming the running slot and releasing the previous one.
pub trait PartitionTable {
    type Writer<'a>: FirmwareWriter
    where
        Self: 'a;

    fn running(&self) -> Result<PartitionInfo, PartitionError>;

    fn boot_target(&self) -> Result<PartitionInfo, PartitionError>;

    fn validation_state(
        &self,
        partition: &PartitionInfo,
    ) -> Result<Option<ImageValidationState>, PartitionError>;

    fn image_digest(&self, partition: &PartitionInfo) -> Result<FirmwareDigest, PartitionError>;

    fn image_descriptor(&self, partition: &PartitionInfo)
        -> Result<ImageDescriptor, PartitionError>;

    /// Marks the running slot `Valid` and cancels the pending rollback.
    fn mark_running_valid(&mut self) -> Result<(), PartitionError>;

    /// Erases the partition that was booted before the running one.
    fn erase_last_boot_partition(&mut self) -> Result<(), PartitionError>;

    /// Opens the inactive slot for writing. Never targets the running
    /// partition.
    fn begin_update(&mut self) -> Result<Self::Writer<'_>, PartitionError>;
}

/// An in-progress write into the inactive slot.
pub trait FirmwareWriter {
    fn target(&self) -> &PartitionInfo;

    fn write(&mut self, chunk: &[u8]) -> Result<(), PartitionError>;

    /// Seals the image and selects it as the next boot target.
    fn complete(self) -> Result<PartitionInfo, PartitionError>;

    /// Releases partially written state so a later attempt starts clean.
    fn abort(self) -> Result<(), PartitionError>;
}
