use log::{info, warn};
use thiserror::Error;

use crate::{
    descriptor::ImageDescriptor,
    digest::FirmwareDigest,
    partition::{PartitionError, PartitionInfo, PartitionRole, PartitionTable},
};

/// The running partition's digest could not be computed. The flash holding
/// the executing image is suspect, so the OTA task stops without touching
/// anything.
#[derive(Debug, Error)]
#[error("cannot identify running firmware: {0}")]
pub struct IdentityError(#[from] pub PartitionError);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningImage {
    pub partition: PartitionInfo,
    pub digest: FirmwareDigest,
    /// `None` when the image's descriptor could not be decoded.
    pub descriptor: Option<ImageDescriptor>,
}

impl RunningImage {
    pub fn role(&self) -> PartitionRole {
        self.partition.role
    }

    pub fn version(&self) -> Option<&str> {
        self.descriptor.as_ref().map(|desc| desc.version.as_str())
    }
}

pub fn digest_of<T: PartitionTable>(
    table: &T,
    partition: &PartitionInfo,
) -> Result<FirmwareDigest, PartitionError> {
    table.image_digest(partition)
}

pub fn descriptor_of<T: PartitionTable>(
    table: &T,
    partition: &PartitionInfo,
) -> Result<(ImageDescriptor, PartitionRole), PartitionError> {
    let descriptor = table.image_descriptor(partition)?;
    Ok((descriptor, partition.role))
}

/// Identifies the running partition, its role and digest. A missing
/// descriptor is tolerated; an unreadable digest is not.
pub fn identify_running<T: PartitionTable>(table: &T) -> Result<RunningImage, IdentityError> {
    let partition = table.running()?;
    let digest = digest_of(table, &partition)?;

    let descriptor = match descriptor_of(table, &partition) {
        Ok((descriptor, _)) => {
            info!("running firmware version: {}", descriptor.version);
            Some(descriptor)
        }
        Err(err) => {
            warn!("running firmware descriptor unavailable: {err}");
            None
        }
    };

    info!(
        "running partition `{}` ({:?}), hash {digest}",
        partition.label, partition.role
    );

    Ok(RunningImage {
        partition,
        digest,
        descriptor,
    })
}
