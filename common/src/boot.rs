use log::{error, info, warn};

use crate::{
    digest::FirmwareDigest,
    identity::RunningImage,
    partition::{ImageValidationState, PartitionTable},
    store::{KvNamespace, StoreError, TrustStore},
};

/// What the trust store said about the running image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrustRecord {
    Absent,
    Present(FirmwareDigest),
    /// A blob exists but is not a digest.
    Corrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootValidation {
    /// Factory image digest recorded as the trust anchor.
    FactoryAnchored,
    /// Factory image digest was already the recorded anchor.
    FactoryUnchanged,
    /// Factory anchor differs from the record but could not be persisted.
    FactoryStoreFailed,
    /// Running slot confirmed and its pending rollback cancelled.
    MarkedValid { previous_erased: bool },
    /// Running slot is trusted but was not awaiting verification.
    NothingPending(Option<ImageValidationState>),
    /// Running slot differs from the recorded digest; left for the
    /// bootloader to roll back.
    DigestMismatch,
    /// The platform refused to confirm the running slot.
    MarkValidFailed,
}

/// Runs once per boot, before any update check.
pub fn validate_boot<T, N>(
    table: &mut T,
    trust: &mut TrustStore<N>,
    running: &RunningImage,
) -> BootValidation
where
    T: PartitionTable,
    N: KvNamespace,
{
    info!("checking current firmware");

    let record = load_record(trust);
    match record {
        TrustRecord::Present(stored) => info!("stored firmware hash: {stored}"),
        TrustRecord::Absent => info!("stored firmware hash: none"),
        TrustRecord::Corrupt => warn!("stored firmware hash: corrupt"),
    }
    info!("current firmware hash: {}", running.digest);

    if running.role().is_factory() {
        info!("running from the factory partition");
        return anchor_factory(trust, record, &running.digest);
    }

    let trusted = match record {
        TrustRecord::Absent => true,
        TrustRecord::Present(stored) => stored == running.digest,
        TrustRecord::Corrupt => false,
    };
    if !trusted {
        warn!(
            "running image `{}` does not match the stored hash; leaving it pending",
            running.partition.label
        );
        return BootValidation::DigestMismatch;
    }

    let state = match table.validation_state(&running.partition) {
        Ok(state) => state,
        Err(err) => {
            warn!("failed to read OTA state of `{}`: {err}", running.partition.label);
            return BootValidation::NothingPending(None);
        }
    };
    if state != Some(ImageValidationState::PendingVerify) {
        return BootValidation::NothingPending(state);
    }

    info!("diagnostics completed; marking partition valid and cancelling rollback");
    if let Err(err) = table.mark_running_valid() {
        error!("failed to cancel rollback: {err}");
        return BootValidation::MarkValidFailed;
    }
    info!("rollback cancelled");

    let previous_erased = match table.erase_last_boot_partition() {
        Ok(()) => {
            info!("erased previous boot partition");
            true
        }
        Err(err) => {
            warn!("failed to erase previous boot partition: {err}");
            false
        }
    };

    BootValidation::MarkedValid { previous_erased }
}

fn load_record<N: KvNamespace>(trust: &TrustStore<N>) -> TrustRecord {
    match trust.load() {
        Ok(Some(digest)) => TrustRecord::Present(digest),
        Ok(None) => TrustRecord::Absent,
        Err(StoreError::CorruptRecord { len, .. }) => {
            warn!("stored firmware hash has unexpected length {len}");
            TrustRecord::Corrupt
        }
        Err(err) => {
            warn!("failed to read firmware hash, treating as absent: {err}");
            TrustRecord::Absent
        }
    }
}

fn anchor_factory<N: KvNamespace>(
    trust: &mut TrustStore<N>,
    record: TrustRecord,
    current: &FirmwareDigest,
) -> BootValidation {
    if record == TrustRecord::Present(*current) {
        return BootValidation::FactoryUnchanged;
    }

    match trust.store(current) {
        Ok(()) => BootValidation::FactoryAnchored,
        Err(err) => {
            warn!("failed to store factory firmware hash: {err}");
            BootValidation::FactoryStoreFailed
        }
    }
}
