use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    descriptor::{DescriptorError, ImageDescriptor, DESCRIPTOR_PREFIX_LEN},
    digest::FirmwareDigest,
    gate::log_version_decision,
    partition::{FirmwareWriter, PartitionError, PartitionTable},
    status::{OtaPhase, OtaStatusHandle},
    store::{KvNamespace, TrustStore},
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("update server answered HTTP {0}")]
    Status(u16),
    #[error("read failed after {received} bytes: {detail}")]
    Read { received: u64, detail: String },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("update server returned an empty body")]
    Empty,
    #[error("candidate descriptor unreadable: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("received {received} bytes, server declared {declared}")]
    SizeMismatch { declared: u64, received: u64 },
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("flash write failed: {0}")]
    Write(#[from] PartitionError),
}

impl ApplyError {
    /// Whether another attempt could plausibly succeed. A malformed
    /// candidate is "no update available" rather than a failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(_) | Self::Write(_) => true,
            Self::Validation(ValidationError::SizeMismatch { .. }) => true,
            Self::Validation(ValidationError::Empty | ValidationError::Descriptor(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Candidate version equals the running version; nothing was written.
    UpToDate { version: String },
    /// The new image is the boot target and a restart was requested. On
    /// hardware the restart does not return, so this is only observed in
    /// simulation.
    Restarted {
        version: String,
        bytes: u64,
        digest: Option<FirmwareDigest>,
        trust_recorded: bool,
    },
}

/// Where candidate images come from.
pub trait FirmwareSource {
    type Stream: ImageStream;

    fn open(&mut self, url: &str) -> Result<Self::Stream, FetchError>;
}

pub trait ImageStream {
    /// Total body length announced by the server, if any.
    fn declared_len(&self) -> Option<u64>;

    /// Reads the next chunk. `Ok(0)` marks the end of the body.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError>;
}

/// Immediate hardware reset.
pub trait SystemReset {
    fn restart(&self);
}

pub struct UpdateEngine {
    chunk_size: usize,
}

impl UpdateEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Fetches the image at `url` and, if its version differs from
    /// `running_version`, streams it into the inactive slot, records its
    /// digest and restarts.
    #[allow(clippy::too_many_arguments)]
    pub fn apply<T, S, N, R>(
        &self,
        url: &str,
        running_version: &str,
        table: &mut T,
        source: &mut S,
        trust: &mut TrustStore<N>,
        reset: &R,
        status: &OtaStatusHandle,
    ) -> Result<ApplyOutcome, ApplyError>
    where
        T: PartitionTable,
        S: FirmwareSource,
        N: KvNamespace,
        R: SystemReset,
    {
        let mut stream = source.open(url)?;
        let declared = stream.declared_len();

        let prefix = read_prefix(&mut stream)?;
        let candidate = ImageDescriptor::parse(&prefix).map_err(ValidationError::from)?;
        if !log_version_decision(&candidate.version, running_version) {
            return Ok(ApplyOutcome::UpToDate {
                version: candidate.version,
            });
        }

        status.begin_download(&candidate.version, declared);

        let mut writer = table.begin_update()?;
        info!("writing update to partition `{}`", writer.target().label);

        let bytes = match self.stream_body(&mut writer, &mut stream, &prefix, declared, status) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("update failed: {err}");
                if let Err(abort_err) = writer.abort() {
                    warn!("failed to abort update: {abort_err}");
                }
                return Err(err);
            }
        };

        let target = writer.complete()?;
        info!("update successful ({bytes} bytes)");

        let digest = match table.image_digest(&target) {
            Ok(digest) => {
                info!("new hash: {digest}");
                Some(digest)
            }
            Err(err) => {
                warn!("failed to hash new image: {err}");
                None
            }
        };

        let trust_recorded = match digest.as_ref().map(|digest| trust.store(digest)) {
            Some(Ok(())) => true,
            Some(Err(err)) => {
                warn!("failed to store new firmware hash, restarting anyway: {err}");
                false
            }
            None => false,
        };

        info!("restarting to the new firmware");
        status.set_phase(OtaPhase::Restarting);
        reset.restart();

        Ok(ApplyOutcome::Restarted {
            version: candidate.version,
            bytes,
            digest,
            trust_recorded,
        })
    }

    fn stream_body<W, St>(
        &self,
        writer: &mut W,
        stream: &mut St,
        prefix: &[u8],
        declared: Option<u64>,
        status: &OtaStatusHandle,
    ) -> Result<u64, ApplyError>
    where
        W: FirmwareWriter,
        St: ImageStream,
    {
        writer.write(prefix)?;
        let mut received = prefix.len() as u64;
        status.record_progress(received);

        let mut chunk = vec![0_u8; self.chunk_size];
        loop {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }

            received = received.saturating_add(read as u64);
            if let Some(declared) = declared.filter(|declared| received > *declared) {
                return Err(ValidationError::SizeMismatch { declared, received }.into());
            }

            writer.write(&chunk[..read])?;
            status.record_progress(received);
            debug!("image bytes read: {received}");
        }

        match declared {
            Some(declared) if declared != received => {
                error!("complete data was not received");
                Err(ValidationError::SizeMismatch { declared, received }.into())
            }
            Some(_) => Ok(received),
            None => {
                warn!("server declared no length; accepting {received} bytes at end of stream");
                Ok(received)
            }
        }
    }
}

/// Reads exactly the descriptor prefix, or fails if the body ends first.
fn read_prefix<St: ImageStream>(stream: &mut St) -> Result<Vec<u8>, ApplyError> {
    let mut prefix = vec![0_u8; DESCRIPTOR_PREFIX_LEN];
    let mut filled = 0;

    while filled < prefix.len() {
        let read = stream.read(&mut prefix[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    if filled == 0 {
        return Err(ValidationError::Empty.into());
    }
    if filled < prefix.len() {
        return Err(ValidationError::Descriptor(DescriptorError::TooShort { len: filled }).into());
    }
    Ok(prefix)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        identity::identify_running,
        partition::{ImageValidationState, PartitionRole},
        sim::{build_image, MemoryKvStore, RecordingReset, SimFlash, SimSource},
    };

    const URL: &str = "https://updates.example.com/clock.bin";

    struct Rig {
        flash: SimFlash,
        kv: MemoryKvStore,
        source: SimSource,
        reset: RecordingReset,
        status: OtaStatusHandle,
    }

    impl Rig {
        fn new(candidate: Vec<u8>) -> Self {
            Self {
                flash: SimFlash::new(build_image("1.0.0", 8192), 2),
                kv: MemoryKvStore::default(),
                source: SimSource::new(candidate),
                reset: RecordingReset::default(),
                status: OtaStatusHandle::new(),
            }
        }

        fn apply(&mut self) -> Result<ApplyOutcome, ApplyError> {
            let mut trust = TrustStore::open(&self.kv);
            UpdateEngine::new(1024).apply(
                URL,
                "1.0.0",
                &mut self.flash,
                &mut self.source,
                &mut trust,
                &self.reset,
                &self.status,
            )
        }

        fn stored_digest(&self) -> Option<FirmwareDigest> {
            TrustStore::open(&self.kv).load().unwrap()
        }
    }

    #[test]
    fn same_version_never_writes() {
        let mut rig = Rig::new(build_image("1.0.0", 20_000));

        for _ in 0..3 {
            assert_eq!(
                rig.apply().unwrap(),
                ApplyOutcome::UpToDate {
                    version: "1.0.0".to_string()
                }
            );
        }

        assert_eq!(rig.flash.begin_update_calls(), 0);
        assert!(rig.flash.image("ota_0").unwrap().is_empty());
        assert!(rig.flash.image("ota_1").unwrap().is_empty());
        assert_eq!(rig.reset.count(), 0);
        assert_eq!(rig.stored_digest(), None);
    }

    #[test]
    fn new_version_is_committed_recorded_and_restarted() {
        let candidate = build_image("1.1.0", 20_000);
        let mut rig = Rig::new(candidate.clone());

        let outcome = rig.apply().unwrap();

        let expected = FirmwareDigest::of_bytes(&candidate);
        assert_eq!(
            outcome,
            ApplyOutcome::Restarted {
                version: "1.1.0".to_string(),
                bytes: 20_000,
                digest: Some(expected),
                trust_recorded: true,
            }
        );
        assert_eq!(rig.flash.image("ota_0").unwrap(), candidate.as_slice());
        assert_eq!(rig.flash.boot_target().unwrap().role, PartitionRole::OtaSlot(0));
        assert_eq!(rig.flash.running().unwrap().role, PartitionRole::Factory);
        let target = rig.flash.boot_target().unwrap();
        assert_eq!(
            rig.flash.validation_state(&target).unwrap(),
            Some(ImageValidationState::New)
        );
        assert_eq!(rig.stored_digest(), Some(expected));
        assert_eq!(rig.reset.count(), 1);
        assert_eq!(rig.status.snapshot().progress_pct, Some(100));
    }

    #[test]
    fn committed_image_boots_pending_verify() {
        let mut rig = Rig::new(build_image("1.1.0", 4096));
        rig.apply().unwrap();

        rig.flash.reboot();

        let running = identify_running(&rig.flash).unwrap();
        assert_eq!(running.version(), Some("1.1.0"));
        assert_eq!(
            rig.flash.validation_state(&running.partition).unwrap(),
            Some(ImageValidationState::PendingVerify)
        );
    }

    #[test]
    fn short_body_is_rejected_and_aborted() {
        let mut rig = Rig::new(build_image("1.1.0", 20_000));
        rig.source.truncate_at(12_000);

        let err = rig.apply().unwrap_err();

        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::SizeMismatch {
                declared: 20_000,
                received: 12_000
            })
        ));
        assert!(err.is_retryable());
        assert_eq!(rig.flash.abort_calls(), 1);
        assert!(rig.flash.image("ota_0").unwrap().is_empty());
        assert_eq!(rig.flash.boot_target().unwrap().role, PartitionRole::Factory);
        assert_eq!(rig.reset.count(), 0);
        assert_eq!(rig.stored_digest(), None);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut rig = Rig::new(build_image("1.1.0", 20_000));
        rig.source.declare_len(Some(10_000));

        let err = rig.apply().unwrap_err();

        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::SizeMismatch {
                declared: 10_000,
                ..
            })
        ));
        assert!(err.is_retryable());
        assert_eq!(rig.flash.abort_calls(), 1);
    }

    #[test]
    fn undeclared_length_is_accepted_at_clean_end() {
        let mut rig = Rig::new(build_image("1.1.0", 5_000));
        rig.source.declare_len(None);

        assert!(matches!(
            rig.apply().unwrap(),
            ApplyOutcome::Restarted { bytes: 5_000, .. }
        ));
    }

    #[test]
    fn connection_failure_touches_nothing() {
        let mut rig = Rig::new(build_image("1.1.0", 5_000));
        rig.source.fail_next_connects(1);

        let err = rig.apply().unwrap_err();

        assert!(matches!(err, ApplyError::Fetch(FetchError::Connect(_))));
        assert_eq!(rig.flash.begin_update_calls(), 0);
    }

    #[test]
    fn unreadable_candidate_descriptor_is_not_retryable() {
        let mut rig = Rig::new(vec![0x42; 4096]);

        let err = rig.apply().unwrap_err();

        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::Descriptor(_))
        ));
        assert!(!err.is_retryable());
        assert_eq!(rig.flash.begin_update_calls(), 0);

        let mut rig = Rig::new(Vec::new());
        assert!(matches!(
            rig.apply().unwrap_err(),
            ApplyError::Validation(ValidationError::Empty)
        ));
    }

    #[test]
    fn write_failures_never_touch_running_partition() {
        let candidate = build_image("1.1.0", 20_000);

        for fail_at in [0_u64, 1, 300, 1_024, 9_999, 19_999] {
            let mut rig = Rig::new(candidate.clone());
            let running = rig.flash.running().unwrap();
            let digest_before = rig.flash.image_digest(&running).unwrap();
            let state_before = rig.flash.validation_state(&running).unwrap();
            rig.flash.fail_writes_after(Some(fail_at));

            let err = rig.apply().unwrap_err();

            assert!(matches!(err, ApplyError::Write(_)), "fail_at={fail_at}");
            assert_eq!(rig.flash.image_digest(&running).unwrap(), digest_before);
            assert_eq!(rig.flash.validation_state(&running).unwrap(), state_before);
            assert_eq!(rig.flash.boot_target().unwrap(), running);
            assert_eq!(rig.reset.count(), 0);
        }
    }

    #[test]
    fn read_failure_mid_stream_aborts_write() {
        let mut rig = Rig::new(build_image("1.1.0", 20_000));
        rig.source.fail_read_after(7_000);

        let err = rig.apply().unwrap_err();

        assert!(matches!(err, ApplyError::Fetch(FetchError::Read { .. })));
        assert_eq!(rig.flash.abort_calls(), 1);
        assert!(rig.flash.image("ota_0").unwrap().is_empty());
    }

    #[test]
    fn trust_store_failure_still_restarts() {
        let mut rig = Rig::new(build_image("1.1.0", 4096));
        rig.kv.fail_commits(true);

        let outcome = rig.apply().unwrap();

        assert!(matches!(
            outcome,
            ApplyOutcome::Restarted {
                trust_recorded: false,
                ..
            }
        ));
        assert_eq!(rig.reset.count(), 1);
    }

    #[test]
    fn rejected_commit_keeps_boot_target_and_skips_restart() {
        let candidate = build_image("1.1.0", 5000);
        let mut rig = Rig::new(candidate.clone());
        let running_before = identify_running(&rig.flash).unwrap();
        rig.flash.fail_complete(true);

        let err = rig.apply().unwrap_err();

        assert!(matches!(err, ApplyError::Write(PartitionError::Platform { .. })));
        assert!(err.is_retryable());
        assert_eq!(rig.flash.boot_target().unwrap().role, PartitionRole::Factory);
        assert_eq!(rig.flash.running().unwrap().role, PartitionRole::Factory);
        assert_eq!(identify_running(&rig.flash).unwrap().digest, running_before.digest);
        assert_eq!(rig.reset.count(), 0);
        assert_eq!(rig.stored_digest(), None);
        // The unselected slot is rewritten from scratch by the next attempt.
        assert_eq!(rig.flash.abort_calls(), 0);

        rig.flash.fail_complete(false);
        assert!(matches!(rig.apply().unwrap(), ApplyOutcome::Restarted { .. }));
        assert_eq!(rig.flash.image("ota_0").unwrap(), candidate.as_slice());
        assert_eq!(rig.reset.count(), 1);
    }
}
