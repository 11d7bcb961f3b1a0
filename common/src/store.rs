use log::{info, warn};
use thiserror::Error;

use crate::digest::{FirmwareDigest, DIGEST_LEN};

pub const NVS_NAMESPACE: &str = "system_info";
pub const NVS_FIRMWARE_HASH_KEY: &str = "firmware_hash";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open namespace `{namespace}`: {detail}")]
    Open { namespace: String, detail: String },
    #[error("failed to read `{key}`: {detail}")]
    Read { key: String, detail: String },
    #[error("failed to write `{key}`: {detail}")]
    Write { key: String, detail: String },
    #[error("failed to commit: {0}")]
    Commit(String),
    #[error("stored `{key}` has {len} bytes, expected {expected}")]
    CorruptRecord {
        key: String,
        len: usize,
        expected: usize,
    },
    #[error("durable store unavailable")]
    Unavailable,
}

/// A flash-backed key-value region that survives power loss and firmware
/// updates.
pub trait KvStore {
    type Namespace: KvNamespace;

    fn open(&self, namespace: &str) -> Result<Self::Namespace, StoreError>;
}

/// An open namespace. Writes only become durable on [`KvNamespace::commit`];
/// a crash before commit leaves the previously committed value in place.
/// Dropping the handle closes it.
pub trait KvNamespace {
    /// Returns the stored blob's full length, or `None` if the key has never
    /// been written. The blob is copied into `buf` when it fits.
    fn get_blob(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, StoreError>;

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;
}

/// The single persisted trust record: the digest of the last image this
/// device confirmed or installed.
pub struct TrustStore<N> {
    namespace: Option<N>,
}

impl<N: KvNamespace> TrustStore<N> {
    /// Opens the trust namespace. An open failure is logged and yields a
    /// store that reports [`StoreError::Unavailable`] on every access.
    pub fn open<S>(store: &S) -> Self
    where
        S: KvStore<Namespace = N>,
    {
        match store.open(NVS_NAMESPACE) {
            Ok(namespace) => Self {
                namespace: Some(namespace),
            },
            Err(err) => {
                warn!("trust store unavailable: {err}");
                Self { namespace: None }
            }
        }
    }

    pub fn load(&self) -> Result<Option<FirmwareDigest>, StoreError> {
        let namespace = self.namespace.as_ref().ok_or(StoreError::Unavailable)?;

        // One spare byte so an oversized blob is detected rather than clipped.
        let mut buf = [0_u8; DIGEST_LEN + 1];
        let Some(len) = namespace.get_blob(NVS_FIRMWARE_HASH_KEY, &mut buf)? else {
            return Ok(None);
        };

        FirmwareDigest::from_slice(&buf[..len.min(buf.len())])
            .map(Some)
            .ok_or_else(|| StoreError::CorruptRecord {
                key: NVS_FIRMWARE_HASH_KEY.to_string(),
                len,
                expected: DIGEST_LEN,
            })
    }

    /// Replaces the record and commits it.
    pub fn store(&mut self, digest: &FirmwareDigest) -> Result<(), StoreError> {
        let namespace = self.namespace.as_mut().ok_or(StoreError::Unavailable)?;
        namespace.set_blob(NVS_FIRMWARE_HASH_KEY, digest.as_bytes())?;
        namespace.commit()?;
        info!("stored firmware hash {digest}");
        Ok(())
    }
}
