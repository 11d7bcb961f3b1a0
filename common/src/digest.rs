use core::fmt;

use sha2::{Digest, Sha256};

pub const DIGEST_LEN: usize = 32;

/// SHA-256 of a complete firmware image. Two images are the same firmware
/// iff their digests are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareDigest([u8; DIGEST_LEN]);

impl FirmwareDigest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns `None` unless `bytes` is exactly one digest long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn of_bytes(image: &[u8]) -> Self {
        let mut hasher = ImageHasher::new();
        hasher.update(image);
        hasher.finalize()
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(DIGEST_LEN * 2);
        for byte in self.0 {
            use core::fmt::Write as _;
            let _ = write!(&mut hex, "{byte:02x}");
        }
        hex
    }
}

impl fmt::Display for FirmwareDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FirmwareDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareDigest({})", self.to_hex())
    }
}

/// Incremental digest over an image that arrives in chunks.
#[derive(Clone, Default)]
pub struct ImageHasher {
    inner: Sha256,
}

impl ImageHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize(self) -> FirmwareDigest {
        FirmwareDigest(self.inner.finalize().into())
    }
}
