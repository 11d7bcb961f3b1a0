//! Application descriptor embedded at a fixed offset in every firmware image.
//!
//! Layout (little-endian), as emitted by the ESP-IDF build:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 24   | image header (`0xE9` magic)    |
//! | 24     | 8    | first segment header           |
//! | 32     | 256  | application descriptor         |
//!
//! The descriptor itself starts with a `0xABCD5432` magic word, followed by
//! the secure version, two reserved words and then NUL-padded strings.

use thiserror::Error;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const IMAGE_HEADER_LEN: usize = 24;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const APP_DESC_OFFSET: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;
pub const APP_DESC_LEN: usize = 256;
/// Bytes of an image that must be seen before its descriptor can be decoded.
pub const DESCRIPTOR_PREFIX_LEN: usize = APP_DESC_OFFSET + APP_DESC_LEN;

pub const VERSION_OFFSET: usize = 16;
pub const VERSION_LEN: usize = 32;
pub const PROJECT_NAME_OFFSET: usize = 48;
pub const PROJECT_NAME_LEN: usize = 32;
pub const TIME_OFFSET: usize = 80;
pub const TIME_LEN: usize = 16;
pub const DATE_OFFSET: usize = 96;
pub const DATE_LEN: usize = 16;
pub const IDF_VERSION_OFFSET: usize = 112;
pub const IDF_VERSION_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("image too short for descriptor ({len} of {} bytes)", DESCRIPTOR_PREFIX_LEN)]
    TooShort { len: usize },
    #[error("bad image magic 0x{0:02x}")]
    BadImageMagic(u8),
    #[error("bad descriptor magic 0x{0:08x}")]
    BadDescriptorMagic(u32),
    #[error("descriptor field `{0}` is not valid UTF-8")]
    InvalidText(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub version: String,
    pub project_name: String,
    pub secure_version: u32,
    pub build_time: String,
    pub build_date: String,
    pub idf_version: String,
}

impl ImageDescriptor {
    /// Decodes the descriptor from the leading bytes of an image. Only the
    /// first [`DESCRIPTOR_PREFIX_LEN`] bytes are inspected.
    pub fn parse(image: &[u8]) -> Result<Self, DescriptorError> {
        if image.len() < DESCRIPTOR_PREFIX_LEN {
            return Err(DescriptorError::TooShort { len: image.len() });
        }
        if image[0] != IMAGE_MAGIC {
            return Err(DescriptorError::BadImageMagic(image[0]));
        }

        let desc = &image[APP_DESC_OFFSET..DESCRIPTOR_PREFIX_LEN];
        let magic = read_u32(desc, 0);
        if magic != APP_DESC_MAGIC {
            return Err(DescriptorError::BadDescriptorMagic(magic));
        }

        Ok(Self {
            version: read_text(desc, VERSION_OFFSET, VERSION_LEN, "version")?,
            project_name: read_text(desc, PROJECT_NAME_OFFSET, PROJECT_NAME_LEN, "project_name")?,
            secure_version: read_u32(desc, 4),
            build_time: read_text(desc, TIME_OFFSET, TIME_LEN, "time")?,
            build_date: read_text(desc, DATE_OFFSET, DATE_LEN, "date")?,
            idf_version: read_text(desc, IDF_VERSION_OFFSET, IDF_VERSION_LEN, "idf_ver")?,
        })
    }

    /// Inverse of [`ImageDescriptor::parse`]: the 32-byte image/segment
    /// header followed by the descriptor block. Strings longer than their
    /// field are truncated to leave room for a terminating NUL.
    pub fn encode_prefix(&self) -> [u8; DESCRIPTOR_PREFIX_LEN] {
        let mut out = [0_u8; DESCRIPTOR_PREFIX_LEN];
        out[0] = IMAGE_MAGIC;
        // segment count; the rest of the header is irrelevant to the descriptor
        out[1] = 1;

        let desc = &mut out[APP_DESC_OFFSET..];
        desc[0..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        desc[4..8].copy_from_slice(&self.secure_version.to_le_bytes());
        write_text(desc, VERSION_OFFSET, VERSION_LEN, &self.version);
        write_text(desc, PROJECT_NAME_OFFSET, PROJECT_NAME_LEN, &self.project_name);
        write_text(desc, TIME_OFFSET, TIME_LEN, &self.build_time);
        write_text(desc, DATE_OFFSET, DATE_LEN, &self.build_date);
        write_text(desc, IDF_VERSION_OFFSET, IDF_VERSION_LEN, &self.idf_version);
        out
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0_u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_text(
    bytes: &[u8],
    offset: usize,
    len: usize,
    field: &'static str,
) -> Result<String, DescriptorError> {
    let raw = &bytes[offset..offset + len];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(len);
    core::str::from_utf8(&raw[..end])
        .map(str::to_string)
        .map_err(|_| DescriptorError::InvalidText(field))
}

fn write_text(bytes: &mut [u8], offset: usize, len: usize, value: &str) {
    let src = value.as_bytes();
    let count = src.len().min(len - 1);
    bytes[offset..offset + count].copy_from_slice(&src[..count]);
}
