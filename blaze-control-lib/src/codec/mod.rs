//! Binary wire formats spoken by the controller.
//!
//! Everything in here is pure data transformation: no sockets, no clocks.
//! Decoders never fall back to defaults; a buffer that does not look like
//! what it claims to be is reported as a [`CodecError`].

use thiserror::Error;

pub mod beacon;
pub mod container;
pub mod expander;
pub mod frame;
pub mod pixel_map;

pub use beacon::{DiscoveryBeacon, TimeSyncPacket};
pub use container::{Backup, BinaryPattern, FileTypes};
pub use expander::{ColorOrder, ExpanderBoard, ExpanderChannel, LedType};
pub use frame::{BinaryFrame, ContinuationFlags, FragmentAssembler, MessageType, RGB};
pub use pixel_map::{MapFormat, PixelMap};

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// A binary frame is too short or otherwise cannot be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The first byte of a binary frame is not a known message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// A continuation fragment arrived without a matching FIRST fragment,
    /// or with no continuation bits set at all.
    #[error("fragment out of sequence for {message_type:?} (flags 0x{flags:02X})")]
    FragmentOutOfSequence {
        message_type: MessageType,
        flags: u8,
    },

    /// A container header references bytes past the end of the buffer.
    #[error("truncated container: {field} needs {needed} bytes, buffer has {available}")]
    TruncatedContainer {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// A version or magic byte does not match what the decoder supports.
    #[error("unsupported version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: String },

    /// Pixel-map input or output is inconsistent.
    #[error("invalid pixel map: {0}")]
    InvalidPixelMap(String),

    /// The backup container is not the expected JSON document.
    #[error("invalid backup: {0}")]
    InvalidBackup(String),
}

/// Reads the little-endian `u32` at `offset`.
///
/// Callers check the length up front; this only guards against misuse.
pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Result<u32, CodecError> {
    data.get(offset..offset + 4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .ok_or_else(|| {
            CodecError::MalformedFrame(format!(
                "need 4 bytes at offset {}, buffer has {}",
                offset,
                data.len()
            ))
        })
}
