//! Binary websocket frames.
//!
//! Wire format of every binary message except preview frames:
//! ```text
//! [message_type:1][continuation_flags:1][payload:N]
//! ```
//! Long payloads are split into several frames: the first carries FIRST,
//! interior ones MIDDLE and the final one LAST. A payload that fits into a
//! single frame carries FIRST|LAST.
//!
//! Preview frames (type 5) are pushed by the device after each render and
//! carry no flags byte: `[5][r g b]*pixel_count`.

use std::collections::HashMap;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Largest binary frame the device accepts for most message types.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8192;

/// Pattern bytecode has to travel in smaller pieces.
pub const BYTECODE_MAX_FRAME_SIZE: usize = 1280;

/// Type byte at the start of every binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Pattern source code, client to device.
    PutSourceCode = 1,
    /// Pattern bytecode, client to device.
    PutByteCode = 3,
    /// Pattern preview image, in both directions.
    PreviewImage = 4,
    /// Rendered pixel colors pushed by the device. Headerless.
    PreviewFrame = 5,
    /// Pattern source code, device to client.
    GetSourceCode = 6,
    /// Pattern list request/response.
    GetProgramList = 7,
    /// Pixel-map data, client to device.
    PutPixelMap = 8,
    /// Output-expander configuration, in both directions.
    ExpanderConfig = 9,
}

impl MessageType {
    /// Chunk size used when this message type is split into frames.
    pub fn max_frame_size(self) -> usize {
        match self {
            MessageType::PutByteCode => BYTECODE_MAX_FRAME_SIZE,
            _ => DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Whether frames of this type are sent without a continuation-flags byte.
    pub fn is_headerless(self) -> bool {
        self == MessageType::PreviewFrame
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::PutSourceCode),
            3 => Ok(MessageType::PutByteCode),
            4 => Ok(MessageType::PreviewImage),
            5 => Ok(MessageType::PreviewFrame),
            6 => Ok(MessageType::GetSourceCode),
            7 => Ok(MessageType::GetProgramList),
            8 => Ok(MessageType::PutPixelMap),
            9 => Ok(MessageType::ExpanderConfig),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

bitflags! {
    /// Second byte of a binary frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContinuationFlags: u8 {
        const FIRST = 1;
        const MIDDLE = 2;
        const LAST = 4;
    }
}

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    pub message_type: MessageType,
    pub flags: ContinuationFlags,
    pub payload: Bytes,
}

/// A single pixel color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RGB {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl From<(u8, u8, u8)> for RGB {
    fn from(tuple: (u8, u8, u8)) -> Self {
        RGB {
            red: tuple.0,
            green: tuple.1,
            blue: tuple.2,
        }
    }
}

impl From<RGB> for (u8, u8, u8) {
    fn from(rgb: RGB) -> Self {
        (rgb.red, rgb.green, rgb.blue)
    }
}

/// Splits `payload` into wire frames of at most `max_frame_size` payload bytes.
///
/// Preview frames are never split and carry only the type byte.
/// An empty payload still produces one FIRST|LAST frame.
pub fn encode_binary_frame(
    message_type: MessageType,
    payload: &[u8],
    max_frame_size: usize,
) -> Vec<Bytes> {
    if message_type.is_headerless() {
        let mut frame = BytesMut::with_capacity(1 + payload.len());
        frame.put_u8(message_type as u8);
        frame.extend_from_slice(payload);
        return vec![frame.freeze()];
    }

    let chunk_size = max_frame_size.max(1);
    if payload.is_empty() {
        return vec![header_only(message_type, ContinuationFlags::FIRST | ContinuationFlags::LAST)];
    }

    let chunk_count = payload.len().div_ceil(chunk_size);
    payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let mut flags = ContinuationFlags::empty();
            if index == 0 {
                flags |= ContinuationFlags::FIRST;
            }
            if index + 1 == chunk_count {
                flags |= ContinuationFlags::LAST;
            } else if index > 0 {
                flags |= ContinuationFlags::MIDDLE;
            }

            let mut frame = BytesMut::with_capacity(2 + chunk.len());
            frame.put_u8(message_type as u8);
            frame.put_u8(flags.bits());
            frame.extend_from_slice(chunk);
            frame.freeze()
        })
        .collect()
}

fn header_only(message_type: MessageType, flags: ContinuationFlags) -> Bytes {
    Bytes::from(vec![message_type as u8, flags.bits()])
}

/// Parses one wire frame carrying the 2-byte header.
///
/// Headerless preview frames go through [`decode_headerless_frame`]; only
/// the connection knows whether they are being sent.
pub fn decode_binary_frame(bytes: &[u8]) -> Result<BinaryFrame, CodecError> {
    let Some(&type_byte) = bytes.first() else {
        return Err(CodecError::MalformedFrame("empty binary frame".to_string()));
    };
    let message_type = MessageType::try_from(type_byte)?;

    if bytes.len() < 2 {
        return Err(CodecError::MalformedFrame(format!(
            "frame of type {:?} is {} byte(s), shorter than the 2-byte header",
            message_type,
            bytes.len()
        )));
    }

    Ok(BinaryFrame {
        message_type,
        flags: ContinuationFlags::from_bits_retain(bytes[1]),
        payload: Bytes::copy_from_slice(&bytes[2..]),
    })
}

/// Parses a frame sent without a flags byte. It is always a complete message.
pub fn decode_headerless_frame(
    bytes: &[u8],
    expected: MessageType,
) -> Result<BinaryFrame, CodecError> {
    let Some(&type_byte) = bytes.first() else {
        return Err(CodecError::MalformedFrame("empty binary frame".to_string()));
    };
    let message_type = MessageType::try_from(type_byte)?;
    if message_type != expected {
        return Err(CodecError::MalformedFrame(format!(
            "expected a headerless {:?} frame, got {:?}",
            expected, message_type
        )));
    }

    Ok(BinaryFrame {
        message_type,
        flags: ContinuationFlags::FIRST | ContinuationFlags::LAST,
        payload: Bytes::copy_from_slice(&bytes[1..]),
    })
}

/// Decodes the payload of a preview frame into `pixel_count` colors.
pub fn decode_preview_frame(payload: &[u8], pixel_count: usize) -> Result<Vec<RGB>, CodecError> {
    let expected = pixel_count * 3;
    if payload.len() != expected {
        return Err(CodecError::MalformedFrame(format!(
            "preview frame for {} pixels must be {} bytes, got {}",
            pixel_count,
            expected,
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(3)
        .map(|pixel| RGB {
            red: pixel[0],
            green: pixel[1],
            blue: pixel[2],
        })
        .collect())
}

/// Collects fragments of multi-frame binary messages.
///
/// At most one message per type is assembled at a time. A FIRST fragment
/// for a type that is already in progress discards the partial message and
/// starts over.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    in_progress: HashMap<MessageType, BytesMut>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame. Returns the complete message once its LAST
    /// fragment has arrived.
    pub fn push(&mut self, frame: BinaryFrame) -> Result<Option<(MessageType, Bytes)>, CodecError> {
        let BinaryFrame {
            message_type,
            flags,
            payload,
        } = frame;

        if flags.contains(ContinuationFlags::FIRST | ContinuationFlags::MIDDLE) {
            return Err(CodecError::FragmentOutOfSequence {
                message_type,
                flags: flags.bits(),
            });
        }

        if flags.contains(ContinuationFlags::FIRST) {
            if let Some(partial) = self.in_progress.remove(&message_type) {
                warn!(
                    "restarting {:?} message, discarding {} partial bytes",
                    message_type,
                    partial.len()
                );
            }
            if flags.contains(ContinuationFlags::LAST) {
                return Ok(Some((message_type, payload)));
            }
            let mut buffer = BytesMut::with_capacity(payload.len() * 2);
            buffer.extend_from_slice(&payload);
            self.in_progress.insert(message_type, buffer);
            return Ok(None);
        }

        if !flags.intersects(ContinuationFlags::MIDDLE | ContinuationFlags::LAST) {
            return Err(CodecError::FragmentOutOfSequence {
                message_type,
                flags: flags.bits(),
            });
        }

        let Some(buffer) = self.in_progress.get_mut(&message_type) else {
            return Err(CodecError::FragmentOutOfSequence {
                message_type,
                flags: flags.bits(),
            });
        };
        buffer.extend_from_slice(&payload);
        trace!("{:?}: {} bytes assembled so far", message_type, buffer.len());

        if flags.contains(ContinuationFlags::LAST) {
            let complete = self
                .in_progress
                .remove(&message_type)
                .map(BytesMut::freeze)
                .unwrap_or_default();
            return Ok(Some((message_type, complete)));
        }
        Ok(None)
    }

    /// Whether a message of `message_type` is partially assembled.
    pub fn is_assembling(&self, message_type: MessageType) -> bool {
        self.in_progress.contains_key(&message_type)
    }

    /// Drops every partial message.
    pub fn clear(&mut self) {
        self.in_progress.clear();
    }
}
