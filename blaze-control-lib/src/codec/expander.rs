//! Output-expander configuration (message type 9).
//!
//! A version byte (5) followed by one 96-byte table per expander board.
//! Each table holds eight 12-byte channel rows:
//! ```text
//! [address:u8][led_type:u8][num_colors:u8][color_order:u8]
//! [pixel_count:u16][start_index:u16][clock_speed:4]
//! ```
//! The address byte packs the board address (upper five bits) and the
//! channel number (lower three bits).

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

pub const EXPANDER_CONFIG_VERSION: u8 = 5;
pub const CHANNELS_PER_BOARD: usize = 8;
const ROW_SIZE: usize = 12;
const BOARD_SIZE: usize = ROW_SIZE * CHANNELS_PER_BOARD;

/// LED driver selected for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedType {
    NotUsed,
    /// APA102, SK9822 and DotStar strips.
    Apa102,
    /// WS2812, SK6822 and NeoPixel strips.
    Ws2812,
    Ws2801,
    BufferedWs2812,
    OutputExpander,
    Other(u8),
}

impl From<u8> for LedType {
    fn from(value: u8) -> Self {
        match value {
            0 => LedType::NotUsed,
            1 => LedType::Apa102,
            2 => LedType::Ws2812,
            3 => LedType::Ws2801,
            4 => LedType::BufferedWs2812,
            5 => LedType::OutputExpander,
            other => LedType::Other(other),
        }
    }
}

impl From<LedType> for u8 {
    fn from(led_type: LedType) -> Self {
        match led_type {
            LedType::NotUsed => 0,
            LedType::Apa102 => 1,
            LedType::Ws2812 => 2,
            LedType::Ws2801 => 3,
            LedType::BufferedWs2812 => 4,
            LedType::OutputExpander => 5,
            LedType::Other(value) => value,
        }
    }
}

/// Packed colour order: four 2-bit slots holding the output position of
/// red, green, blue and white, starting at the least significant bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorOrder(pub u8);

const CHANNEL_NAMES: [char; 4] = ['R', 'G', 'B', 'W'];

impl ColorOrder {
    /// Channel sequence as sent on the wire, e.g. `"GRB"`.
    ///
    /// Returns `None` when `num_colors` is not 3 or 4 or the slots do not
    /// form a permutation.
    pub fn sequence(self, num_colors: u8) -> Option<String> {
        let colors = num_colors as usize;
        if !(3..=4).contains(&colors) {
            return None;
        }

        let mut positions = [None; 4];
        for (slot, &name) in CHANNEL_NAMES.iter().enumerate().take(colors) {
            let position = ((self.0 >> (slot * 2)) & 0b11) as usize;
            if position >= colors || positions[position].is_some() {
                return None;
            }
            positions[position] = Some(name);
        }
        positions[..colors].iter().copied().collect()
    }

    /// Packs a sequence such as `"RGBW"` back into its byte form.
    pub fn from_sequence(sequence: &str) -> Option<Self> {
        let chars: Vec<char> = sequence.chars().collect();
        if !(3..=4).contains(&chars.len()) {
            return None;
        }

        let mut packed = 0u8;
        for (slot, name) in CHANNEL_NAMES.iter().enumerate().take(chars.len()) {
            let position = chars.iter().position(|c| c == name)?;
            packed |= (position as u8) << (slot * 2);
        }
        Some(ColorOrder(packed))
    }
}

/// One channel row of an expander board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpanderChannel {
    pub channel: u8,
    pub led_type: LedType,
    pub num_colors: u8,
    pub color_order: ColorOrder,
    pub pixel_count: u16,
    pub start_index: u16,
    pub clock_speed: [u8; 4],
}

impl ExpanderChannel {
    pub fn is_used(&self) -> bool {
        self.led_type != LedType::NotUsed
    }
}

/// One 96-byte table: a board address and its eight channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpanderBoard {
    pub address: u8,
    pub channels: Vec<ExpanderChannel>,
}

pub fn decode_expander_config(bytes: &[u8]) -> Result<Vec<ExpanderBoard>, CodecError> {
    let Some((&version, tables)) = bytes.split_first() else {
        return Err(CodecError::MalformedFrame(
            "empty expander configuration".to_string(),
        ));
    };
    if version != EXPANDER_CONFIG_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: version as u32,
            expected: EXPANDER_CONFIG_VERSION.to_string(),
        });
    }
    if tables.len() % BOARD_SIZE != 0 {
        return Err(CodecError::MalformedFrame(format!(
            "expander tables are {} bytes, not a multiple of {}",
            tables.len(),
            BOARD_SIZE
        )));
    }

    Ok(tables
        .chunks_exact(BOARD_SIZE)
        .map(|table| {
            let channels: Vec<ExpanderChannel> =
                table.chunks_exact(ROW_SIZE).map(decode_row).collect();
            ExpanderBoard {
                address: table[0] >> 3,
                channels,
            }
        })
        .collect())
}

fn decode_row(row: &[u8]) -> ExpanderChannel {
    ExpanderChannel {
        channel: row[0] & 0b111,
        led_type: LedType::from(row[1]),
        num_colors: row[2],
        color_order: ColorOrder(row[3]),
        pixel_count: u16::from_le_bytes([row[4], row[5]]),
        start_index: u16::from_le_bytes([row[6], row[7]]),
        clock_speed: [row[8], row[9], row[10], row[11]],
    }
}

/// Inverse of [`decode_expander_config`].
///
/// Boards with fewer than eight channels are padded with unused rows.
pub fn encode_expander_config(boards: &[ExpanderBoard]) -> Result<Bytes, CodecError> {
    let mut buffer = BytesMut::with_capacity(1 + boards.len() * BOARD_SIZE);
    buffer.put_u8(EXPANDER_CONFIG_VERSION);

    for board in boards {
        if board.address > 0b1_1111 || board.channels.len() > CHANNELS_PER_BOARD {
            return Err(CodecError::MalformedFrame(format!(
                "board {} with {} channels cannot be encoded",
                board.address,
                board.channels.len()
            )));
        }
        for index in 0..CHANNELS_PER_BOARD {
            match board.channels.get(index) {
                Some(channel) => {
                    buffer.put_u8((board.address << 3) | (channel.channel & 0b111));
                    buffer.put_u8(channel.led_type.into());
                    buffer.put_u8(channel.num_colors);
                    buffer.put_u8(channel.color_order.0);
                    buffer.put_u16_le(channel.pixel_count);
                    buffer.put_u16_le(channel.start_index);
                    buffer.extend_from_slice(&channel.clock_speed);
                }
                None => {
                    buffer.put_u8((board.address << 3) | index as u8);
                    buffer.put_bytes(0, ROW_SIZE - 1);
                }
            }
        }
    }

    Ok(buffer.freeze())
}
