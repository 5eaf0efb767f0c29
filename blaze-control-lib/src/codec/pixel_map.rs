//! Pixel-map data (message type 8 and `/pixelmap.dat`).
//!
//! ```text
//! [format_version:u32][dimensions:u32][count:u32][coordinates...]
//! ```
//! Coordinates are `u8` for format 1 and little-endian `u16` for format 2,
//! scaled so that the largest integer maps to 1.0.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::codec::{read_u32_le, CodecError};

const HEADER_SIZE: usize = 12;

/// Integer width of the stored coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapFormat {
    /// Format version 1, used by v2 firmware.
    Bits8,
    /// Format version 2, used by v3 firmware.
    Bits16,
}

impl MapFormat {
    pub fn version(self) -> u32 {
        match self {
            MapFormat::Bits8 => 1,
            MapFormat::Bits16 => 2,
        }
    }

    pub fn from_version(version: u32) -> Result<Self, CodecError> {
        match version {
            1 => Ok(MapFormat::Bits8),
            2 => Ok(MapFormat::Bits16),
            found => Err(CodecError::UnsupportedVersion {
                found,
                expected: "1 or 2".to_string(),
            }),
        }
    }

    fn word_size(self) -> usize {
        match self {
            MapFormat::Bits8 => 1,
            MapFormat::Bits16 => 2,
        }
    }

    fn max_value(self) -> f64 {
        match self {
            MapFormat::Bits8 => u8::MAX as f64,
            MapFormat::Bits16 => u16::MAX as f64,
        }
    }
}

/// A decoded pixel map: one coordinate tuple per pixel, each value in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelMap {
    pub format: MapFormat,
    pub dimensions: usize,
    pub coordinates: Vec<Vec<f64>>,
}

impl PixelMap {
    pub fn pixel_count(&self) -> usize {
        self.coordinates.len()
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode_pixel_map(&self.coordinates, self.format)
    }
}

fn check_dimensions(coordinates: &[Vec<f64>]) -> Result<usize, CodecError> {
    let Some(first) = coordinates.first() else {
        return Err(CodecError::InvalidPixelMap("no coordinates".to_string()));
    };
    let dimensions = first.len();
    if !(1..=3).contains(&dimensions) {
        return Err(CodecError::InvalidPixelMap(format!(
            "{} dimensions, expected 1 to 3",
            dimensions
        )));
    }
    if let Some(index) = coordinates.iter().position(|c| c.len() != dimensions) {
        return Err(CodecError::InvalidPixelMap(format!(
            "pixel {} has {} dimensions, pixel 0 has {}",
            index,
            coordinates[index].len(),
            dimensions
        )));
    }
    Ok(dimensions)
}

/// Encodes coordinates already normalized into `[0, 1]`.
///
/// Values are rounded to the nearest representable integer. The header's
/// third word is the element (pixel) count.
pub fn encode_pixel_map(coordinates: &[Vec<f64>], format: MapFormat) -> Result<Bytes, CodecError> {
    let dimensions = check_dimensions(coordinates)?;
    let max_value = format.max_value();

    let mut buffer =
        BytesMut::with_capacity(HEADER_SIZE + coordinates.len() * dimensions * format.word_size());
    buffer.put_u32_le(format.version());
    buffer.put_u32_le(dimensions as u32);
    buffer.put_u32_le(coordinates.len() as u32);

    for (pixel, tuple) in coordinates.iter().enumerate() {
        for &value in tuple {
            if !(0.0..=1.0).contains(&value) {
                return Err(CodecError::InvalidPixelMap(format!(
                    "pixel {} coordinate {} is outside [0, 1]",
                    pixel, value
                )));
            }
            let scaled = (value * max_value).round();
            match format {
                MapFormat::Bits8 => buffer.put_u8(scaled as u8),
                MapFormat::Bits16 => buffer.put_u16_le(scaled as u16),
            }
        }
    }

    Ok(buffer.freeze())
}

/// Decodes pixel-map bytes.
///
/// The third header word may hold either the element count or, as in maps
/// written by the device's own mapper, the length of the coordinate data in
/// bytes. Anything that fits neither reading is rejected.
pub fn decode_pixel_map(bytes: &[u8]) -> Result<PixelMap, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::TruncatedContainer {
            field: "pixel map header",
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let format = MapFormat::from_version(read_u32_le(bytes, 0)?)?;
    let dimensions = read_u32_le(bytes, 4)? as usize;
    if !(1..=3).contains(&dimensions) {
        return Err(CodecError::InvalidPixelMap(format!(
            "{} dimensions, expected 1 to 3",
            dimensions
        )));
    }
    let count_word = read_u32_le(bytes, 8)? as usize;

    let data = &bytes[HEADER_SIZE..];
    let stride = dimensions * format.word_size();
    let element_count = if count_word * stride == data.len() {
        count_word
    } else if count_word == data.len() && data.len() % stride == 0 {
        debug!("pixel map header holds a byte length ({} bytes)", count_word);
        data.len() / stride
    } else {
        return Err(CodecError::InvalidPixelMap(format!(
            "header count {} does not match {} data bytes of {}-byte tuples",
            count_word,
            data.len(),
            stride
        )));
    };

    let max_value = format.max_value();
    let coordinates = data
        .chunks_exact(stride)
        .take(element_count)
        .map(|tuple| match format {
            MapFormat::Bits8 => tuple.iter().map(|&v| v as f64 / max_value).collect(),
            MapFormat::Bits16 => tuple
                .chunks_exact(2)
                .map(|word| u16::from_le_bytes([word[0], word[1]]) as f64 / max_value)
                .collect(),
        })
        .collect();

    Ok(PixelMap {
        format,
        dimensions,
        coordinates,
    })
}

/// Rescales arbitrary coordinates into `[0, 1]` independently per dimension.
///
/// A dimension in which every pixel has the same value maps to 0.
pub fn normalize_coordinates(coordinates: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, CodecError> {
    let dimensions = check_dimensions(coordinates)?;

    let mut min = vec![f64::INFINITY; dimensions];
    let mut max = vec![f64::NEG_INFINITY; dimensions];
    for tuple in coordinates {
        for (dimension, &value) in tuple.iter().enumerate() {
            if !value.is_finite() {
                return Err(CodecError::InvalidPixelMap(format!(
                    "non-finite coordinate {}",
                    value
                )));
            }
            min[dimension] = min[dimension].min(value);
            max[dimension] = max[dimension].max(value);
        }
    }

    Ok(coordinates
        .iter()
        .map(|tuple| {
            tuple
                .iter()
                .enumerate()
                .map(|(dimension, &value)| {
                    let range = max[dimension] - min[dimension];
                    if range > 0.0 {
                        (value - min[dimension]) / range
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_coordinates() -> Vec<Vec<f64>> {
        (0..50)
            .map(|i| {
                let t = i as f64 / 49.0;
                vec![t, (t * 7.3).fract(), 1.0 - t]
            })
            .collect()
    }

    #[test]
    fn test_round_trip_16_bit() {
        let coordinates = sample_coordinates();
        let encoded = encode_pixel_map(&coordinates, MapFormat::Bits16).unwrap();
        assert_eq!(encoded.len(), 12 + 50 * 3 * 2);

        let decoded = decode_pixel_map(&encoded).unwrap();
        assert_eq!(decoded.format, MapFormat::Bits16);
        assert_eq!(decoded.dimensions, 3);
        assert_eq!(decoded.pixel_count(), 50);
        for (original, restored) in coordinates.iter().zip(&decoded.coordinates) {
            for (a, b) in original.iter().zip(restored) {
                assert!((a - b).abs() <= 1.0 / 65535.0, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_round_trip_8_bit() {
        let coordinates: Vec<Vec<f64>> = vec![vec![0.0, 1.0], vec![0.5, 0.25], vec![0.999, 0.001]];
        let decoded = decode_pixel_map(&encode_pixel_map(&coordinates, MapFormat::Bits8).unwrap())
            .unwrap();
        for (original, restored) in coordinates.iter().zip(&decoded.coordinates) {
            for (a, b) in original.iter().zip(restored) {
                assert!((a - b).abs() <= 1.0 / 255.0);
            }
        }
    }

    #[test]
    fn test_accepts_byte_length_header() {
        // Two 2D pixels, 16-bit, header count written as a byte length.
        let mut bytes = vec![];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&8u32.to_le_bytes());
        for value in [0u16, 65535, 32768, 0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let decoded = decode_pixel_map(&bytes).unwrap();
        assert_eq!(decoded.pixel_count(), 2);
        assert_eq!(decoded.coordinates[0], vec![0.0, 1.0]);
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut bytes = encode_pixel_map(&[vec![0.5]], MapFormat::Bits16)
            .unwrap()
            .to_vec();
        bytes[0] = 3;
        assert!(matches!(
            decode_pixel_map(&bytes),
            Err(CodecError::UnsupportedVersion { found: 3, .. })
        ));

        bytes[0] = 2;
        bytes[4] = 4;
        assert!(matches!(
            decode_pixel_map(&bytes),
            Err(CodecError::InvalidPixelMap(_))
        ));

        assert!(matches!(
            decode_pixel_map(&[1, 0, 0]),
            Err(CodecError::TruncatedContainer { .. })
        ));
    }

    #[test]
    fn test_rejects_inconsistent_length() {
        let mut bytes = encode_pixel_map(&[vec![0.5, 0.5], vec![0.1, 0.2]], MapFormat::Bits16)
            .unwrap()
            .to_vec();
        bytes.pop();
        assert!(matches!(
            decode_pixel_map(&bytes),
            Err(CodecError::InvalidPixelMap(_))
        ));
    }

    #[test]
    fn test_encode_rejects_out_of_range_and_ragged_input() {
        assert!(encode_pixel_map(&[vec![1.5]], MapFormat::Bits8).is_err());
        assert!(encode_pixel_map(&[vec![0.1, 0.2], vec![0.3]], MapFormat::Bits8).is_err());
        assert!(encode_pixel_map(&[], MapFormat::Bits8).is_err());
        assert!(encode_pixel_map(&[vec![0.0; 4]], MapFormat::Bits8).is_err());
    }

    #[test]
    fn test_normalize_coordinates() {
        let normalized =
            normalize_coordinates(&[vec![-10.0, 5.0], vec![10.0, 5.0], vec![0.0, 5.0]]).unwrap();
        assert_eq!(
            normalized,
            vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.5, 0.0]]
        );
    }
}
