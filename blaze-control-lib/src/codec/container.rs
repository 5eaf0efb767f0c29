//! On-disk containers: single binary patterns and whole-device backups.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{read_u32_le, CodecError};

const PATTERN_HEADER_WORDS: usize = 9;
const PATTERN_HEADER_SIZE: usize = PATTERN_HEADER_WORDS * 4;

/// A pattern as stored under `/p/<id>` on the device.
///
/// The header is nine little-endian words: a format version followed by
/// `(offset, length)` pairs for the name, preview JPEG, bytecode and
/// compressed source, in that order. `source_code` is kept in its stored
/// (LZ-compressed) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPattern {
    pub id: String,
    pub format_version: u32,
    pub name: String,
    pub preview_image: Bytes,
    pub byte_code: Bytes,
    pub source_code: Bytes,
}

pub fn decode_binary_pattern_container(id: &str, bytes: &[u8]) -> Result<BinaryPattern, CodecError> {
    if bytes.len() < PATTERN_HEADER_SIZE {
        return Err(CodecError::TruncatedContainer {
            field: "header",
            needed: PATTERN_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let mut words = [0u32; PATTERN_HEADER_WORDS];
    for (index, word) in words.iter_mut().enumerate() {
        *word = read_u32_le(bytes, index * 4)?;
    }

    let section = |field: &'static str, pair: usize| -> Result<Bytes, CodecError> {
        let offset = words[1 + pair * 2] as usize;
        let length = words[2 + pair * 2] as usize;
        let end = offset.checked_add(length).unwrap_or(usize::MAX);
        if end > bytes.len() {
            return Err(CodecError::TruncatedContainer {
                field,
                needed: end,
                available: bytes.len(),
            });
        }
        Ok(Bytes::copy_from_slice(&bytes[offset..end]))
    };

    let name = section("name", 0)?;
    let preview_image = section("preview image", 1)?;
    let byte_code = section("bytecode", 2)?;
    let source_code = section("source", 3)?;

    let name = String::from_utf8(name.to_vec())
        .map_err(|_| CodecError::MalformedFrame("pattern name is not UTF-8".to_string()))?;

    Ok(BinaryPattern {
        id: id.to_string(),
        format_version: words[0],
        name,
        preview_image,
        byte_code,
        source_code,
    })
}

/// Lays the sections out back to back after the header.
pub fn encode_binary_pattern_container(pattern: &BinaryPattern) -> Bytes {
    let sections: [&[u8]; 4] = [
        pattern.name.as_bytes(),
        &pattern.preview_image,
        &pattern.byte_code,
        &pattern.source_code,
    ];
    let total = PATTERN_HEADER_SIZE + sections.iter().map(|s| s.len()).sum::<usize>();

    let mut buffer = BytesMut::with_capacity(total);
    buffer.put_u32_le(pattern.format_version);
    let mut offset = PATTERN_HEADER_SIZE;
    for section in &sections {
        buffer.put_u32_le(offset as u32);
        buffer.put_u32_le(section.len() as u32);
        offset += section.len();
    }
    for section in &sections {
        buffer.extend_from_slice(section);
    }
    buffer.freeze()
}

impl BinaryPattern {
    pub fn from_bytes(id: &str, bytes: &[u8]) -> Result<Self, CodecError> {
        decode_binary_pattern_container(id, bytes)
    }

    pub fn to_bytes(&self) -> Bytes {
        encode_binary_pattern_container(self)
    }
}

bitflags! {
    /// Categories of files on the device filesystem.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileTypes: u32 {
        const CONFIG = 1;
        const PATTERN = 2;
        const PATTERN_SETTING = 4;
        const PLAYLIST = 8;
        const SYSTEM = 16;
        const OTHER = 32;
    }
}

const CONFIG_FILES: [&str; 5] = [
    "config.json",
    "config2.json",
    "obconf.dat",
    "pixelmap.txt",
    "pixelmap.dat",
];

impl FileTypes {
    /// Category of a device path such as `/p/abc123.c`.
    pub fn classify(path: &str) -> FileTypes {
        let bare = path.strip_prefix('/').unwrap_or(path);
        if CONFIG_FILES.contains(&bare) {
            FileTypes::CONFIG
        } else if path.starts_with("/p/") {
            if path.ends_with(".c") {
                FileTypes::PATTERN_SETTING
            } else {
                FileTypes::PATTERN
            }
        } else if path.starts_with("/l/") {
            FileTypes::PLAYLIST
        } else if path.ends_with(".gz") {
            FileTypes::SYSTEM
        } else {
            FileTypes::OTHER
        }
    }

    /// Everything except the web application itself.
    pub fn user_files() -> FileTypes {
        FileTypes::all() - FileTypes::SYSTEM
    }
}

/// Sorted names from `names` whose category is in `types`.
pub fn filter_file_names<I, S>(names: I, types: FileTypes) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut selected: Vec<String> = names
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .filter(|name| !name.is_empty() && types.intersects(FileTypes::classify(name)))
        .collect();
    selected.sort();
    selected
}

#[derive(Serialize, Deserialize)]
struct BackupDocument {
    files: BTreeMap<String, String>,
}

/// A whole-device backup: `{"files": {"<path>": "<base64>", ...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backup {
    pub device_name: String,
    files: BTreeMap<String, Bytes>,
}

impl Backup {
    pub fn new(device_name: &str) -> Self {
        Backup {
            device_name: device_name.to_string(),
            files: BTreeMap::new(),
        }
    }

    /// Parses backup text, tolerating a leading byte-order mark.
    pub fn parse(device_name: &str, text: &str) -> Result<Self, CodecError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let document: BackupDocument =
            serde_json::from_str(text).map_err(|e| CodecError::InvalidBackup(e.to_string()))?;

        let mut files = BTreeMap::new();
        for (path, encoded) in document.files {
            let contents = STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| CodecError::InvalidBackup(format!("{}: {}", path, e)))?;
            files.insert(path, Bytes::from(contents));
        }

        Ok(Backup {
            device_name: device_name.to_string(),
            files,
        })
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        let document = BackupDocument {
            files: self
                .files
                .iter()
                .map(|(path, contents)| (path.clone(), STANDARD.encode(contents)))
                .collect(),
        };
        serde_json::to_string_pretty(&document).map_err(|e| CodecError::InvalidBackup(e.to_string()))
    }

    pub fn file_list(&self, types: FileTypes) -> Vec<String> {
        filter_file_names(self.files.keys(), types)
    }

    pub fn get_file(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path)
    }

    pub fn put_file(&mut self, path: &str, contents: impl Into<Bytes>) {
        self.files.insert(path.to_string(), contents.into());
    }

    /// Returns whether the file was present.
    pub fn delete_file(&mut self, path: &str) -> bool {
        self.files.remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pattern() -> BinaryPattern {
        BinaryPattern {
            id: "xYz123".to_string(),
            format_version: 1,
            name: "rainbow melt".to_string(),
            preview_image: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            byte_code: Bytes::from_static(&[1, 2, 3, 4, 5, 6]),
            source_code: Bytes::from_static(b"N4Ig"),
        }
    }

    #[test]
    fn test_pattern_container_sections() {
        let bytes = sample_pattern().to_bytes();
        assert_eq!(read_u32_le(&bytes, 4).unwrap(), 36);
        assert_eq!(read_u32_le(&bytes, 8).unwrap(), 12);

        let decoded = BinaryPattern::from_bytes("xYz123", &bytes).unwrap();
        assert_eq!(decoded, sample_pattern());
    }

    #[test]
    fn test_truncated_pattern_container() {
        let bytes = sample_pattern().to_bytes();
        let cut = &bytes[..bytes.len() - 1];
        assert_eq!(
            decode_binary_pattern_container("x", cut),
            Err(CodecError::TruncatedContainer {
                field: "source",
                needed: bytes.len(),
                available: bytes.len() - 1
            })
        );
        assert!(matches!(
            decode_binary_pattern_container("x", &bytes[..20]),
            Err(CodecError::TruncatedContainer { field: "header", .. })
        ));
    }

    #[test]
    fn test_offset_overflow_is_truncation() {
        let mut bytes = sample_pattern().to_bytes().to_vec();
        bytes[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_binary_pattern_container("x", &bytes),
            Err(CodecError::TruncatedContainer { field: "name", .. })
        ));
    }

    #[test]
    fn test_classify_files() {
        assert_eq!(FileTypes::classify("/config.json"), FileTypes::CONFIG);
        assert_eq!(FileTypes::classify("/pixelmap.dat"), FileTypes::CONFIG);
        assert_eq!(FileTypes::classify("/p/abc"), FileTypes::PATTERN);
        assert_eq!(FileTypes::classify("/p/abc.c"), FileTypes::PATTERN_SETTING);
        assert_eq!(FileTypes::classify("/l/_defaultplaylist_"), FileTypes::PLAYLIST);
        assert_eq!(FileTypes::classify("/index.html.gz"), FileTypes::SYSTEM);
        assert_eq!(FileTypes::classify("/favicon.ico"), FileTypes::OTHER);
    }

    #[test]
    fn test_backup_round_trip_with_bom() {
        let text = "\u{feff}{\"files\": {\"/p/b\": \"AQID\", \"/config.json\": \"e30=\", \"/x.gz\": \"\"}}";
        let mut backup = Backup::parse("living-room", text).unwrap();
        assert_eq!(backup.len(), 3);
        assert_eq!(backup.get_file("/p/b").unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(
            backup.file_list(FileTypes::user_files()),
            vec!["/config.json".to_string(), "/p/b".to_string()]
        );

        backup.put_file("/p/b.c", &b"{}"[..]);
        assert!(backup.delete_file("/x.gz"));
        assert!(!backup.delete_file("/x.gz"));

        let reparsed = Backup::parse("living-room", &backup.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, backup);
    }

    #[test]
    fn test_invalid_backup() {
        assert!(matches!(
            Backup::parse("x", "{\"nofiles\": {}}"),
            Err(CodecError::InvalidBackup(_))
        ));
        assert!(matches!(
            Backup::parse("x", "{\"files\": {\"/a\": \"***\"}}"),
            Err(CodecError::InvalidBackup(_))
        ));
    }
}
