use std::collections::BTreeMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::codec::MessageType;
use crate::transport::{PushKind, ResponseMatcher};

/// Characters the device uses in pattern ids.
pub const PATTERN_ID_ALPHABET: &str = "23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";
pub const PATTERN_ID_LENGTH: usize = 17;

pub const DEFAULT_PLAYLIST: &str = "_defaultplaylist_";

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerMode {
    Off,
    ShuffleAll,
    Playlist,
}

impl SequencerMode {
    pub fn code(self) -> u8 {
        match self {
            SequencerMode::Off => 0,
            SequencerMode::ShuffleAll => 1,
            SequencerMode::Playlist => 2,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(SequencerMode::Off),
            1 => Some(SequencerMode::ShuffleAll),
            2 => Some(SequencerMode::Playlist),
            _ => None,
        }
    }
}

impl fmt::Display for SequencerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequencerMode::Off => "off",
            SequencerMode::ShuffleAll => "shuffle-all",
            SequencerMode::Playlist => "playlist",
        };
        write!(f, "{}", name)
    }
}

/// Websocket commands understood by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    GetConfig,
    SendPreviewFrames(bool),
    ListPatterns,
    SetActivePattern { id: String, save: bool },
    DeletePattern(String),
    GetPreviewImage(String),
    GetPatternSource(String),
    GetPatternControls(String),
    GetVariables,
    SetVariables(Map<String, Value>),
    SetControls { controls: Map<String, Value>, save: bool },
    SetBrightness { brightness: f64, save: bool },
    SetBrightnessLimit { percent: u8, save: bool },
    SetSequencerMode { mode: SequencerMode, save: bool },
    RunSequencer(bool),
    NextPattern { save: bool },
    SetShuffleTime { millis: u64, save: bool },
    GetPlaylist(String),
    SetPlaylist(Value),
    SetDeviceName(String),
    SetPixelCount { count: u32, save: bool },
    SavePixelMap,
    Pause(bool),
    SetCode { size: usize, crc: u32, id: String },
}

impl Command {
    /// Short name used in error context.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::GetConfig => "getConfig",
            Command::SendPreviewFrames(_) => "sendUpdates",
            Command::ListPatterns => "listPrograms",
            Command::SetActivePattern { .. } => "activeProgramId",
            Command::DeletePattern(_) => "deleteProgram",
            Command::GetPreviewImage(_) => "getPreviewImg",
            Command::GetPatternSource(_) => "getSources",
            Command::GetPatternControls(_) => "getControls",
            Command::GetVariables => "getVars",
            Command::SetVariables(_) => "setVars",
            Command::SetControls { .. } => "setControls",
            Command::SetBrightness { .. } => "brightness",
            Command::SetBrightnessLimit { .. } => "maxBrightness",
            Command::SetSequencerMode { .. } => "sequencerMode",
            Command::RunSequencer(_) => "runSequencer",
            Command::NextPattern { .. } => "nextProgram",
            Command::SetShuffleTime { .. } => "sequenceTimer",
            Command::GetPlaylist(_) => "getPlaylist",
            Command::SetPlaylist(_) => "playlist",
            Command::SetDeviceName(_) => "name",
            Command::SetPixelCount { .. } => "pixelCount",
            Command::SavePixelMap => "savePixelMap",
            Command::Pause(_) => "pause",
            Command::SetCode { .. } => "setCode",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Command::Ping => json!({ "ping": true }),
            Command::GetConfig => json!({ "getConfig": true }),
            Command::SendPreviewFrames(enabled) => json!({ "sendUpdates": enabled }),
            Command::ListPatterns => json!({ "listPrograms": true }),
            Command::SetActivePattern { id, save } => {
                json!({ "activeProgramId": id, "save": save })
            }
            Command::DeletePattern(id) => json!({ "deleteProgram": id }),
            Command::GetPreviewImage(id) => json!({ "getPreviewImg": id }),
            Command::GetPatternSource(id) => json!({ "getSources": id }),
            Command::GetPatternControls(id) => json!({ "getControls": id }),
            Command::GetVariables => json!({ "getVars": true }),
            Command::SetVariables(variables) => json!({ "setVars": variables }),
            Command::SetControls { controls, save } => {
                json!({ "setControls": controls, "save": save })
            }
            Command::SetBrightness { brightness, save } => {
                json!({ "brightness": brightness.clamp(0.0, 1.0), "save": save })
            }
            Command::SetBrightnessLimit { percent, save } => {
                json!({ "maxBrightness": (*percent).min(100), "save": save })
            }
            Command::SetSequencerMode { mode, save } => {
                json!({ "sequencerMode": mode.code(), "save": save })
            }
            Command::RunSequencer(run) => json!({ "runSequencer": run }),
            Command::NextPattern { save } => json!({ "nextProgram": true, "save": save }),
            Command::SetShuffleTime { millis, save } => {
                json!({ "sequenceTimer": millis, "save": save })
            }
            Command::GetPlaylist(id) => json!({ "getPlaylist": id }),
            Command::SetPlaylist(playlist) => playlist.clone(),
            Command::SetDeviceName(name) => json!({ "name": name }),
            Command::SetPixelCount { count, save } => json!({ "pixelCount": count, "save": save }),
            Command::SavePixelMap => json!({ "savePixelMap": true }),
            Command::Pause(pause) => json!({ "pause": pause }),
            Command::SetCode { size, crc, id } => json!({
                "pause": true,
                "setCode": { "size": size, "crc": crc, "name": "", "id": id }
            }),
        }
    }

    /// The reply to wait for, or `None` for fire-and-forget commands.
    pub fn expected_response(&self) -> Option<ResponseMatcher> {
        match self {
            Command::Ping
            | Command::SetControls { .. }
            | Command::Pause(_)
            | Command::SetCode { .. } => Some(ResponseMatcher::json_key("ack")),
            Command::GetConfig => Some(ResponseMatcher::json_key("pixelCount")),
            Command::SendPreviewFrames(true) => Some(ResponseMatcher::Push(PushKind::PreviewFrame)),
            Command::ListPatterns => Some(ResponseMatcher::Binary(MessageType::GetProgramList)),
            Command::SetActivePattern { .. } => {
                Some(ResponseMatcher::Push(PushKind::SequencerState))
            }
            Command::GetPreviewImage(_) => Some(ResponseMatcher::Binary(MessageType::PreviewImage)),
            Command::GetPatternSource(_) => {
                Some(ResponseMatcher::Binary(MessageType::GetSourceCode))
            }
            Command::GetPatternControls(_) => Some(ResponseMatcher::json_key("controls")),
            Command::GetVariables => Some(ResponseMatcher::json_key("vars")),
            Command::GetPlaylist(_) => Some(ResponseMatcher::json_key("playlist")),
            _ => None,
        }
    }
}

/// The settings part of a getConfig reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub brand_name: Option<String>,
    #[serde(default)]
    pub pixel_count: u32,
    #[serde(default)]
    pub brightness: f64,
    #[serde(default)]
    pub max_brightness: Option<f64>,
    #[serde(default)]
    pub led_type: Option<u8>,
    #[serde(default)]
    pub data_speed: Option<u64>,
    #[serde(default)]
    pub color_order: Option<String>,
    /// Firmware version. Older firmware sends it as a number.
    #[serde(default, deserialize_with = "string_or_number")]
    pub ver: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigSettings {
    /// Major firmware version, e.g. 3 for "3.40".
    pub fn version_major(&self) -> Option<u32> {
        self.ver.as_deref()?.split('.').next()?.trim().parse().ok()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveProgram {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub active_program_id: Option<String>,
    #[serde(default)]
    pub controls: Map<String, Value>,
}

/// The sequencer state pushed as part of getConfig and after pattern changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencerState {
    #[serde(default)]
    pub active_program: ActiveProgram,
    #[serde(default)]
    pub sequencer_mode: Option<u64>,
    #[serde(default)]
    pub run_sequencer: Option<bool>,
    #[serde(default)]
    pub ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SequencerState {
    pub fn mode(&self) -> Option<SequencerMode> {
        self.sequencer_mode.and_then(SequencerMode::from_code)
    }
}

/// Renderer statistics pushed about once a second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub fps: f64,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub storage_used: Option<u64>,
    #[serde(default)]
    pub storage_size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parses the type-7 pattern list: one `id<TAB>name` per line.
pub fn parse_pattern_list(payload: &[u8]) -> BTreeMap<String, String> {
    String::from_utf8_lossy(payload)
        .split('\n')
        .filter_map(|line| {
            let mut fields = line.split('\t');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(id), Some(name), None) if !id.is_empty() => {
                    Some((id.to_string(), name.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}
