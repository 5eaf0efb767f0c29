pub mod commands;
pub mod files;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use log::{debug, info};
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::codec::expander::decode_expander_config;
use crate::codec::frame::decode_preview_frame;
use crate::codec::pixel_map::{decode_pixel_map, encode_pixel_map, normalize_coordinates};
use crate::codec::{ExpanderBoard, MapFormat, MessageType, PixelMap, RGB};
use crate::transport::{
    ConnectionManager, ConnectionOptions, InboundMessage, Outbound, PushKind, PushMessage,
    ResponseMatcher, TransportError,
};

pub use commands::{
    Command, ConfigSettings, SequencerMode, SequencerState, Statistics, DEFAULT_PLAYLIST,
};

use commands::{parse_pattern_list, PATTERN_ID_ALPHABET, PATTERN_ID_LENGTH};

/// How long the pattern list is reused before it is fetched again.
pub const DEFAULT_CACHE_REFRESH: Duration = Duration::from_secs(600);

/// Grace period for the optional expander part of a getConfig reply.
const EXPANDER_GRACE: Duration = Duration::from_millis(500);

/// The three independently arriving parts of a getConfig reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceConfig {
    pub settings: ConfigSettings,
    pub sequencer: Option<SequencerState>,
    /// Empty when no output expander is configured.
    pub expander: Vec<ExpanderBoard>,
}

#[derive(Debug)]
struct PatternCache {
    patterns: BTreeMap<String, String>,
    refreshed_at: Option<Instant>,
    refresh_interval: Duration,
}

impl PatternCache {
    fn fresh(&self) -> Option<BTreeMap<String, String>> {
        let refreshed_at = self.refreshed_at?;
        (refreshed_at.elapsed() < self.refresh_interval).then(|| self.patterns.clone())
    }

    fn store(&mut self, patterns: BTreeMap<String, String>) {
        self.patterns = patterns;
        self.refreshed_at = Some(Instant::now());
    }

    fn invalidate(&mut self) {
        self.refreshed_at = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Random pattern id in the format the device generates.
pub fn make_pattern_id() -> String {
    let alphabet = PATTERN_ID_ALPHABET.as_bytes();
    let mut rng = rand::thread_rng();
    (0..PATTERN_ID_LENGTH)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Client for one controller: websocket commands plus the HTTP file API.
pub struct ControlInterface {
    pub host: String,
    http_base: String,
    client: Client,
    connection: ConnectionManager,
    patterns: Mutex<PatternCache>,
    pixel_count: Mutex<Option<u32>>,
}

impl ControlInterface {
    pub async fn new(host: &str) -> anyhow::Result<Self> {
        ControlInterface::with_options(host, ConnectionOptions::default()).await
    }

    pub async fn with_options(host: &str, options: ConnectionOptions) -> anyhow::Result<Self> {
        let connection = ConnectionManager::open(host, options)
            .await
            .with_context(|| format!("Failed to connect to {}", host))?;

        Ok(ControlInterface {
            host: host.to_string(),
            http_base: format!("http://{}", host),
            client: Client::new(),
            connection,
            patterns: Mutex::new(PatternCache {
                patterns: BTreeMap::new(),
                refreshed_at: None,
                refresh_interval: DEFAULT_CACHE_REFRESH,
            }),
            pixel_count: Mutex::new(None),
        })
    }

    /// Uses a non-standard port for the HTTP file API.
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_base = format!("http://{}:{}", self.host, port);
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Receives statistics, sequencer changes and preview frames as they arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.connection.subscribe()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    pub(crate) fn get_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.http_base, endpoint.trim_start_matches('/'))
    }

    async fn request_with_timeout(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> anyhow::Result<InboundMessage> {
        let matcher = command
            .expected_response()
            .ok_or_else(|| anyhow!("{} has no response to wait for", command.name()))?;
        let transport = self.connection.ensure_open().await?;
        transport
            .send_and_wait(command.to_json(), matcher, timeout)
            .await
            .with_context(|| format!("Failed to {}", command.name()))
    }

    async fn request(&self, command: &Command) -> anyhow::Result<InboundMessage> {
        self.request_with_timeout(command, self.connection.options().response_timeout)
            .await
    }

    async fn request_json(&self, command: &Command) -> anyhow::Result<Value> {
        self.request(command)
            .await?
            .into_json()
            .ok_or_else(|| anyhow!("Unexpected binary reply to {}", command.name()))
    }

    async fn request_binary(&self, command: &Command) -> anyhow::Result<Bytes> {
        self.request(command)
            .await?
            .into_binary()
            .map(|(_, payload)| payload)
            .ok_or_else(|| anyhow!("Unexpected JSON reply to {}", command.name()))
    }

    /// Sends `command`, waiting for its reply only if it has one.
    pub async fn send_command(&self, command: &Command) -> anyhow::Result<Option<InboundMessage>> {
        if command.expected_response().is_some() {
            return self.request(command).await.map(Some);
        }
        self.connection
            .send_only(command.to_json())
            .await
            .with_context(|| format!("Failed to send {}", command.name()))?;
        Ok(None)
    }

    async fn send_binary(&self, message_type: MessageType, payload: Bytes) -> anyhow::Result<()> {
        self.connection
            .send_and_wait(
                Outbound::binary(message_type, payload),
                ResponseMatcher::json_key("ack"),
            )
            .await
            .with_context(|| format!("Failed to send {:?}", message_type))?;
        Ok(())
    }

    /// Round-trip time of a ping.
    pub async fn ping(&self) -> anyhow::Result<Duration> {
        let started = Instant::now();
        self.request(&Command::Ping).await?;
        Ok(started.elapsed())
    }

    /// Requests the configuration and collects its three parts in whatever
    /// order they arrive.
    pub async fn get_config(&self) -> anyhow::Result<DeviceConfig> {
        let transport = self.connection.ensure_open().await?;
        let timeout = self.connection.options().response_timeout;

        let command = Command::GetConfig;
        let matcher = command
            .expected_response()
            .ok_or_else(|| anyhow!("getConfig has no response to wait for"))?;
        let reply = transport
            .send_fresh_and_wait(command.to_json(), matcher, timeout)
            .await
            .context("Failed to get config settings")?;
        let settings: ConfigSettings = serde_json::from_value(
            reply
                .into_json()
                .ok_or_else(|| anyhow!("Unexpected binary config reply"))?,
        )
        .context("Failed to parse config settings")?;
        *lock(&self.pixel_count) = Some(settings.pixel_count);

        let sequencer = match transport
            .wait_for_push(PushKind::SequencerState, timeout)
            .await
        {
            Ok(message) => Some(
                serde_json::from_value(message.into_json().unwrap_or_default())
                    .context("Failed to parse sequencer state")?,
            ),
            Err(TransportError::ResponseTimeout(_)) => {
                debug!("no sequencer state in config reply");
                None
            }
            Err(err) => return Err(err).context("Failed to get sequencer state"),
        };

        let expander = match transport
            .wait_for_push(PushKind::ExpanderConfig, EXPANDER_GRACE.min(timeout))
            .await
        {
            Ok(message) => match message.into_binary() {
                Some((_, payload)) => decode_expander_config(&payload)
                    .context("Failed to decode expander configuration")?,
                None => Vec::new(),
            },
            Err(TransportError::ResponseTimeout(_)) => Vec::new(),
            Err(err) => return Err(err).context("Failed to get expander configuration"),
        };

        Ok(DeviceConfig {
            settings,
            sequencer,
            expander,
        })
    }

    pub async fn get_config_settings(&self) -> anyhow::Result<ConfigSettings> {
        Ok(self.get_config().await?.settings)
    }

    pub async fn get_config_sequencer(&self) -> anyhow::Result<SequencerState> {
        self.get_config()
            .await?
            .sequencer
            .ok_or_else(|| anyhow!("Device did not report its sequencer state"))
    }

    pub async fn get_config_expander(&self) -> anyhow::Result<Vec<ExpanderBoard>> {
        Ok(self.get_config().await?.expander)
    }

    /// The most recent statistics push, waiting for one if none arrived yet.
    pub async fn get_statistics(&self) -> anyhow::Result<Statistics> {
        let message = self
            .connection
            .wait_for_push(PushKind::Statistics)
            .await
            .context("Failed to get statistics")?;
        let value = message
            .into_json()
            .ok_or_else(|| anyhow!("Unexpected binary statistics"))?;
        serde_json::from_value(value).context("Failed to parse statistics")
    }

    pub async fn set_send_preview_frames(&self, enabled: bool) -> anyhow::Result<()> {
        let transport = self.connection.ensure_open().await?;
        transport.set_preview_frames(enabled);
        if !enabled {
            self.send_command(&Command::SendPreviewFrames(false)).await?;
        } else {
            self.request(&Command::SendPreviewFrames(true)).await?;
        }
        Ok(())
    }

    /// The next rendered frame.
    pub async fn get_preview_frame(&self) -> anyhow::Result<Vec<RGB>> {
        let pixel_count = self.get_pixel_count().await?;
        self.connection.ensure_open().await?.set_preview_frames(true);
        let payload = self
            .request(&Command::SendPreviewFrames(true))
            .await?
            .into_binary()
            .map(|(_, payload)| payload)
            .ok_or_else(|| anyhow!("Unexpected JSON preview frame"))?;
        decode_preview_frame(&payload, pixel_count as usize).context("Failed to decode preview frame")
    }

    /// Pattern ids mapped to names, served from the cache while it is fresh.
    pub async fn get_pattern_list(&self, force_refresh: bool) -> anyhow::Result<BTreeMap<String, String>> {
        if !force_refresh {
            if let Some(patterns) = lock(&self.patterns).fresh() {
                return Ok(patterns);
            }
        }

        // Large lists take a while to stream.
        let timeout = self.connection.options().response_timeout * 3;
        let payload = self
            .request_with_timeout(&Command::ListPatterns, timeout)
            .await?
            .into_binary()
            .map(|(_, payload)| payload)
            .ok_or_else(|| anyhow!("Unexpected JSON pattern list"))?;
        let patterns = parse_pattern_list(&payload);
        debug!("fetched {} patterns from {}", patterns.len(), self.host);
        lock(&self.patterns).store(patterns.clone());
        Ok(patterns)
    }

    pub fn set_cache_refresh_time(&self, interval: Duration) {
        lock(&self.patterns).refresh_interval = interval;
    }

    /// Resolves a pattern id or name to an id.
    pub async fn find_pattern_id(&self, id_or_name: &str) -> anyhow::Result<Option<String>> {
        let patterns = self.get_pattern_list(false).await?;
        if patterns.contains_key(id_or_name) {
            return Ok(Some(id_or_name.to_string()));
        }
        Ok(patterns
            .into_iter()
            .find(|(_, name)| name == id_or_name)
            .map(|(id, _)| id))
    }

    /// Activates a pattern by id or name.
    pub async fn set_active_pattern(&self, id_or_name: &str, save: bool) -> anyhow::Result<()> {
        let Some(id) = self.find_pattern_id(id_or_name).await? else {
            bail!("No pattern with id or name {:?}", id_or_name);
        };
        self.set_active_pattern_id(&id, save).await
    }

    pub async fn set_active_pattern_id(&self, id: &str, save: bool) -> anyhow::Result<()> {
        self.request(&Command::SetActivePattern {
            id: id.to_string(),
            save,
        })
        .await?;
        info!("activated pattern {} on {}", id, self.host);
        Ok(())
    }

    pub async fn get_active_pattern(&self) -> anyhow::Result<Option<String>> {
        Ok(self
            .get_config_sequencer()
            .await?
            .active_program
            .active_program_id)
    }

    pub async fn delete_pattern(&self, id: &str) -> anyhow::Result<()> {
        self.send_command(&Command::DeletePattern(id.to_string()))
            .await?;
        lock(&self.patterns).invalidate();
        Ok(())
    }

    /// JPEG preview of a pattern.
    pub async fn get_preview_image(&self, id: &str) -> anyhow::Result<Bytes> {
        self.request_binary(&Command::GetPreviewImage(id.to_string()))
            .await
    }

    /// Pattern source in its stored, compressed form.
    pub async fn get_pattern_source(&self, id: &str) -> anyhow::Result<Bytes> {
        self.request_binary(&Command::GetPatternSource(id.to_string()))
            .await
    }

    pub async fn get_pattern_controls(&self, id: &str) -> anyhow::Result<Map<String, Value>> {
        let reply = self
            .request_json(&Command::GetPatternControls(id.to_string()))
            .await?;
        let controls = reply.get("controls").cloned().unwrap_or_default();
        let controls = controls.get(id).cloned().unwrap_or(controls);
        Ok(match controls {
            Value::Object(map) => map,
            _ => Map::new(),
        })
    }

    pub async fn get_active_controls(&self) -> anyhow::Result<Map<String, Value>> {
        Ok(self.get_config_sequencer().await?.active_program.controls)
    }

    pub async fn set_active_controls(
        &self,
        controls: Map<String, Value>,
        save: bool,
    ) -> anyhow::Result<()> {
        self.request(&Command::SetControls { controls, save })
            .await?;
        Ok(())
    }

    /// Variables exported by the running pattern.
    pub async fn get_active_variables(&self) -> anyhow::Result<Map<String, Value>> {
        let reply = self.request_json(&Command::GetVariables).await?;
        Ok(match reply.get("vars") {
            Some(Value::Object(vars)) => vars.clone(),
            _ => Map::new(),
        })
    }

    pub async fn set_active_variables(&self, variables: Map<String, Value>) -> anyhow::Result<()> {
        self.send_command(&Command::SetVariables(variables)).await?;
        Ok(())
    }

    pub async fn get_brightness_slider(&self) -> anyhow::Result<f64> {
        Ok(self.get_config_settings().await?.brightness)
    }

    /// Sets the UI brightness slider; values are clamped to `0..=1`.
    pub async fn set_brightness_slider(&self, brightness: f64, save: bool) -> anyhow::Result<()> {
        self.send_command(&Command::SetBrightness { brightness, save })
            .await?;
        Ok(())
    }

    /// Global brightness limit in percent.
    pub async fn get_brightness_limit(&self) -> anyhow::Result<Option<f64>> {
        Ok(self.get_config_settings().await?.max_brightness)
    }

    pub async fn set_brightness_limit(&self, percent: u8, save: bool) -> anyhow::Result<()> {
        self.send_command(&Command::SetBrightnessLimit { percent, save })
            .await?;
        Ok(())
    }

    pub async fn get_sequencer_mode(&self) -> anyhow::Result<SequencerMode> {
        let sequencer = self.get_config_sequencer().await?;
        sequencer
            .mode()
            .ok_or_else(|| anyhow!("Unknown sequencer mode {:?}", sequencer.sequencer_mode))
    }

    pub async fn set_sequencer_mode(&self, mode: SequencerMode, save: bool) -> anyhow::Result<()> {
        self.send_command(&Command::SetSequencerMode { mode, save })
            .await?;
        Ok(())
    }

    /// Whether the sequencer is running.
    pub async fn get_sequencer_state(&self) -> anyhow::Result<bool> {
        Ok(self
            .get_config_sequencer()
            .await?
            .run_sequencer
            .unwrap_or(false))
    }

    pub async fn play_sequencer(&self) -> anyhow::Result<()> {
        self.send_command(&Command::RunSequencer(true)).await?;
        Ok(())
    }

    pub async fn pause_sequencer(&self) -> anyhow::Result<()> {
        self.send_command(&Command::RunSequencer(false)).await?;
        Ok(())
    }

    pub async fn next_sequencer(&self, save: bool) -> anyhow::Result<()> {
        self.send_command(&Command::NextPattern { save }).await?;
        Ok(())
    }

    pub async fn get_sequencer_shuffle_time(&self) -> anyhow::Result<Option<Duration>> {
        Ok(self
            .get_config_sequencer()
            .await?
            .ms
            .map(Duration::from_millis))
    }

    pub async fn set_sequencer_shuffle_time(&self, interval: Duration, save: bool) -> anyhow::Result<()> {
        self.send_command(&Command::SetShuffleTime {
            millis: interval.as_millis() as u64,
            save,
        })
        .await?;
        Ok(())
    }

    pub async fn get_sequencer_playlist(&self, playlist_id: &str) -> anyhow::Result<Value> {
        self.request_json(&Command::GetPlaylist(playlist_id.to_string()))
            .await
    }

    /// Replaces a playlist with `contents` as returned by
    /// [`get_sequencer_playlist`](Self::get_sequencer_playlist).
    pub async fn set_sequencer_playlist(&self, contents: Value) -> anyhow::Result<()> {
        if contents.get("playlist").is_none() {
            bail!("Playlist contents must have a \"playlist\" object");
        }
        self.send_command(&Command::SetPlaylist(contents)).await?;
        Ok(())
    }

    pub async fn get_device_name(&self) -> anyhow::Result<String> {
        Ok(self.get_config_settings().await?.name)
    }

    pub async fn set_device_name(&self, name: &str) -> anyhow::Result<()> {
        self.send_command(&Command::SetDeviceName(name.to_string()))
            .await?;
        Ok(())
    }

    /// Pixel count, cached after the first config fetch.
    pub async fn get_pixel_count(&self) -> anyhow::Result<u32> {
        if let Some(count) = *lock(&self.pixel_count) {
            return Ok(count);
        }
        Ok(self.get_config_settings().await?.pixel_count)
    }

    pub async fn set_pixel_count(&self, count: u32, save: bool) -> anyhow::Result<()> {
        self.send_command(&Command::SetPixelCount { count, save })
            .await?;
        *lock(&self.pixel_count) = Some(count);
        Ok(())
    }

    pub async fn get_version(&self) -> anyhow::Result<String> {
        self.get_config_settings()
            .await?
            .ver
            .ok_or_else(|| anyhow!("Device did not report a firmware version"))
    }

    pub async fn get_version_major(&self) -> anyhow::Result<u32> {
        self.get_config_settings()
            .await?
            .version_major()
            .ok_or_else(|| anyhow!("Device did not report a firmware version"))
    }

    /// The stored pixel map, or `None` if the device has none.
    pub async fn get_map_data(&self) -> anyhow::Result<Option<PixelMap>> {
        match self.get_file("/pixelmap.dat").await? {
            Some(data) => Ok(Some(
                decode_pixel_map(&data).context("Failed to decode pixel map")?,
            )),
            None => Ok(None),
        }
    }

    /// Uploads encoded map data and optionally saves it to flash.
    pub async fn set_map_data(&self, data: Bytes, save: bool) -> anyhow::Result<()> {
        self.send_binary(MessageType::PutPixelMap, data).await?;
        if save {
            self.send_command(&Command::SavePixelMap).await?;
        }
        Ok(())
    }

    /// Rescales arbitrary coordinates into the unit cube and uploads them in
    /// the format the firmware expects.
    pub async fn set_map_coordinates(&self, coordinates: &[Vec<f64>], save: bool) -> anyhow::Result<()> {
        let format = match self.get_version_major().await? {
            major if major >= 3 => MapFormat::Bits16,
            _ => MapFormat::Bits8,
        };
        let normalized = normalize_coordinates(coordinates)?;
        let data = encode_pixel_map(&normalized, format)?;
        self.set_map_data(data, save).await
    }

    pub async fn pause_renderer(&self, pause: bool) -> anyhow::Result<()> {
        self.request(&Command::Pause(pause)).await?;
        Ok(())
    }

    /// Runs `byte_code` without saving it as a pattern.
    pub async fn send_pattern_to_renderer(
        &self,
        byte_code: Bytes,
        controls: Map<String, Value>,
    ) -> anyhow::Result<()> {
        let command = Command::SetCode {
            size: byte_code.len(),
            crc: crc32fast::hash(&byte_code),
            id: make_pattern_id(),
        };
        self.request(&command).await?;
        self.send_binary(MessageType::PutByteCode, byte_code)
            .await?;
        // The renderer needs a moment to load the new code.
        sleep(Duration::from_millis(250)).await;
        self.send_command(&Command::SetControls {
            controls,
            save: false,
        })
        .await?;
        self.pause_renderer(false).await
    }

    /// Stores a compiled pattern. `source_code` is already compressed.
    pub async fn save_pattern(
        &self,
        preview_image: Bytes,
        source_code: Bytes,
        byte_code: Bytes,
    ) -> anyhow::Result<()> {
        self.send_binary(MessageType::PreviewImage, preview_image)
            .await?;
        self.send_binary(MessageType::PutSourceCode, source_code)
            .await?;
        self.send_binary(MessageType::PutByteCode, byte_code)
            .await?;
        lock(&self.patterns).invalidate();
        Ok(())
    }
}
