//! Request/response calls over the device websocket.
//!
//! The device speaks a full-duplex protocol: replies to our commands are
//! interleaved with messages it pushes on its own (statistics once a
//! second, sequencer changes, preview frames after every render). A
//! [`MessageTransport`] owns one connection and runs a background task
//! that reads every frame, reassembles fragmented binary messages and
//! classifies the result:
//!
//! - pushes are cached per [`PushKind`] and fanned out to observers;
//! - a message is handed to the caller only while a call is pending and
//!   the call's [`ResponseMatcher`] accepts it;
//! - everything else is dropped.
//!
//! Every wait gets its own reply slot. The slot takes exactly one message
//! and is gone once the wait resolves, so a second match that arrives late
//! is dropped instead of answering the next call.
//!
//! Only one call may wait for a response at a time. A second concurrent
//! call fails immediately with [`TransportError::TransportBusy`].

pub mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::frame::{decode_binary_frame, decode_headerless_frame, encode_binary_frame};
use crate::codec::{CodecError, FragmentAssembler, MessageType};

pub use connection::{ConnectionManager, ConnectionOptions};

pub(crate) type DeviceStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("connection lost")]
    ConnectionLost,

    #[error("no matching response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("another request is already waiting for a response on this connection")]
    TransportBusy,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Messages the device sends without being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PushKind {
    /// `{"fps": ..}`, about once a second.
    Statistics,
    /// `{"activeProgram": ..}`, after pattern changes and as part of getConfig.
    SequencerState,
    /// Binary type 5, after every render while preview frames are enabled.
    PreviewFrame,
    /// Binary type 9, part of the getConfig reply.
    ExpanderConfig,
}

/// A complete message read from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Json(Value),
    Binary {
        message_type: MessageType,
        payload: Bytes,
    },
}

impl InboundMessage {
    /// Push classification, `None` for ordinary responses.
    pub fn push_kind(&self) -> Option<PushKind> {
        match self {
            InboundMessage::Json(value) => {
                let object = value.as_object()?;
                if object.contains_key("fps") {
                    Some(PushKind::Statistics)
                } else if object.contains_key("activeProgram") {
                    Some(PushKind::SequencerState)
                } else {
                    None
                }
            }
            InboundMessage::Binary { message_type, .. } => match message_type {
                MessageType::PreviewFrame => Some(PushKind::PreviewFrame),
                MessageType::ExpanderConfig => Some(PushKind::ExpanderConfig),
                _ => None,
            },
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            InboundMessage::Json(value) => Some(value),
            InboundMessage::Binary { .. } => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            InboundMessage::Json(value) => Some(value),
            InboundMessage::Binary { .. } => None,
        }
    }

    pub fn into_binary(self) -> Option<(MessageType, Bytes)> {
        match self {
            InboundMessage::Binary {
                message_type,
                payload,
            } => Some((message_type, payload)),
            InboundMessage::Json(_) => None,
        }
    }

    fn summary(&self) -> String {
        match self {
            InboundMessage::Json(value) => {
                let keys: Vec<&str> = value
                    .as_object()
                    .map(|object| object.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                format!("json {:?}", keys)
            }
            InboundMessage::Binary {
                message_type,
                payload,
            } => format!("{:?} ({} bytes)", message_type, payload.len()),
        }
    }
}

/// A push as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub kind: PushKind,
    pub message: InboundMessage,
    pub received_at: DateTime<Utc>,
}

/// What a pending call is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatcher {
    /// A non-push JSON object containing this top-level key.
    JsonKey(String),
    /// Any non-push JSON object.
    AnyJson,
    /// A reassembled binary message of this type.
    Binary(MessageType),
    /// A push of this kind.
    Push(PushKind),
}

impl ResponseMatcher {
    pub fn json_key(key: &str) -> Self {
        ResponseMatcher::JsonKey(key.to_string())
    }

    pub fn matches(&self, message: &InboundMessage) -> bool {
        match (self, message.push_kind()) {
            (ResponseMatcher::Push(wanted), Some(kind)) => *wanted == kind,
            (ResponseMatcher::Push(_), None) | (_, Some(_)) => false,
            (ResponseMatcher::JsonKey(key), None) => message
                .as_json()
                .and_then(Value::as_object)
                .is_some_and(|object| object.contains_key(key)),
            (ResponseMatcher::AnyJson, None) => {
                message.as_json().is_some_and(Value::is_object)
            }
            (ResponseMatcher::Binary(wanted), None) => matches!(
                message,
                InboundMessage::Binary { message_type, .. } if message_type == wanted
            ),
        }
    }
}

/// A request to write to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Json(Value),
    Binary {
        message_type: MessageType,
        payload: Bytes,
    },
}

impl Outbound {
    pub fn binary(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Outbound::Binary {
            message_type,
            payload: payload.into(),
        }
    }

    fn into_frames(self) -> Result<Vec<Message>, TransportError> {
        match self {
            Outbound::Json(value) => Ok(vec![Message::Text(serde_json::to_string(&value)?)]),
            Outbound::Binary {
                message_type,
                payload,
            } => Ok(
                encode_binary_frame(message_type, &payload, message_type.max_frame_size())
                    .into_iter()
                    .map(|frame| Message::Binary(frame.to_vec()))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Outbound::Json(value)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A wait in progress: what it accepts and where the match goes.
struct PendingRequest {
    matcher: ResponseMatcher,
    slot: oneshot::Sender<InboundMessage>,
}

/// State shared between callers and the receive task.
struct Shared {
    pending: StdMutex<Option<PendingRequest>>,
    latest: StdMutex<HashMap<PushKind, PushMessage>>,
    preview_frames: AtomicBool,
    closed: AtomicBool,
    observers: broadcast::Sender<PushMessage>,
}

impl Shared {
    fn decode_binary(&self, assembler: &mut FragmentAssembler, data: &[u8]) -> Option<InboundMessage> {
        if data.first() == Some(&(MessageType::PreviewFrame as u8)) {
            if !self.preview_frames.load(Ordering::Relaxed) {
                trace!("preview frames disabled, dropping {} bytes", data.len());
                return None;
            }
            return match decode_headerless_frame(data, MessageType::PreviewFrame) {
                Ok(frame) => Some(InboundMessage::Binary {
                    message_type: frame.message_type,
                    payload: frame.payload,
                }),
                Err(err) => {
                    warn!("dropping preview frame: {}", err);
                    None
                }
            };
        }

        let frame = match decode_binary_frame(data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    "dropping binary frame {}: {}",
                    hex::encode(&data[..data.len().min(16)]),
                    err
                );
                return None;
            }
        };

        match assembler.push(frame) {
            Ok(Some((message_type, payload))) => Some(InboundMessage::Binary {
                message_type,
                payload,
            }),
            Ok(None) => None,
            Err(err) => {
                warn!("dropping binary fragment: {}", err);
                None
            }
        }
    }

    fn dispatch(&self, message: InboundMessage) {
        let kind = message.push_kind();
        if let Some(kind) = kind {
            let push = PushMessage {
                kind,
                message: message.clone(),
                received_at: Utc::now(),
            };
            lock(&self.latest).insert(kind, push.clone());
            if self.observers.send(push).is_err() {
                trace!("no observers for {:?}", kind);
            }
        }

        let mut pending = lock(&self.pending);
        let wanted = pending
            .as_ref()
            .is_some_and(|request| request.matcher.matches(&message));
        let request = if wanted { pending.take() } else { None };
        match request {
            Some(request) => {
                if request.slot.send(message).is_err() {
                    debug!("caller went away before its response arrived");
                }
            }
            None if kind.is_none() => debug!("dropping unsolicited {}", message.summary()),
            None => {}
        }
    }
}

async fn receive_loop(mut stream: SplitStream<DeviceStream>, shared: Arc<Shared>) {
    let mut assembler = FragmentAssembler::new();

    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket read failed: {}", err);
                break;
            }
        };

        let inbound = match message {
            Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => InboundMessage::Json(value),
                Err(err) => {
                    warn!("dropping unparsable text message: {}", err);
                    continue;
                }
            },
            Message::Binary(data) => match shared.decode_binary(&mut assembler, &data) {
                Some(inbound) => inbound,
                None => continue,
            },
            Message::Close(frame) => {
                debug!("device closed the connection: {:?}", frame);
                break;
            }
            _ => continue,
        };

        shared.dispatch(inbound);
    }

    shared.closed.store(true, Ordering::SeqCst);
    // Dropping the slot resolves a waiting call with ConnectionLost.
    lock(&shared.pending).take();
    debug!("receive task stopped");
}

/// Clears the pending request, and with it the reply slot, when the wait
/// finishes or is cancelled.
struct PendingGuard<'a> {
    shared: &'a Shared,
    reply: oneshot::Receiver<InboundMessage>,
}

impl<'a> PendingGuard<'a> {
    fn set(shared: &'a Shared, matcher: ResponseMatcher) -> Self {
        let (slot, reply) = oneshot::channel();
        *lock(&shared.pending) = Some(PendingRequest { matcher, slot });
        PendingGuard { shared, reply }
    }

    async fn wait(mut self, timeout: Duration) -> Result<InboundMessage, TransportError> {
        // Set after the receive task stopped: nothing will ever fill the slot.
        if self.shared.closed.load(Ordering::SeqCst) && lock(&self.shared.pending).is_some() {
            return Err(TransportError::ConnectionLost);
        }
        match tokio::time::timeout(timeout, &mut self.reply).await {
            Err(_) => Err(TransportError::ResponseTimeout(timeout)),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Ok(Ok(message)) => Ok(message),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.shared.pending) = None;
    }
}

/// One open websocket to one device.
pub struct MessageTransport {
    url: String,
    writer: Mutex<SplitSink<DeviceStream, Message>>,
    call: Mutex<()>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl MessageTransport {
    /// Takes over an established websocket and starts its receive task.
    pub(crate) fn new(
        url: &str,
        stream: DeviceStream,
        observers: broadcast::Sender<PushMessage>,
    ) -> Self {
        let (writer, reader) = stream.split();
        let shared = Arc::new(Shared {
            pending: StdMutex::new(None),
            latest: StdMutex::new(HashMap::new()),
            preview_frames: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            observers,
        });
        let reader = tokio::spawn(receive_loop(reader, shared.clone()));

        MessageTransport {
            url: url.to_string(),
            writer: Mutex::new(writer),
            call: Mutex::new(()),
            shared,
            reader,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    /// Sends `request` and waits for a message accepted by `matcher`.
    ///
    /// Multi-frame binary requests wait for a match after every frame and
    /// return the last one.
    pub async fn send_and_wait(
        &self,
        request: impl Into<Outbound>,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<InboundMessage, TransportError> {
        self.exchange(Some(request.into()), matcher, timeout, false)
            .await
    }

    /// Like [`send_and_wait`](Self::send_and_wait), but first discards
    /// the cached pushes so only ones sent after the request count.
    pub async fn send_fresh_and_wait(
        &self,
        request: impl Into<Outbound>,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<InboundMessage, TransportError> {
        self.exchange(Some(request.into()), matcher, timeout, true)
            .await
    }

    /// Waits for a matching message without sending anything.
    pub async fn wait_for(
        &self,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<InboundMessage, TransportError> {
        self.exchange(None, matcher, timeout, false).await
    }

    /// Returns the cached push of `kind`, or waits for the next one.
    pub async fn wait_for_push(
        &self,
        kind: PushKind,
        timeout: Duration,
    ) -> Result<InboundMessage, TransportError> {
        let _call = self
            .call
            .try_lock()
            .map_err(|_| TransportError::TransportBusy)?;
        // Armed before the cache lookup so a push landing in between is not
        // missed. On a cache hit the armed slot is dropped unread.
        let pending = PendingGuard::set(&self.shared, ResponseMatcher::Push(kind));

        if let Some(push) = self.latest_push(kind) {
            return Ok(push.message);
        }
        pending.wait(timeout).await
    }

    /// Writes `request` without waiting for anything.
    pub async fn send_only(&self, request: impl Into<Outbound>) -> Result<(), TransportError> {
        for frame in request.into().into_frames()? {
            self.write(frame).await?;
        }
        Ok(())
    }

    pub fn latest_push(&self, kind: PushKind) -> Option<PushMessage> {
        lock(&self.shared.latest).get(&kind).cloned()
    }

    /// Whether type-5 frames are decoded or dropped on arrival.
    pub fn set_preview_frames(&self, enabled: bool) {
        self.shared.preview_frames.store(enabled, Ordering::Relaxed);
    }

    /// Sends a close frame and stops the receive task.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Err(err) = self.writer.lock().await.close().await {
            debug!("closing {}: {}", self.url, err);
        }
        self.reader.abort();
    }

    async fn exchange(
        &self,
        request: Option<Outbound>,
        matcher: ResponseMatcher,
        timeout: Duration,
        fresh: bool,
    ) -> Result<InboundMessage, TransportError> {
        let _call = self
            .call
            .try_lock()
            .map_err(|_| TransportError::TransportBusy)?;

        if fresh {
            lock(&self.shared.latest).clear();
        }

        let frames = match request {
            Some(request) => request.into_frames()?,
            None => Vec::new(),
        };

        let mut response = None;
        for frame in frames {
            // A fresh slot per frame: each frame is acknowledged on its own.
            let pending = PendingGuard::set(&self.shared, matcher.clone());
            self.write(frame).await?;
            response = Some(pending.wait(timeout).await?);
        }
        match response {
            Some(response) => Ok(response),
            None => PendingGuard::set(&self.shared, matcher).wait(timeout).await,
        }
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost);
        }
        let mut writer = self.writer.lock().await;
        writer.send(message).await.map_err(|err| {
            warn!("websocket write to {} failed: {}", self.url, err);
            self.shared.closed.store(true, Ordering::SeqCst);
            TransportError::ConnectionLost
        })
    }
}

impl Drop for MessageTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binary(message_type: MessageType) -> InboundMessage {
        InboundMessage::Binary {
            message_type,
            payload: Bytes::from_static(&[1, 2, 3]),
        }
    }

    #[test]
    fn test_push_classification() {
        assert_eq!(
            InboundMessage::Json(json!({"fps": 60.1, "vmerr": 0})).push_kind(),
            Some(PushKind::Statistics)
        );
        assert_eq!(
            InboundMessage::Json(json!({"activeProgram": {"activeProgramId": "x"}})).push_kind(),
            Some(PushKind::SequencerState)
        );
        assert_eq!(
            binary(MessageType::PreviewFrame).push_kind(),
            Some(PushKind::PreviewFrame)
        );
        assert_eq!(
            binary(MessageType::ExpanderConfig).push_kind(),
            Some(PushKind::ExpanderConfig)
        );
        assert_eq!(InboundMessage::Json(json!({"ack": 1})).push_kind(), None);
        assert_eq!(InboundMessage::Json(json!([1, 2])).push_kind(), None);
    }

    #[test]
    fn test_pushes_never_satisfy_response_matchers() {
        let stats = InboundMessage::Json(json!({"fps": 30.0, "patternList": []}));
        assert!(!ResponseMatcher::json_key("patternList").matches(&stats));
        assert!(!ResponseMatcher::AnyJson.matches(&stats));
        assert!(ResponseMatcher::Push(PushKind::Statistics).matches(&stats));
        assert!(!ResponseMatcher::Push(PushKind::SequencerState).matches(&stats));
    }

    #[test]
    fn test_response_matchers() {
        let list = InboundMessage::Json(json!({"patternList": []}));
        assert!(ResponseMatcher::json_key("patternList").matches(&list));
        assert!(!ResponseMatcher::json_key("ack").matches(&list));
        assert!(ResponseMatcher::AnyJson.matches(&list));

        let programs = binary(MessageType::GetProgramList);
        assert!(ResponseMatcher::Binary(MessageType::GetProgramList).matches(&programs));
        assert!(!ResponseMatcher::Binary(MessageType::GetSourceCode).matches(&programs));
        assert!(!ResponseMatcher::AnyJson.matches(&programs));
    }

    #[test]
    fn test_outbound_binary_is_split_per_type() {
        let frames = Outbound::binary(MessageType::PutByteCode, vec![0u8; 1281])
            .into_frames()
            .unwrap();
        assert_eq!(frames.len(), 2);

        let frames = Outbound::binary(MessageType::PutPixelMap, vec![0u8; 1281])
            .into_frames()
            .unwrap();
        assert_eq!(frames.len(), 1);
    }
}
