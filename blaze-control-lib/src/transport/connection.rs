use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::connect_async;

use crate::transport::{
    InboundMessage, MessageTransport, Outbound, PushKind, PushMessage, ResponseMatcher,
    TransportError,
};

/// Websocket port of the device.
pub const DEFAULT_PORT: u16 = 81;

const OBSERVER_CAPACITY: usize = 64;

/// Connection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub port: u16,
    pub connect_timeout: Duration,
    /// Default deadline for a single response.
    pub response_timeout: Duration,
    /// Reconnect once before the next call after the connection dropped.
    pub auto_reconnect: bool,
    /// Let [`ConnectionManager::open`] succeed even if the device is
    /// unreachable; the first call then retries the connection.
    pub ignore_open_failure: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            auto_reconnect: true,
            ignore_open_failure: false,
        }
    }
}

impl ConnectionOptions {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_ignore_open_failure(mut self, ignore: bool) -> Self {
        self.ignore_open_failure = ignore;
        self
    }
}

enum ConnectionState {
    /// Not connected yet because the initial open failed and was deferred.
    Pending,
    /// Connected, or lost if the transport reports it is no longer open.
    Open(Arc<MessageTransport>),
    /// Closed on request.
    Closed,
}

/// Owns the lifecycle of the websocket to one device.
///
/// Dropping the manager drops its transport, which stops the receive task
/// and closes the socket.
pub struct ConnectionManager {
    host: String,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    observers: broadcast::Sender<PushMessage>,
}

impl ConnectionManager {
    pub async fn open(host: &str, options: ConnectionOptions) -> Result<Self, TransportError> {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        let manager = ConnectionManager {
            host: host.to_string(),
            options,
            state: Mutex::new(ConnectionState::Pending),
            observers,
        };

        match manager.connect().await {
            Ok(transport) => *manager.state.lock().await = ConnectionState::Open(Arc::new(transport)),
            Err(err) if manager.options.ignore_open_failure => {
                warn!("{}; will retry on first use", err);
            }
            Err(err) => return Err(err),
        }
        Ok(manager)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.options.port)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub async fn is_open(&self) -> bool {
        matches!(&*self.state.lock().await, ConnectionState::Open(transport) if transport.is_open())
    }

    /// Receives every push, across reconnects.
    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.observers.subscribe()
    }

    async fn connect(&self) -> Result<MessageTransport, TransportError> {
        let url = self.url();
        debug!("connecting to {}", url);

        match tokio::time::timeout(self.options.connect_timeout, connect_async(url.as_str())).await
        {
            Ok(Ok((stream, _))) => {
                info!("connected to {}", url);
                Ok(MessageTransport::new(&url, stream, self.observers.clone()))
            }
            Ok(Err(err)) => Err(TransportError::ConnectFailed {
                url,
                reason: err.to_string(),
            }),
            Err(_) => Err(TransportError::ConnectFailed {
                url,
                reason: format!("timed out after {:?}", self.options.connect_timeout),
            }),
        }
    }

    /// Returns the live transport, reconnecting once if it was lost and
    /// the policy allows it.
    pub async fn ensure_open(&self) -> Result<Arc<MessageTransport>, TransportError> {
        let mut state = self.state.lock().await;
        match &*state {
            ConnectionState::Open(transport) if transport.is_open() => {
                return Ok(transport.clone())
            }
            ConnectionState::Closed => return Err(TransportError::NotConnected),
            ConnectionState::Open(_) if !self.options.auto_reconnect => {
                return Err(TransportError::NotConnected)
            }
            ConnectionState::Open(_) => info!("connection to {} lost, reconnecting", self.url()),
            ConnectionState::Pending => debug!("opening deferred connection to {}", self.url()),
        }

        let transport = Arc::new(self.connect().await?);
        *state = ConnectionState::Open(transport.clone());
        Ok(transport)
    }

    /// Opens the connection again after [`close`](Self::close).
    pub async fn reopen(&self) -> Result<(), TransportError> {
        self.close().await;
        let transport = self.connect().await?;
        *self.state.lock().await = ConnectionState::Open(Arc::new(transport));
        Ok(())
    }

    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, ConnectionState::Closed);
        if let ConnectionState::Open(transport) = previous {
            debug!("closing {}", transport.url());
            transport.close().await;
        }
    }

    pub async fn send_and_wait(
        &self,
        request: impl Into<Outbound>,
        matcher: ResponseMatcher,
    ) -> Result<InboundMessage, TransportError> {
        self.ensure_open()
            .await?
            .send_and_wait(request, matcher, self.options.response_timeout)
            .await
    }

    pub async fn send_fresh_and_wait(
        &self,
        request: impl Into<Outbound>,
        matcher: ResponseMatcher,
    ) -> Result<InboundMessage, TransportError> {
        self.ensure_open()
            .await?
            .send_fresh_and_wait(request, matcher, self.options.response_timeout)
            .await
    }

    pub async fn send_only(&self, request: impl Into<Outbound>) -> Result<(), TransportError> {
        self.ensure_open().await?.send_only(request).await
    }

    pub async fn wait_for(&self, matcher: ResponseMatcher) -> Result<InboundMessage, TransportError> {
        self.ensure_open()
            .await?
            .wait_for(matcher, self.options.response_timeout)
            .await
    }

    pub async fn wait_for_push(&self, kind: PushKind) -> Result<InboundMessage, TransportError> {
        self.ensure_open()
            .await?
            .wait_for_push(kind, self.options.response_timeout)
            .await
    }

    /// Latest push of `kind` on the current connection.
    pub async fn latest_push(&self, kind: PushKind) -> Option<PushMessage> {
        match &*self.state.lock().await {
            ConnectionState::Open(transport) => transport.latest_push(kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ConnectionOptions::default();
        assert_eq!(options.port, 81);
        assert!(options.auto_reconnect);
        assert!(!options.ignore_open_failure);
    }

    #[test]
    fn test_option_builders() {
        let options = ConnectionOptions::default()
            .with_port(8081)
            .with_response_timeout(Duration::from_millis(250))
            .with_auto_reconnect(false)
            .with_ignore_open_failure(true);
        assert_eq!(options.port, 8081);
        assert_eq!(options.response_timeout, Duration::from_millis(250));
        assert!(!options.auto_reconnect);
        assert!(options.ignore_open_failure);
    }

    #[tokio::test]
    async fn test_deferred_open_failure() {
        let options = ConnectionOptions::default()
            .with_port(1)
            .with_connect_timeout(Duration::from_millis(500))
            .with_ignore_open_failure(true);
        let manager = ConnectionManager::open("127.0.0.1", options).await.unwrap();
        assert!(!manager.is_open().await);
        assert!(matches!(
            manager.ensure_open().await,
            Err(TransportError::ConnectFailed { .. })
        ));
    }
}
