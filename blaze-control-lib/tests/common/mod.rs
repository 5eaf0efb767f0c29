//! An in-process fake device speaking the websocket protocol.

#![allow(dead_code)]

pub mod http;

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use blaze_control_lib::codec::frame::encode_binary_frame;
use blaze_control_lib::codec::MessageType;
use blaze_control_lib::transport::ConnectionOptions;

pub type DeviceSocket = WebSocketStream<TcpStream>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn options(port: u16) -> ConnectionOptions {
    ConnectionOptions::default()
        .with_port(port)
        .with_connect_timeout(Duration::from_secs(2))
        .with_response_timeout(Duration::from_millis(400))
}

/// Accepts one connection and runs `script` on it.
pub async fn fake_device<F, Fut>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(DeviceSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let socket = accept_async(stream).await.unwrap();
        script(socket).await;
    });
    (port, task)
}

/// Accepts `sessions` connections one after another, running `script`
/// with the session index on each.
pub async fn fake_device_sessions<F, Fut>(sessions: usize, script: F) -> (u16, JoinHandle<()>)
where
    F: Fn(DeviceSocket, usize) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        for session in 0..sessions {
            let (stream, _) = listener.accept().await.unwrap();
            let socket = accept_async(stream).await.unwrap();
            script(socket, session).await;
        }
    });
    (port, task)
}

/// Next text message from the client, parsed. `None` once the client is gone.
pub async fn next_json(socket: &mut DeviceSocket) -> Option<Value> {
    while let Some(Ok(message)) = socket.next().await {
        match message {
            Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// Next binary frame from the client, still framed.
pub async fn next_binary(socket: &mut DeviceSocket) -> Option<Vec<u8>> {
    while let Some(Ok(message)) = socket.next().await {
        match message {
            Message::Binary(data) => return Some(data),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

pub async fn send_json(socket: &mut DeviceSocket, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn send_text(socket: &mut DeviceSocket, text: &str) {
    socket.send(Message::Text(text.to_string())).await.unwrap();
}

pub async fn send_frame(socket: &mut DeviceSocket, frame: Vec<u8>) {
    socket.send(Message::Binary(frame)).await.unwrap();
}

/// Sends `payload` as a framed binary message, split at `max_frame_size`.
pub async fn send_message(
    socket: &mut DeviceSocket,
    message_type: MessageType,
    payload: &[u8],
    max_frame_size: usize,
) {
    for frame in encode_binary_frame(message_type, payload, max_frame_size) {
        send_frame(socket, frame.to_vec()).await;
    }
}

/// Drains the connection until the client closes it.
pub async fn drain(mut socket: DeviceSocket) {
    while let Some(Ok(_)) = socket.next().await {}
}
