//! An in-process fake of the device's HTTP file API.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct DeviceFiles {
    pub files: BTreeMap<String, Vec<u8>>,
    /// Requests in arrival order, e.g. `delete /p/abc`.
    pub requests: Vec<String>,
    /// Older firmware answers `/list` with 404.
    pub list_supported: bool,
}

impl DeviceFiles {
    pub fn with_files(files: &[(&str, &[u8])]) -> Self {
        DeviceFiles {
            files: files
                .iter()
                .map(|(name, contents)| (name.to_string(), contents.to_vec()))
                .collect(),
            requests: Vec::new(),
            list_supported: true,
        }
    }
}

pub type SharedFiles = Arc<Mutex<DeviceFiles>>;

/// Serves `files` on a random local port.
pub async fn fake_file_server(files: DeviceFiles) -> (u16, SharedFiles, JoinHandle<()>) {
    let state = Arc::new(Mutex::new(files));
    let app = Router::new()
        .route("/list", get(list))
        .route("/edit", post(edit))
        .route("/delete", get(delete))
        .route("/reboot", post(reboot))
        .fallback(get_file)
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, state, server)
}

async fn list(State(state): State<SharedFiles>) -> Response {
    let mut device = state.lock().unwrap();
    device.requests.push("list".to_string());
    if !device.list_supported {
        return StatusCode::NOT_FOUND.into_response();
    }
    device
        .files
        .iter()
        .map(|(name, contents)| format!("{}\t{}\n", name, contents.len()))
        .collect::<String>()
        .into_response()
}

async fn edit(State(state): State<SharedFiles>, mut multipart: Multipart) -> StatusCode {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("data") {
            return StatusCode::BAD_REQUEST;
        }
        let Some(name) = field.file_name().map(str::to_string) else {
            return StatusCode::BAD_REQUEST;
        };
        let Ok(contents) = field.bytes().await else {
            return StatusCode::BAD_REQUEST;
        };
        let mut device = state.lock().unwrap();
        device.requests.push(format!("put {}", name));
        device.files.insert(name, contents.to_vec());
    }
    StatusCode::OK
}

async fn delete(
    State(state): State<SharedFiles>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    let Some(path) = query.get("path") else {
        return StatusCode::BAD_REQUEST;
    };
    let mut device = state.lock().unwrap();
    device.requests.push(format!("delete {}", path));
    if device.files.remove(path).is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn reboot(State(state): State<SharedFiles>) -> StatusCode {
    state.lock().unwrap().requests.push("reboot".to_string());
    StatusCode::OK
}

async fn get_file(State(state): State<SharedFiles>, uri: Uri) -> Response {
    let mut device = state.lock().unwrap();
    let path = uri.path().to_string();
    device.requests.push(format!("get {}", path));
    match device.files.get(&path) {
        Some(contents) => contents.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
