#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use decksync::api::{self, AppState, RouterConfig};
use decksync::protocol::FieldMap;
use decksync::shutdown::ShutdownCoordinator;
use decksync::sync::{SyncOptions, SyncState};
use tokio::net::TcpListener;

/// A session server on an ephemeral localhost port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestServer {
    pub fn sync(&self) -> &SyncState {
        &self.state.sync
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.state.shutdown
    }

    /// Endpoint as handed to reporters and producers.
    pub fn endpoint(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

/// Create a test AppState with a short long-poll timeout.
pub fn create_test_state(options: SyncOptions) -> AppState {
    let mut state = AppState::new(SyncState::new(options), ShutdownCoordinator::new());
    state.long_poll_timeout = Duration::from_millis(200);
    state
}

/// Starts a server with default options.
pub async fn start_server() -> TestServer {
    start_server_with(create_test_state(SyncOptions::default())).await
}

/// Starts an HTTP server for `state` and returns once it is accepting.
pub async fn start_server_with(state: AppState) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone(), RouterConfig::default());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer { addr, state }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A field map with one deck loaded with `path`.
pub fn deck_state(path: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(
        "deck0content".into(),
        serde_json::json!({ "filePath": path, "title": "Test Track" }),
    );
    fields
}
