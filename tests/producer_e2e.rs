//! The cover producer against a live server, with an in-memory cover source.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use decksync::producer::{CoverSource, Producer};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Serves covers from a map.
#[derive(Default)]
struct MemorySource {
    covers: HashMap<String, Bytes>,
}

impl MemorySource {
    fn with(covers: &[(&str, &'static [u8])]) -> Self {
        Self {
            covers: covers
                .iter()
                .map(|(k, v)| (k.to_string(), Bytes::from_static(v)))
                .collect(),
        }
    }
}

impl CoverSource for MemorySource {
    async fn load(&self, path: &str) -> Option<Bytes> {
        self.covers.get(path).cloned()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn producer_uploads_needed_covers() {
    let server = common::start_server().await;
    let source = MemorySource::with(&[("/a.mp3", &b"cover-a"[..]), ("/b.mp3", &b"cover-b"[..])]);
    let producer = Producer::new(&server.endpoint(), source).unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(cancel).await })
    };
    assert!(common::wait_until(Duration::from_secs(2), || server.sync().subscriber_count() == 1).await);

    let sid = server.sync().current_id();
    server.sync().init(&sid, common::deck_state("/a.mp3"), None);
    server
        .sync()
        .update(&sid, "deck1content", json!({ "filePath": "/b.mp3" }));

    assert!(
        common::wait_until(Duration::from_secs(5), || server.sync().snapshot().loaded.len() == 2).await,
        "both covers should be loaded"
    );
    assert!(server.sync().snapshot().needed.is_empty());
    assert_eq!(server.sync().cover("/a.mp3"), Some(Bytes::from_static(b"cover-a")));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_cover_stays_needed() {
    let server = common::start_server().await;
    let producer = Producer::new(&server.endpoint(), MemorySource::default()).unwrap();

    let sid = server.sync().current_id();
    server.sync().init(&sid, common::deck_state("/nothing.mp3"), None);

    let produced = producer.produce("/nothing.mp3").await.unwrap();
    assert!(!produced);
    assert_eq!(server.sync().snapshot().needed, vec!["/nothing.mp3"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_for_stale_key_is_harmless() {
    let server = common::start_server().await;
    let source = MemorySource::with(&[("/gone.mp3", &b"cover"[..])]);
    let producer = Producer::new(&server.endpoint(), source).unwrap();

    // Not required by anything: the server answers 200 and discards it.
    assert!(producer.produce("/gone.mp3").await.unwrap());
    assert!(server.sync().snapshot().loaded.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn producer_retries_until_server_appears() {
    // Reserve a port, then free it so the first attempts fail.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = MemorySource::with(&[("/a.mp3", &b"cover-a"[..])]);
    let producer = Producer::new(&format!("http://{addr}/"), source)
        .unwrap()
        .with_retry_delay(Duration::from_millis(100));

    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(250)).await;

    let state = common::create_test_state(Default::default());
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let app = decksync::api::router(state.clone(), Default::default());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let sid = state.sync.current_id();
    state.sync.init(&sid, common::deck_state("/a.mp3"), None);

    assert!(
        common::wait_until(Duration::from_secs(5), || state.sync.snapshot().loaded == vec!["/a.mp3"]).await,
        "producer should reconnect and upload"
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}
