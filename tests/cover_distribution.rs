//! Cover distribution over the live server: WebSocket subscriptions,
//! long-polls, uploads and the display event stream.

mod common;

use std::time::Duration;

use decksync::protocol::{FieldMap, MirrorEvent};
use futures::StreamExt;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WsRx = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

async fn next_text(rx: &mut WsRx) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("valid message");
        match msg {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text, got {other:?}"),
        }
    }
}

fn decks(paths: &[&str]) -> FieldMap {
    let mut fields = FieldMap::new();
    for (i, path) in paths.iter().enumerate() {
        fields.insert(format!("deck{i}content"), json!({ "filePath": path }));
    }
    fields
}

#[tokio::test(flavor = "multi_thread")]
async fn late_ws_subscriber_catches_up_first() {
    let server = common::start_server().await;
    let sid = server.sync().current_id();
    server.sync().init(&sid, decks(&["/a", "/b", "/c"]), None);

    let (ws, _) = connect_async(server.ws_url("/cover/ws")).await.unwrap();
    let (_tx, mut rx) = ws.split();

    let mut caught_up = vec![next_text(&mut rx).await, next_text(&mut rx).await, next_text(&mut rx).await];
    caught_up.sort();
    assert_eq!(caught_up, vec!["/a", "/b", "/c"]);

    server
        .sync()
        .update(&sid, "deck3content", json!({ "filePath": "/d" }));
    assert_eq!(next_text(&mut rx).await, "/d");
}

#[tokio::test(flavor = "multi_thread")]
async fn every_subscriber_gets_every_key() {
    let server = common::start_server().await;
    let (ws1, _) = connect_async(server.ws_url("/cover/ws")).await.unwrap();
    let (ws2, _) = connect_async(server.ws_url("/cover/ws")).await.unwrap();
    let (_tx1, mut rx1) = ws1.split();
    let (_tx2, mut rx2) = ws2.split();
    assert!(common::wait_until(Duration::from_secs(2), || server.sync().subscriber_count() == 2).await);

    let sid = server.sync().current_id();
    server.sync().init(&sid, common::deck_state("/a.mp3"), None);

    assert_eq!(next_text(&mut rx1).await, "/a.mp3");
    assert_eq!(next_text(&mut rx2).await, "/a.mp3");
}

#[tokio::test(flavor = "multi_thread")]
async fn ws_subscriber_removed_on_disconnect() {
    let server = common::start_server().await;
    let (ws, _) = connect_async(server.ws_url("/cover/ws")).await.unwrap();
    assert!(common::wait_until(Duration::from_secs(2), || server.sync().subscriber_count() == 1).await);

    drop(ws);
    assert!(common::wait_until(Duration::from_secs(2), || server.sync().subscriber_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn long_poll_released_by_new_need() {
    let mut state = common::create_test_state(Default::default());
    state.long_poll_timeout = Duration::from_secs(10);
    let slow = common::start_server_with(state).await;

    let url = slow.url("/cover");
    let poll = tokio::spawn(async move { reqwest::get(url).await.unwrap().text().await.unwrap() });
    assert!(common::wait_until(Duration::from_secs(2), || slow.sync().subscriber_count() == 1).await);

    let sid = slow.sync().current_id();
    slow.sync().init(&sid, common::deck_state("/a.mp3"), None);

    let key = timeout(Duration::from_secs(2), poll).await.unwrap().unwrap();
    assert_eq!(key, "/a.mp3");
}

#[tokio::test(flavor = "multi_thread")]
async fn long_poll_times_out_empty() {
    let server = common::start_server().await;
    let body = reqwest::get(server.url("/cover")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "");
}

#[tokio::test(flavor = "multi_thread")]
async fn uploaded_cover_is_served_to_displays() {
    let server = common::start_server().await;
    let sid = server.sync().current_id();
    server.sync().init(&sid, common::deck_state("/a b.mp3"), None);

    let client = reqwest::Client::new();
    let png = b"\x89PNG\r\n\x1a\nrest".to_vec();
    let resp = client
        .post(server.url("/cover"))
        .query(&[("path", "/a b.mp3")])
        .body(png.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    let resp = client
        .get(server.url("/cover/image"))
        .query(&[("path", "/a b.mp3")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
    assert_eq!(resp.bytes().await.unwrap().to_vec(), png);
}

#[tokio::test(flavor = "multi_thread")]
async fn display_stream_starts_with_sync() {
    let server = common::start_server().await;
    let sid = server.sync().current_id();
    server.sync().init(&sid, common::deck_state("/a.mp3"), None);

    let (ws, _) = connect_async(server.ws_url("/ws/events")).await.unwrap();
    let (_tx, mut rx) = ws.split();

    let first: MirrorEvent = serde_json::from_str(&next_text(&mut rx).await).unwrap();
    match first {
        MirrorEvent::Sync { snapshot } => {
            assert_eq!(snapshot.session_id, sid);
            assert!(snapshot.initialized);
            assert_eq!(snapshot.needed, vec!["/a.mp3"]);
        }
        other => panic!("expected sync, got {other:?}"),
    }

    server.sync().update(&sid, "mixer", json!({ "xFader": 0.25 }));
    let next: MirrorEvent = serde_json::from_str(&next_text(&mut rx).await).unwrap();
    assert_eq!(
        next,
        MirrorEvent::Updated {
            field: "mixer".into(),
            value: json!({ "xFader": 0.25 })
        }
    );

    let s2 = server.sync().reset(None);
    let next: MirrorEvent = serde_json::from_str(&next_text(&mut rx).await).unwrap();
    assert_eq!(next, MirrorEvent::Reset { session_id: s2 });
}

#[tokio::test(flavor = "multi_thread")]
async fn websockets_receive_close_frame_on_shutdown() {
    let server = common::start_server().await;
    let (events, _) = connect_async(server.ws_url("/ws/events")).await.unwrap();
    let (covers, _) = connect_async(server.ws_url("/cover/ws")).await.unwrap();
    let (_etx, mut erx) = events.split();
    let (_ctx, mut crx) = covers.split();

    // Consume the initial sync.
    next_text(&mut erx).await;
    assert!(common::wait_until(Duration::from_secs(2), || server.shutdown().active_count() == 2).await);

    server.shutdown().shutdown();

    for rx in [&mut erx, &mut crx] {
        let msg = timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("close in time")
            .expect("stream open")
            .expect("valid message");
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(
                    frame.code,
                    tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal
                );
                assert_eq!(frame.reason.as_str(), "server shutting down");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
