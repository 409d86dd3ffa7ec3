//! Cover producer: subscribes to the session server's needed covers, loads
//! the embedded picture of each announced track, and uploads it.
//!
//! The connection loop never gives up. When the server is unreachable or
//! the subscription closes, it waits a fixed delay and tries again until
//! cancelled.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use reqwest::{StatusCode, Url};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision};
use symphonia::core::probe::Hint;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::protocol::{parse_endpoint, EndpointError};

/// Delay between connection attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    InvalidEndpoint(#[from] EndpointError),
    #[error("subscription failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("upload failed: {0}")]
    Upload(#[from] reqwest::Error),
    #[error("upload rejected with {0}")]
    UploadRejected(StatusCode),
}

/// Something that can produce cover bytes for an asset key.
pub trait CoverSource: Send + Sync + 'static {
    /// Cover data for `path`, or `None` when there is nothing to upload.
    fn load(&self, path: &str) -> impl Future<Output = Option<Bytes>> + Send;
}

/// Maps a path reported by the controller to a local path by running an
/// external command with the path as its only argument.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    command: String,
}

impl PathTranslator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Run the translator. Its stdout, minus the trailing newline, is the
    /// local path.
    pub async fn translate(&self, path: &str) -> Option<PathBuf> {
        let output = match tokio::process::Command::new(&self.command)
            .arg(path)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(command = %self.command, error = %e, "path translator failed to run");
                return None;
            }
        };
        if !output.status.success() {
            tracing::warn!(command = %self.command, status = %output.status, path, "path translator failed");
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let translated = stdout.trim_end_matches(['\r', '\n']);
        if translated.is_empty() {
            tracing::warn!(path, "path translator printed nothing");
            return None;
        }
        Some(PathBuf::from(translated))
    }
}

/// Reads covers from audio files on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FileCoverSource {
    translator: Option<PathTranslator>,
}

impl FileCoverSource {
    pub fn new(translator: Option<PathTranslator>) -> Self {
        Self { translator }
    }
}

impl CoverSource for FileCoverSource {
    async fn load(&self, path: &str) -> Option<Bytes> {
        let local = match &self.translator {
            Some(translator) => translator.translate(path).await?,
            None => PathBuf::from(path),
        };

        if !tokio::fs::try_exists(&local).await.unwrap_or(false) {
            tracing::warn!(path, local = %local.display(), "translated file does not exist");
            return None;
        }

        let file = local.clone();
        match tokio::task::spawn_blocking(move || extract_largest_picture(&file)).await {
            Ok(Ok(Some(picture))) => Some(picture),
            Ok(Ok(None)) => {
                tracing::warn!(path, "file has no picture");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(path, local = %local.display(), error = %e, "failed to read tags");
                None
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "picture extraction panicked");
                None
            }
        }
    }
}

fn keep_largest(best: &mut Option<Bytes>, revision: &MetadataRevision) {
    for visual in revision.visuals() {
        let len = visual.data.len();
        if len > 0 && best.as_ref().map_or(true, |b| len > b.len()) {
            *best = Some(Bytes::copy_from_slice(&visual.data));
        }
    }
}

/// The largest embedded picture in an audio file, if any.
pub fn extract_largest_picture(path: &Path) -> Result<Option<Bytes>, symphonia::core::errors::Error> {
    let src = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut best = None;
    // Tags found while probing (e.g. ID3v2 ahead of the stream).
    if let Some(metadata) = probed.metadata.get() {
        if let Some(revision) = metadata.current() {
            keep_largest(&mut best, revision);
        }
    }
    // Tags carried by the container itself (FLAC, MP4, Ogg).
    let mut format = probed.format;
    if let Some(revision) = format.metadata().current() {
        keep_largest(&mut best, revision);
    }
    Ok(best)
}

pub struct Producer<S> {
    client: reqwest::Client,
    endpoint: Url,
    source: Arc<S>,
    retry_delay: Duration,
}

impl<S> Clone for Producer<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            source: self.source.clone(),
            retry_delay: self.retry_delay,
        }
    }
}

impl<S: CoverSource> Producer<S> {
    pub fn new(endpoint: &str, source: S) -> Result<Self, ProducerError> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: parse_endpoint(endpoint)?,
            source: Arc::new(source),
            retry_delay: RETRY_DELAY,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// WebSocket URL of the cover subscription.
    pub fn subscribe_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(&format!("{}cover/ws", self.endpoint.path()));
        let scheme = if self.endpoint.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always a permitted scheme change.
        let _ = url.set_scheme(scheme);
        url
    }

    fn upload_url(&self, key: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(&format!("{}cover", self.endpoint.path()));
        url.query_pairs_mut().append_pair("path", key);
        url
    }

    /// Subscribe and serve covers until `cancel` fires, reconnecting after
    /// every failure.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(endpoint = %self.endpoint, "cover producer starting");
        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.run_connection(&cancel).await {
                Ok(()) if cancel.is_cancelled() => return,
                Ok(()) => tracing::warn!("subscription closed"),
                Err(e) => tracing::warn!(error = %e, "subscription failed"),
            }

            tracing::info!(delay_secs = self.retry_delay.as_secs_f32(), "retrying");
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn run_connection(&self, cancel: &CancellationToken) -> Result<(), ProducerError> {
        let url = self.subscribe_url();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::info!(url = %url, "subscribed to needed covers");

        let (mut sink, mut stream) = ws_stream.split();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(key))) => {
                            let key = key.as_str().to_owned();
                            if key.is_empty() {
                                continue;
                            }
                            let producer = self.clone();
                            tasks.spawn(async move { producer.serve(&key).await });
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "cover task failed");
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }

        // Let uploads already under way finish.
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Load and upload one cover, logging the outcome.
    async fn serve(&self, key: &str) {
        match self.produce(key).await {
            Ok(true) => {}
            Ok(false) => tracing::info!(path = key, "no cover to upload"),
            Err(e) => tracing::warn!(path = key, error = %e, "cover upload failed"),
        }
    }

    /// Load the cover for `key` and upload it. Returns `false` when the
    /// source had nothing for this key.
    pub async fn produce(&self, key: &str) -> Result<bool, ProducerError> {
        tracing::debug!(path = key, "loading cover");
        let Some(data) = self.source.load(key).await else {
            return Ok(false);
        };
        let status = self.upload(key, data).await?;
        tracing::info!(path = key, %status, "cover uploaded");
        Ok(true)
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<StatusCode, ProducerError> {
        let resp = self
            .client
            .post(self.upload_url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProducerError::UploadRejected(status));
        }
        Ok(status)
    }
}
