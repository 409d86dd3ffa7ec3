//! Server-side session state: the live session, the pre-init update buffer,
//! the state mirror, cover asset tracking and the cover distribution channel.
//!
//! All of it sits behind a single lock. Every mutation (including the
//! recompute of needed covers and the fan-out to producers) happens under
//! the write lock, so two updates never interleave and readers never see a
//! half-applied change.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::assets::AssetTracker;
use crate::distribution::{CoverChannel, SubscriberId, Subscription};
use crate::mirror::StateMirror;
use crate::pending::{Offer, PendingUpdates, MAX_QUEUE};
use crate::protocol::{ConnectResponse, FieldMap, MirrorEvent, StateSnapshot};
use crate::session::{clock_offset_ms, Session};

/// Capacity of the display event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables for [`SyncState`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Bound on updates buffered before `init`.
    pub max_queue: usize,
    /// Whether controllers should send their debug log lines.
    pub debug_logging: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_queue: MAX_QUEUE,
            debug_logging: false,
        }
    }
}

/// What happened to an `init` or `update` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The session was initialized from a snapshot.
    Initialized,
    /// The field changed on the mirror.
    Applied,
    /// The field already had this value.
    Unchanged,
    /// No mirror yet; the update was queued.
    Buffered,
    /// The queue overflowed and the session was reset.
    Reset,
    /// The request named a session that is not live.
    Stale,
}

/// Reply to `init`/`update`: the live session id plus what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub session_id: String,
    pub disposition: Disposition,
}

/// How a cover long-poll starts.
#[derive(Debug)]
pub enum CoverPoll {
    /// A needed key to answer with right away.
    Ready(String),
    /// Nothing is needed; wait on this subscription for the next need.
    Wait(Subscription),
}

/// Result of a cover upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Accepted,
    /// The key is not required by the current state; data was discarded.
    NotRequired,
}

struct SyncCore {
    session: Session,
    debug_logging: bool,
    pending: PendingUpdates,
    mirror: Option<StateMirror>,
    assets: AssetTracker,
    covers: HashMap<String, Bytes>,
    channel: CoverChannel,
    /// Last key handed to a long-poll.
    poll_cursor: Option<String>,
}

impl SyncCore {
    fn reset(&mut self) {
        let old = std::mem::take(&mut self.session);
        self.pending.clear();
        self.mirror = None;
        self.assets.clear();
        self.covers.clear();
        self.channel.reset();
        self.poll_cursor = None;
        tracing::info!(
            old_session = old.id(),
            old_age_secs = old.age().as_secs(),
            new_session = self.session.id(),
            "session reset"
        );
    }

    /// Recompute required/needed covers from the mirror and announce any
    /// newly needed keys.
    fn refresh_assets(&mut self) {
        let required = self
            .mirror
            .as_ref()
            .map(StateMirror::required_assets)
            .unwrap_or_default();
        self.assets.recompute(required);

        let assets = &self.assets;
        self.covers.retain(|key, _| assets.is_loaded(key));

        let announced = self.channel.notify_needed_changed(self.assets.needed());
        if announced > 0 {
            tracing::info!(
                announced,
                subscribers = self.channel.subscriber_count(),
                "new covers needed"
            );
        }
    }

    /// The needed key after the one last handed to a long-poll, wrapping
    /// around. A key no producer can serve never hides the others.
    fn next_poll_key(&mut self) -> Option<String> {
        let needed = self.assets.needed();
        let next = match &self.poll_cursor {
            Some(last) => needed
                .range::<str, _>((Bound::Excluded(last.as_str()), Bound::Unbounded))
                .next()
                .or_else(|| needed.iter().next()),
            None => needed.iter().next(),
        }
        .cloned();
        if next.is_some() {
            self.poll_cursor = next.clone();
        }
        next
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            session_id: self.session.id().to_owned(),
            initialized: self.mirror.is_some(),
            state: self.mirror.as_ref().map(|m| m.fields().clone()),
            required: self.assets.required().iter().cloned().collect(),
            loaded: self.assets.loaded().iter().cloned().collect(),
            needed: self.assets.needed().iter().cloned().collect(),
        }
    }
}

/// Shared handle to the session state. Cheap to clone.
#[derive(Clone)]
pub struct SyncState {
    inner: Arc<RwLock<SyncCore>>,
    events_tx: broadcast::Sender<MirrorEvent>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(SyncOptions::default())
    }
}

impl SyncState {
    /// Create the state with a fresh session.
    pub fn new(options: SyncOptions) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = Session::new();
        tracing::info!(session_id = session.id(), "session created");
        Self {
            inner: Arc::new(RwLock::new(SyncCore {
                session,
                debug_logging: options.debug_logging,
                pending: PendingUpdates::new(options.max_queue),
                mirror: None,
                assets: AssetTracker::new(),
                covers: HashMap::new(),
                channel: CoverChannel::new(),
                poll_cursor: None,
            })),
            events_tx,
        }
    }

    /// Disclose the live session. Never mutates anything.
    pub fn connect(&self) -> ConnectResponse {
        let core = self.inner.read();
        ConnectResponse {
            session_id: core.session.id().to_owned(),
            debug_logging: core.debug_logging,
        }
    }

    pub fn current_id(&self) -> String {
        self.inner.read().session.id().to_owned()
    }

    pub fn is_current(&self, token: &str) -> bool {
        self.inner.read().session.matches(token)
    }

    pub fn debug_logging(&self) -> bool {
        self.inner.read().debug_logging
    }

    /// Replace the live session, discarding all mirrored state. Optionally
    /// changes the debug-logging flag handed out by `connect`.
    pub fn reset(&self, debug_logging: Option<bool>) -> String {
        let mut core = self.inner.write();
        if let Some(flag) = debug_logging {
            core.debug_logging = flag;
        }
        core.reset();
        let id = core.session.id().to_owned();
        self.emit(MirrorEvent::Reset {
            session_id: id.clone(),
        });
        id
    }

    /// Establish the mirror from a full snapshot, replay buffered updates
    /// onto it, and announce the covers it needs.
    pub fn init(&self, session_id: &str, state: FieldMap, timestamp: Option<u64>) -> Ack {
        let mut core = self.inner.write();
        if !core.session.matches(session_id) {
            tracing::debug!(session_id, "init for stale session ignored");
            return Ack {
                session_id: core.session.id().to_owned(),
                disposition: Disposition::Stale,
            };
        }

        let mut mirror = StateMirror::from_snapshot(state);
        let replayed = core.pending.drain_into(&mut mirror);
        let time_offset_ms = timestamp.map(clock_offset_ms);
        tracing::info!(
            session_id,
            fields = mirror.len(),
            replayed,
            time_offset_ms = ?time_offset_ms,
            "session initialized"
        );

        self.emit(MirrorEvent::Initialized {
            session_id: session_id.to_owned(),
            time_offset_ms,
            state: mirror.fields().clone(),
        });
        core.mirror = Some(mirror);
        core.refresh_assets();

        Ack {
            session_id: session_id.to_owned(),
            disposition: Disposition::Initialized,
        }
    }

    /// Apply a single field update, or buffer it if the session has not
    /// been initialized yet.
    pub fn update(&self, session_id: &str, field: &str, value: Value) -> Ack {
        let mut core = self.inner.write();
        if !core.session.matches(session_id) {
            tracing::debug!(session_id, field, "update for stale session ignored");
            return Ack {
                session_id: core.session.id().to_owned(),
                disposition: Disposition::Stale,
            };
        }

        let core = &mut *core;
        let disposition = match core.mirror.as_mut() {
            None => match core.pending.offer(field, value) {
                Offer::Buffered => {
                    tracing::debug!(field, queued = core.pending.len(), "update buffered before init");
                    Disposition::Buffered
                }
                Offer::Overflow => {
                    tracing::warn!(
                        limit = core.pending.limit(),
                        "too many updates before init, resetting session"
                    );
                    core.reset();
                    self.emit(MirrorEvent::Reset {
                        session_id: core.session.id().to_owned(),
                    });
                    Disposition::Reset
                }
            },
            Some(mirror) => {
                if mirror.apply(field, value.clone()) {
                    self.emit(MirrorEvent::Updated {
                        field: field.to_owned(),
                        value,
                    });
                    core.refresh_assets();
                    Disposition::Applied
                } else {
                    Disposition::Unchanged
                }
            }
        };

        Ack {
            session_id: core.session.id().to_owned(),
            disposition,
        }
    }

    /// Register a cover producer. It is immediately handed every key that is
    /// currently needed.
    pub fn subscribe(&self) -> Subscription {
        self.inner.write().channel.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.write().channel.unsubscribe(id);
    }

    /// Start a cover long-poll: the next needed key in rotation, or a
    /// subscription for the next need when nothing is needed.
    pub fn poll_cover(&self) -> CoverPoll {
        let mut core = self.inner.write();
        match core.next_poll_key() {
            Some(key) => CoverPoll::Ready(key),
            None => CoverPoll::Wait(core.channel.subscribe()),
        }
    }

    /// Record a key handed to a waiting long-poll.
    pub fn note_polled(&self, key: &str) {
        self.inner.write().poll_cursor = Some(key.to_owned());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().channel.subscriber_count()
    }

    /// Store uploaded cover data for `key` if the key is still required.
    ///
    /// Idempotent per key: a repeated upload replaces the stored data.
    pub fn mark_loaded(&self, key: &str, data: Bytes) -> LoadOutcome {
        let mut core = self.inner.write();
        if !core.assets.mark_loaded(key) {
            tracing::debug!(path = key, "cover no longer required, discarded");
            return LoadOutcome::NotRequired;
        }

        tracing::info!(path = key, bytes = data.len(), "cover received");
        core.covers.insert(key.to_owned(), data);
        let core = &mut *core;
        core.channel.notify_needed_changed(core.assets.needed());
        self.emit(MirrorEvent::CoverLoaded {
            path: key.to_owned(),
        });
        LoadOutcome::Accepted
    }

    /// Loaded cover data for `key`.
    pub fn cover(&self, key: &str) -> Option<Bytes> {
        self.inner.read().covers.get(key).cloned()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.read().snapshot()
    }

    /// Forward a controller log line to the log and to displays.
    pub fn log(&self, message: String) {
        tracing::info!(target: "decksync::controller", "{}", message);
        self.emit(MirrorEvent::Log { message });
    }

    /// Subscribe to display events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events_tx.subscribe()
    }

    /// Snapshot and event receiver taken atomically, so no event between
    /// the two is missed or duplicated.
    pub fn attach_display(&self) -> (StateSnapshot, broadcast::Receiver<MirrorEvent>) {
        let core = self.inner.read();
        (core.snapshot(), self.events_tx.subscribe())
    }

    fn emit(&self, event: MirrorEvent) {
        // No displays attached is fine.
        let _ = self.events_tx.send(event);
    }
}
