use std::collections::VecDeque;

use serde_json::Value;

use crate::mirror::StateMirror;

/// Default bound on updates buffered before the first `init`.
pub const MAX_QUEUE: usize = 20;

/// A field update that arrived before the session was initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub field: String,
    pub value: Value,
}

/// Result of offering an update to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Buffered,
    /// The buffer grew past its bound. The caller must reset the session.
    Overflow,
}

/// Updates received in the pre-init window, kept in arrival order.
#[derive(Debug)]
pub struct PendingUpdates {
    queue: VecDeque<PendingUpdate>,
    limit: usize,
}

impl PendingUpdates {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit,
        }
    }

    /// Append an update. Reports `Overflow` once the length exceeds the limit.
    pub fn offer(&mut self, field: impl Into<String>, value: Value) -> Offer {
        self.queue.push_back(PendingUpdate {
            field: field.into(),
            value,
        });
        if self.queue.len() > self.limit {
            Offer::Overflow
        } else {
            Offer::Buffered
        }
    }

    /// Apply every buffered update to `mirror` in arrival order, then empty
    /// the buffer. Returns the number of updates replayed.
    pub fn drain_into(&mut self, mirror: &mut StateMirror) -> usize {
        let count = self.queue.len();
        for update in self.queue.drain(..) {
            mirror.apply(update.field, update.value);
        }
        count
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingUpdate> {
        self.queue.iter()
    }
}

impl Default for PendingUpdates {
    fn default() -> Self {
        Self::new(MAX_QUEUE)
    }
}
