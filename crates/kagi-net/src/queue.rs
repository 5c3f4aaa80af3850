//! Bounded per-peer message queues.
//!
//! While a peer is reconnecting, outbound frames wait here. The queue is a
//! FIFO capped at [`MAX_QUEUE`]; when full, the *incoming* frame is the one
//! dropped, so the frames that do survive keep their original sequence.

use std::collections::BTreeSet;

use tracing::warn;

/// Cap on queued frames per peer.
pub const MAX_QUEUE: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: String,
    pub hints: BTreeSet<String>,
}

#[derive(Default)]
pub struct MessageQueue {
    items: Vec<QueuedMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame; returns false (dropping the frame) when full.
    pub fn enqueue(&mut self, message: String, hints: BTreeSet<String>) -> bool {
        if self.items.len() >= MAX_QUEUE {
            warn!(queued = self.items.len(), "queue full, dropping newest frame");
            return false;
        }
        self.items.push(QueuedMessage { message, hints });
        true
    }

    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    /// Put frames back at the head, preserving their original order ahead
    /// of everything queued since. Used when a flush fails partway.
    pub fn requeue_front(&mut self, mut messages: Vec<QueuedMessage>) {
        messages.append(&mut self.items);
        self.items = messages;
        if self.items.len() > MAX_QUEUE {
            // over-cap from a failed flush keeps the oldest frames
            self.items.truncate(MAX_QUEUE);
        }
    }

    /// Every hint attached to any queued frame.
    pub fn all_hints(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .flat_map(|m| m.hints.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
